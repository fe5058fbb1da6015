//! Consensus and ledger core for a CryptoNote-style chain.
//!
//! The crate keeps the entire confirmed chain in memory and enforces the
//! consensus rules over it: proof of work against a retargeted difficulty,
//! timestamp sanity, coinbase emission with the block-size penalty, key-image
//! double-spend tracking, trusted checkpoints, and heaviest-chain fork
//! choice with full reorganization support.
//!
//! Three seams connect it to the rest of a node:
//!
//! - [`pool::TxMemoryPool`] supplies and receives transaction bodies as
//!   blocks connect and disconnect (a reference in-memory implementation is
//!   included);
//! - [`pow::PowHasher`] maps a block hashing blob to its proof-of-work hash;
//! - [`chain::RingSignatureVerifier`] checks ring signatures.
//!
//! The entry point is [`chain::Blockchain`]; feed it blocks with
//! [`chain::Blockchain::add_block`] and it reports one of the
//! [`types::BlockAddResult`] outcomes or a structured rejection.

pub mod chain;
pub mod checkpoints;
pub mod constants;
pub mod difficulty;
pub mod economic;
pub mod error;
pub mod hashing;
pub mod ledger;
pub mod pool;
pub mod pow;
pub mod transaction;
pub mod types;
pub mod validate;

pub use chain::{Blockchain, RingSignatureVerifier};
pub use checkpoints::{Checkpoints, Network};
pub use error::{ConsensusError, Result};
pub use pool::{InMemoryPool, TxMemoryPool};
pub use pow::{DoubleSha256Pow, PowHasher};
pub use types::{
    Block, BlockAddResult, BlockHeader, ChainSupplement, Difficulty, ExtendedBlock, Hash,
    KeyImage, PublicKey, RandomOutputEntry, Signature, Transaction, TransactionChainEntry,
    TxInput, TxOutTarget, TxOutput, NULL_HASH,
};
