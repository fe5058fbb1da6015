//! Shared fixtures: stub proof-of-work and signature seams plus a chain
//! builder that tracks the emission schedule.

#![allow(dead_code)]

use ledger_core::chain::RingSignatureVerifier;
use ledger_core::checkpoints::Checkpoints;
use ledger_core::constants::{DIFFICULTY_TARGET, EMISSION_SPEED_FACTOR, MONEY_SUPPLY};
use ledger_core::hashing::block_hash;
use ledger_core::pool::InMemoryPool;
use ledger_core::pow::PowHasher;
use ledger_core::transaction::{construct_miner_tx, generate_genesis_block};
use ledger_core::types::{
    Block, BlockHeader, Hash, KeyImage, PublicKey, Signature, Transaction, TxInput, TxOutTarget,
    TxOutput,
};
use ledger_core::Blockchain;

/// Proof of work that always succeeds, whatever the difficulty.
pub struct ZeroPow;

impl PowHasher for ZeroPow {
    fn hash(&self, _hashing_blob: &[u8]) -> Hash {
        [0u8; 32]
    }
}

/// Proof of work that fails any difficulty above one.
pub struct WeakestPow;

impl PowHasher for WeakestPow {
    fn hash(&self, _hashing_blob: &[u8]) -> Hash {
        [0xffu8; 32]
    }
}

pub struct AcceptAllSignatures;

impl RingSignatureVerifier for AcceptAllSignatures {
    fn check_ring_signature(
        &self,
        _prefix_hash: &Hash,
        _key_image: &KeyImage,
        _ring: &[PublicKey],
        _signatures: &[Signature],
    ) -> bool {
        true
    }
}

pub struct RejectAllSignatures;

impl RingSignatureVerifier for RejectAllSignatures {
    fn check_ring_signature(
        &self,
        _prefix_hash: &Hash,
        _key_image: &KeyImage,
        _ring: &[PublicKey],
        _signatures: &[Signature],
    ) -> bool {
        false
    }
}

/// Base reward for the next block given the coins emitted so far.
pub fn reward_after(generated: u64) -> u64 {
    (MONEY_SUPPLY - generated) >> EMISSION_SPEED_FACTOR
}

pub fn new_chain() -> Blockchain<InMemoryPool> {
    chain_with_checkpoints(Checkpoints::new())
}

pub fn chain_with_checkpoints(checkpoints: Checkpoints) -> Blockchain<InMemoryPool> {
    Blockchain::new(
        InMemoryPool::new(),
        checkpoints,
        Box::new(ZeroPow),
        Box::new(AcceptAllSignatures),
        generate_genesis_block(),
    )
    .expect("genesis block must connect")
}

pub fn weak_pow_chain(checkpoints: Checkpoints) -> Blockchain<InMemoryPool> {
    Blockchain::new(
        InMemoryPool::new(),
        checkpoints,
        Box::new(WeakestPow),
        Box::new(AcceptAllSignatures),
        generate_genesis_block(),
    )
    .expect("genesis block must connect")
}

pub fn signature_rejecting_chain(checkpoints: Checkpoints) -> Blockchain<InMemoryPool> {
    Blockchain::new(
        InMemoryPool::new(),
        checkpoints,
        Box::new(ZeroPow),
        Box::new(RejectAllSignatures),
        generate_genesis_block(),
    )
    .expect("genesis block must connect")
}

/// A valid block on `parent` with the given member transaction hashes.
///
/// `generated_before` must equal the chain's emission total at the parent,
/// so the coinbase claims exactly the allowed reward.
pub fn block_on(
    parent: &Hash,
    height: u64,
    generated_before: u64,
    timestamp: u64,
    nonce: u32,
    tx_hashes: Vec<Hash>,
    fee: u64,
) -> Block {
    let miner_tx = construct_miner_tx(height, 0, generated_before, 0, fee, [0xaau8; 32], vec![])
        .expect("test coinbase parameters are valid");
    Block {
        header: BlockHeader {
            major_version: 1,
            minor_version: 0,
            timestamp,
            prev_id: *parent,
            nonce,
        },
        miner_tx,
        tx_hashes,
    }
}

/// One-input, one-output spend with a singleton ring.
pub fn spend_output(
    amount: u64,
    global_index: u64,
    key_image: KeyImage,
    out_amount: u64,
) -> Transaction {
    Transaction {
        version: 1,
        unlock_time: 0,
        inputs: vec![TxInput::ToKey {
            amount,
            key_offsets: vec![global_index],
            key_image,
        }],
        outputs: vec![TxOutput {
            amount: out_amount,
            target: TxOutTarget::ToKey { key: [0xbbu8; 32] },
        }],
        extra: vec![],
        signatures: vec![vec![[0u8; 64]]],
    }
}

/// Tracks parent hash, height, emission, and timestamps while a test builds
/// a chain block by block. Clone it to branch a fork from any point.
#[derive(Clone)]
pub struct ChainBuilder {
    pub parent: Hash,
    pub height: u64,
    pub generated: u64,
    pub timestamp: u64,
}

impl ChainBuilder {
    /// Positioned to build the block after genesis.
    pub fn after_genesis() -> Self {
        ChainBuilder {
            parent: block_hash(&generate_genesis_block()),
            height: 1,
            generated: reward_after(0),
            timestamp: 1_000,
        }
    }

    /// Build the next empty block and advance past it.
    pub fn next(&mut self, nonce: u32) -> Block {
        self.next_with_txs(nonce, vec![], 0)
    }

    /// Build the next block carrying `tx_hashes` and advance past it.
    pub fn next_with_txs(&mut self, nonce: u32, tx_hashes: Vec<Hash>, fee: u64) -> Block {
        let block = block_on(
            &self.parent,
            self.height,
            self.generated,
            self.timestamp,
            nonce,
            tx_hashes,
            fee,
        );
        self.parent = block_hash(&block);
        self.height += 1;
        self.generated += reward_after(self.generated);
        self.timestamp += DIFFICULTY_TARGET;
        block
    }
}
