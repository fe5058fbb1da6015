//! Error types for consensus validation.
//!
//! Every rejection a caller can recover from is a `ConsensusError` variant.
//! Unrecoverable ledger corruption (a failed purge or rollback) is not an
//! error value at all: those paths log at error level and panic, because the
//! in-memory state can no longer be trusted.

use thiserror::Error;

use crate::types::Hash;

/// Errors that can occur during block or transaction validation.
#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("block parent {0} not found")]
    OrphanBlock(String),

    #[error("block timestamp {actual} exceeds allowed future limit {limit}")]
    TimestampTooFarInFuture { actual: u64, limit: u64 },

    #[error("block timestamp {actual} is not above the median {median} of recent blocks")]
    TimestampBelowMedian { actual: u64, median: u64 },

    #[error("proof of work does not meet difficulty {difficulty}")]
    ProofOfWorkTooWeak { difficulty: u128 },

    #[error("alternative block at height {block_height} is below the last checkpoint covering height {checkpoint_height}")]
    AlternativeBlockBelowCheckpoint {
        block_height: u64,
        checkpoint_height: u64,
    },

    #[error("checkpoint at height {height} conflicts with an existing entry")]
    CheckpointConflict { height: u64 },

    #[error("malformed checkpoint record: {0}")]
    CheckpointParse(String),

    #[error("miner transaction invalid: {0}")]
    InvalidMinerTransaction(String),

    #[error("miner transaction claims {reward} but at most {expected} is allowed")]
    MinerRewardTooLarge { reward: u64, expected: u64 },

    #[error("miner transaction claims {reward} but must spend the full {expected}")]
    MinerRewardTooSmall { reward: u64, expected: u64 },

    #[error("block size {size} exceeds twice the median {median}")]
    BlockTooLarge { size: u64, median: u64 },

    #[error("transaction {0} not found in the memory pool")]
    TransactionNotInPool(String),

    #[error("transaction input invalid: {0}")]
    InvalidTransactionInput(String),

    #[error("key image already spent")]
    KeyImageAlreadySpent,

    #[error("ring signature verification failed for transaction {0}")]
    RingSignatureInvalid(String),

    #[error("referenced output is still locked")]
    OutputLocked,

    #[error("referenced output not found: amount {amount}, global index {global_index}")]
    OutputNotFound { amount: u64, global_index: u64 },

    #[error("output amounts overflow")]
    OutputOverflow,

    #[error("inputs {inputs} do not cover outputs {outputs}")]
    InputsBelowOutputs { inputs: u64, outputs: u64 },

    #[error("alternative chain data missing block {0}")]
    AlternativeChainBroken(String),

    #[error("chain history mismatch: {0}")]
    HistoryMismatch(String),

    #[error("reorganization failed at block {0}")]
    ReorganizationFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConsensusError>;

/// Short hex rendering of a hash for error and log messages.
pub fn hash_str(hash: &Hash) -> String {
    hex::encode(hash)
}
