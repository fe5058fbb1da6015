//! Consensus constants.

/// Total money supply in atomic units.
pub const MONEY_SUPPLY: u64 = u64::MAX;

/// Emission speed: base reward = (supply - generated) >> factor.
pub const EMISSION_SPEED_FACTOR: u32 = 18;

/// Target seconds between blocks.
pub const DIFFICULTY_TARGET: u64 = 120;

/// Number of samples fed to the difficulty algorithm.
pub const DIFFICULTY_WINDOW: usize = 720;

/// Outlier timestamps trimmed from each end of the sorted window.
pub const DIFFICULTY_CUT: usize = 60;

/// Extra trailing samples collected beyond the window.
pub const DIFFICULTY_LAG: usize = 15;

/// Samples gathered from the chain for a difficulty computation.
pub const DIFFICULTY_BLOCKS_COUNT: usize = DIFFICULTY_WINDOW + DIFFICULTY_LAG;

/// Blocks a coinbase output stays locked after being mined.
pub const COINBASE_UNLOCK_WINDOW: u64 = 60;

/// Number of historical timestamps required before the median rule applies.
pub const TIMESTAMP_CHECK_WINDOW: usize = 60;

/// How far into the future a block timestamp may run (two hours).
pub const BLOCK_FUTURE_TIME_LIMIT: u64 = 60 * 60 * 2;

/// Trailing block-size window used for the reward penalty median and the
/// cumulative size limit.
pub const REWARD_BLOCKS_WINDOW: usize = 100;

/// Block size up to which the full base reward is granted.
pub const BLOCK_GRANTED_FULL_REWARD_ZONE: u64 = 20_000;

/// Unlock times below this value are block heights; at or above, UNIX time.
pub const MAX_BLOCK_NUMBER: u64 = 500_000_000;

/// Height slack allowed when deciding whether a height-locked output is
/// spendable.
pub const LOCKED_TX_ALLOWED_DELTA_BLOCKS: u64 = 1;

/// Time slack allowed when deciding whether a time-locked output is spendable.
pub const LOCKED_TX_ALLOWED_DELTA_SECONDS: u64 =
    DIFFICULTY_TARGET * LOCKED_TX_ALLOWED_DELTA_BLOCKS;

/// Maximum block ids returned to a single chain-sync request.
pub const BLOCK_IDS_SYNCHRONIZING_DEFAULT_COUNT: usize = 10_000;

/// Current block versions stamped onto templates.
pub const CURRENT_BLOCK_MAJOR_VERSION: u8 = 1;
pub const CURRENT_BLOCK_MINOR_VERSION: u8 = 0;

/// Transaction version produced by this node.
pub const CURRENT_TRANSACTION_VERSION: u64 = 1;

/// Attempts at sizing the coinbase when building a block template.
pub const BLOCK_TEMPLATE_MINER_TX_TRIES: usize = 10;

/// Bytes reserved for the coinbase when filling a block template from the
/// memory pool.
pub const COINBASE_BLOB_RESERVED_SIZE: u64 = 600;
