//! Stateless block and miner-transaction checks.
//!
//! Everything here is a pure function over a block and a slice of chain
//! history handed in by the caller; the stateful engine decides which
//! history to supply.

use crate::constants::{
    BLOCK_FUTURE_TIME_LIMIT, COINBASE_UNLOCK_WINDOW, LOCKED_TX_ALLOWED_DELTA_BLOCKS,
    LOCKED_TX_ALLOWED_DELTA_SECONDS, MAX_BLOCK_NUMBER, TIMESTAMP_CHECK_WINDOW,
};
use crate::economic::get_block_reward;
use crate::error::{ConsensusError, Result};
use crate::transaction::get_outs_money_amount;
use crate::types::{Block, TxInput};

/// Median of a set of values; zero for the empty set.
///
/// For an even count this is the floor of the mean of the two middle
/// elements.
pub fn median(mut values: Vec<u64>) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.sort_unstable();
    let n = values.len();
    if n % 2 == 0 {
        (values[n / 2 - 1] + values[n / 2]) / 2
    } else {
        values[n / 2]
    }
}

/// Reject timestamps beyond the allowed clock skew.
pub fn check_timestamp_not_in_future(block_timestamp: u64, now: u64) -> Result<()> {
    let limit = now + BLOCK_FUTURE_TIME_LIMIT;
    if block_timestamp > limit {
        return Err(ConsensusError::TimestampTooFarInFuture {
            actual: block_timestamp,
            limit,
        });
    }
    Ok(())
}

/// Median rule: with a full window of predecessor timestamps, a block may not
/// be older than their median. Shorter histories are exempt.
pub fn check_block_timestamp(timestamps: Vec<u64>, block_timestamp: u64) -> Result<()> {
    if timestamps.len() < TIMESTAMP_CHECK_WINDOW {
        return Ok(());
    }
    let median_ts = median(timestamps);
    if block_timestamp < median_ts {
        return Err(ConsensusError::TimestampBelowMedian {
            actual: block_timestamp,
            median: median_ts,
        });
    }
    Ok(())
}

/// Checks on the miner transaction that need no chain state beyond the
/// block's height: input shape, unlock window, output overflow.
pub fn prevalidate_miner_tx(block: &Block, height: u64) -> Result<()> {
    let tx = &block.miner_tx;
    if tx.inputs.len() != 1 {
        return Err(ConsensusError::InvalidMinerTransaction(format!(
            "expected exactly one input, got {}",
            tx.inputs.len()
        )));
    }
    match tx.inputs[0] {
        TxInput::Gen { height: in_height } => {
            if in_height != height {
                return Err(ConsensusError::InvalidMinerTransaction(format!(
                    "input height {} does not match block height {}",
                    in_height, height
                )));
            }
        }
        TxInput::ToKey { .. } => {
            return Err(ConsensusError::InvalidMinerTransaction(
                "input is not a generation input".into(),
            ));
        }
    }
    if tx.unlock_time != height + COINBASE_UNLOCK_WINDOW {
        return Err(ConsensusError::InvalidMinerTransaction(format!(
            "unlock time {} differs from height + unlock window {}",
            tx.unlock_time,
            height + COINBASE_UNLOCK_WINDOW
        )));
    }
    // Overflow in the output sum is a hard reject.
    get_outs_money_amount(tx)?;
    Ok(())
}

/// Full miner-transaction check: the outputs must claim exactly the base
/// reward for this block size plus the fees of the member transactions.
/// Under-claiming would silently burn coins and desynchronize the emission
/// counter, so it is rejected just like over-claiming.
pub fn validate_miner_tx(
    block: &Block,
    cumulative_block_size: u64,
    median_block_size: u64,
    already_generated_coins: u64,
    fee: u64,
) -> Result<u64> {
    let money_in_use = get_outs_money_amount(&block.miner_tx)?;
    let base_reward = get_block_reward(
        median_block_size,
        cumulative_block_size,
        already_generated_coins,
    )?;
    let reward_total = base_reward
        .checked_add(fee)
        .ok_or(ConsensusError::OutputOverflow)?;
    if money_in_use > reward_total {
        return Err(ConsensusError::MinerRewardTooLarge {
            reward: money_in_use,
            expected: reward_total,
        });
    }
    if money_in_use < reward_total {
        return Err(ConsensusError::MinerRewardTooSmall {
            reward: money_in_use,
            expected: reward_total,
        });
    }
    Ok(base_reward)
}

/// True if an output with this unlock time may be spent in the block at
/// `next_block_height` (height-based locks) or at wall-clock `now`
/// (time-based locks).
pub fn is_tx_spendtime_unlocked(unlock_time: u64, next_block_height: u64, now: u64) -> bool {
    if unlock_time < MAX_BLOCK_NUMBER {
        next_block_height + LOCKED_TX_ALLOWED_DELTA_BLOCKS - 1 >= unlock_time
    } else {
        now + LOCKED_TX_ALLOWED_DELTA_SECONDS >= unlock_time
    }
}
