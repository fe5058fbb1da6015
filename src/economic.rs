//! Emission schedule and block-size reward penalty.

use crate::constants::{BLOCK_GRANTED_FULL_REWARD_ZONE, EMISSION_SPEED_FACTOR, MONEY_SUPPLY};
use crate::error::{ConsensusError, Result};

/// Base reward plus size penalty for the next block.
///
/// The base reward halves smoothly: each block earns a fixed fraction of the
/// coins not yet emitted. Blocks at or below the effective median size earn
/// the full base reward. Blocks between one and two medians earn a
/// quadratically shrinking share. Blocks above twice the median are invalid.
pub fn get_block_reward(
    median_size: u64,
    current_block_size: u64,
    already_generated_coins: u64,
) -> Result<u64> {
    let base_reward = (MONEY_SUPPLY - already_generated_coins) >> EMISSION_SPEED_FACTOR;

    let median_size = median_size.max(BLOCK_GRANTED_FULL_REWARD_ZONE);
    if current_block_size <= median_size {
        return Ok(base_reward);
    }
    if current_block_size > 2 * median_size {
        return Err(ConsensusError::BlockTooLarge {
            size: current_block_size,
            median: median_size,
        });
    }

    // reward = base * (2*median - size) * size / median^2, exact in 128 bits.
    let multiplicand = (2 * median_size - current_block_size) as u128 * current_block_size as u128;
    let product = base_reward as u128 * multiplicand / median_size as u128;
    Ok((product / median_size as u128) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_reward_at_zero_emission() {
        let reward = get_block_reward(0, 0, 0).unwrap();
        assert_eq!(reward, MONEY_SUPPLY >> EMISSION_SPEED_FACTOR);
    }

    #[test]
    fn reward_decreases_as_coins_are_generated() {
        let early = get_block_reward(0, 0, 0).unwrap();
        let late = get_block_reward(0, 0, MONEY_SUPPLY / 2).unwrap();
        assert!(late < early);
        assert_eq!(late, (MONEY_SUPPLY / 2 + 1) >> EMISSION_SPEED_FACTOR);
    }

    #[test]
    fn small_median_is_floored_to_full_reward_zone() {
        // A block inside the full-reward zone pays in full even when the
        // historical median is tiny.
        let full = get_block_reward(1, BLOCK_GRANTED_FULL_REWARD_ZONE, 0).unwrap();
        assert_eq!(full, MONEY_SUPPLY >> EMISSION_SPEED_FACTOR);
    }

    #[test]
    fn penalty_is_quadratic_between_one_and_two_medians() {
        let median = BLOCK_GRANTED_FULL_REWARD_ZONE;
        let full = get_block_reward(median, median, 0).unwrap();

        // At 1.5 medians the reward factor is (2m - 1.5m) * 1.5m / m^2 = 0.75.
        let penalized = get_block_reward(median, median * 3 / 2, 0).unwrap();
        assert_eq!(penalized, full * 3 / 4);

        // At exactly 2 medians the factor reaches zero.
        let zero = get_block_reward(median, median * 2, 0).unwrap();
        assert_eq!(zero, 0);
    }

    #[test]
    fn oversized_block_is_rejected() {
        let median = BLOCK_GRANTED_FULL_REWARD_ZONE;
        let err = get_block_reward(median, median * 2 + 1, 0).unwrap_err();
        assert!(matches!(err, ConsensusError::BlockTooLarge { .. }));
    }
}
