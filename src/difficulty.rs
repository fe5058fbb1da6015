//! Difficulty retargeting.
//!
//! The next difficulty is derived from a trailing window of block timestamps
//! and cumulative difficulties. Timestamps are sorted and the outermost
//! outliers cut before measuring the real time span, so a handful of wildly
//! wrong clocks cannot swing the target.

use crate::constants::{DIFFICULTY_CUT, DIFFICULTY_TARGET, DIFFICULTY_WINDOW};
use crate::types::Difficulty;

/// Difficulty for the block after the one whose samples close the slices.
///
/// Both slices run oldest to newest and must be the same length; entries
/// beyond `DIFFICULTY_WINDOW` at the newest end are ignored.
pub fn next_difficulty(
    mut timestamps: Vec<u64>,
    mut cumulative_difficulties: Vec<Difficulty>,
) -> Difficulty {
    assert_eq!(timestamps.len(), cumulative_difficulties.len());
    if timestamps.len() > DIFFICULTY_WINDOW {
        timestamps.truncate(DIFFICULTY_WINDOW);
        cumulative_difficulties.truncate(DIFFICULTY_WINDOW);
    }
    let length = timestamps.len();
    if length <= 1 {
        return 1;
    }

    timestamps.sort_unstable();

    let (cut_begin, cut_end) = if length <= DIFFICULTY_WINDOW - 2 * DIFFICULTY_CUT {
        (0, length)
    } else {
        let kept = DIFFICULTY_WINDOW - 2 * DIFFICULTY_CUT;
        let begin = (length - kept + 1) / 2;
        (begin, begin + kept)
    };

    let time_span = (timestamps[cut_end - 1] - timestamps[cut_begin]).max(1);
    let total_work = cumulative_difficulties[cut_end - 1] - cumulative_difficulties[cut_begin];

    (total_work * DIFFICULTY_TARGET as Difficulty + time_span as Difficulty - 1)
        / time_span as Difficulty
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_and_single_block_get_unit_difficulty() {
        assert_eq!(next_difficulty(vec![], vec![]), 1);
        assert_eq!(next_difficulty(vec![1000], vec![1]), 1);
    }

    #[test]
    fn on_target_spacing_keeps_difficulty_steady() {
        // Ten blocks exactly DIFFICULTY_TARGET apart, each worth 100 work.
        let timestamps: Vec<u64> = (0..10).map(|i| i * DIFFICULTY_TARGET).collect();
        let cumulative: Vec<Difficulty> = (1..=10).map(|i| i * 100).collect();
        assert_eq!(next_difficulty(timestamps, cumulative), 100);
    }

    #[test]
    fn faster_blocks_raise_difficulty() {
        let timestamps: Vec<u64> = (0..10).map(|i| i * (DIFFICULTY_TARGET / 2)).collect();
        let cumulative: Vec<Difficulty> = (1..=10).map(|i| i * 100).collect();
        assert_eq!(next_difficulty(timestamps, cumulative), 200);
    }

    #[test]
    fn unsorted_timestamps_are_handled() {
        let sorted: Vec<u64> = (0..10).map(|i| i * DIFFICULTY_TARGET).collect();
        let mut shuffled = sorted.clone();
        shuffled.swap(2, 7);
        shuffled.swap(0, 9);
        let cumulative: Vec<Difficulty> = (1..=10).map(|i| i * 100).collect();
        assert_eq!(
            next_difficulty(shuffled, cumulative.clone()),
            next_difficulty(sorted, cumulative)
        );
    }

    #[test]
    fn zero_time_span_does_not_divide_by_zero() {
        let timestamps = vec![500, 500, 500];
        let cumulative = vec![10, 20, 30];
        assert_eq!(
            next_difficulty(timestamps, cumulative),
            20 * DIFFICULTY_TARGET as Difficulty
        );
    }
}
