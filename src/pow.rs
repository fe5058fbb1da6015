//! Proof-of-work seam and difficulty check.

use crate::hashing::double_sha256;
use crate::types::{Difficulty, Hash};

/// Slow-hash function for proof of work.
///
/// The production hash is memory-hard and lives outside this crate; consensus
/// code only needs the mapping from a block hashing blob to a 256-bit value.
pub trait PowHasher {
    fn hash(&self, hashing_blob: &[u8]) -> Hash;
}

/// Default hasher. Not memory-hard, but deterministic and uniformly
/// distributed, which is all the consensus rules themselves rely on.
#[derive(Debug, Default, Clone, Copy)]
pub struct DoubleSha256Pow;

impl PowHasher for DoubleSha256Pow {
    fn hash(&self, hashing_blob: &[u8]) -> Hash {
        double_sha256(hashing_blob)
    }
}

/// True if `hash` (little-endian 256-bit) satisfies `difficulty`.
///
/// The test is `hash * difficulty < 2^256`, evaluated with limb arithmetic:
/// any carry into the limbs above the 256th bit means the work is too weak.
pub fn check_hash(hash: &Hash, difficulty: Difficulty) -> bool {
    let mut h = [0u64; 4];
    for (i, limb) in h.iter_mut().enumerate() {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash[i * 8..(i + 1) * 8]);
        *limb = u64::from_le_bytes(bytes);
    }
    let d = [difficulty as u64, (difficulty >> 64) as u64];

    // 4x2 limb schoolbook multiply; only the top limbs of the product matter.
    let mut product = [0u64; 6];
    for i in 0..4 {
        let mut carry = 0u128;
        for j in 0..2 {
            let cur = product[i + j] as u128 + h[i] as u128 * d[j] as u128 + carry;
            product[i + j] = cur as u64;
            carry = cur >> 64;
        }
        let mut k = i + 2;
        while carry != 0 && k < 6 {
            let cur = product[k] as u128 + carry;
            product[k] = cur as u64;
            carry = cur >> 64;
            k += 1;
        }
    }
    product[4] == 0 && product[5] == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_hash_passes_unit_difficulty() {
        assert!(check_hash(&[0xff; 32], 1));
        assert!(check_hash(&[0x00; 32], 1));
    }

    #[test]
    fn zero_hash_passes_any_difficulty() {
        assert!(check_hash(&[0x00; 32], Difficulty::MAX));
    }

    #[test]
    fn max_hash_fails_difficulty_two() {
        assert!(!check_hash(&[0xff; 32], 2));
    }

    #[test]
    fn boundary_at_difficulty_four() {
        // hash = 2^254 => hash * 4 == 2^256, which overflows and fails.
        let mut at_boundary = [0u8; 32];
        at_boundary[31] = 0x40;
        assert!(!check_hash(&at_boundary, 4));

        // hash = 2^254 - 1 => hash * 4 < 2^256.
        let mut below = [0xffu8; 32];
        below[31] = 0x3f;
        assert!(check_hash(&below, 4));
    }

    #[test]
    fn wide_difficulty_uses_the_high_limb() {
        // hash = 2^192 multiplied by a difficulty just above 2^64 overflows.
        let mut hash = [0u8; 32];
        hash[24] = 0x01;
        assert!(check_hash(&hash, u64::MAX as Difficulty));
        assert!(!check_hash(&hash, (1u128 << 64) + 1));
    }
}
