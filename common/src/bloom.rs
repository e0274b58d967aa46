//! Probabilistic recipient set used to suppress repeated advertisements.
use std::io::Cursor;

use murmur3::murmur3_32;

/// Size of the bit array in bytes.
pub const FILTER_SIZE: usize = 64;
/// Number of hash rounds applied per element. At half fill this gives a
/// false-positive probability of roughly 3%.
pub const HASH_ROUNDS: u32 = 5;

const HASH_SPREAD: u64 = 0xFBA4C795;

/// A fixed-size bloom filter over arbitrary byte strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    /// The bit array.
    content: [u8; FILTER_SIZE],
    /// Per-filter hash seed.
    tweak: u32,
}

impl BloomFilter {
    /// Create an empty filter with the given hash seed.
    pub fn new(tweak: u32) -> Self {
        Self {
            content: [0; FILTER_SIZE],
            tweak,
        }
    }

    fn bit_index(&self, round: u32, data: &[u8]) -> usize {
        let seed = (round as u64 * HASH_SPREAD + self.tweak as u64) as u32;
        let hash = murmur3_32(&mut Cursor::new(data), seed).unwrap_or(0);

        hash as usize % (FILTER_SIZE * 8)
    }

    /// Add an element to the filter.
    pub fn insert(&mut self, data: &[u8]) {
        for round in 0..HASH_ROUNDS {
            let index = self.bit_index(round, data);
            self.content[index >> 3] |= 1 << (index & 7);
        }
    }

    /// Check whether an element may be in the filter. False positives are
    /// possible, false negatives are not.
    pub fn contains(&self, data: &[u8]) -> bool {
        for round in 0..HASH_ROUNDS {
            let index = self.bit_index(round, data);
            if self.content[index >> 3] & (1 << (index & 7)) == 0 {
                return false;
            }
        }
        true
    }

    /// Reset the filter to empty.
    pub fn clear(&mut self) {
        self.content = [0; FILTER_SIZE];
    }

    /// Number of set bits, as a cheap fill estimate.
    pub fn fill(&self) -> u32 {
        self.content.iter().map(|b| b.count_ones()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::QuickCheck;

    #[test]
    fn test_insert_contains() {
        let mut filter = BloomFilter::new(123123);
        let peer = [0xab; 32];

        assert!(!filter.contains(&peer));
        filter.insert(&peer);
        assert!(filter.contains(&peer));

        filter.clear();
        assert!(!filter.contains(&peer));
        assert_eq!(filter.fill(), 0);
    }

    #[test]
    fn test_no_false_negatives() {
        fn prop(items: Vec<Vec<u8>>, tweak: u32) -> bool {
            let mut filter = BloomFilter::new(tweak);
            for item in &items {
                filter.insert(item);
            }
            items.iter().all(|item| filter.contains(item))
        }
        QuickCheck::new()
            .tests(100)
            .quickcheck(prop as fn(Vec<Vec<u8>>, u32) -> bool);
    }

    #[test]
    fn test_false_positive_rate_at_half_fill() {
        let mut rng = fastrand::Rng::with_seed(42);
        let mut filter = BloomFilter::new(rng.u32(..));

        // Insert until roughly half the bits are set.
        let mut inserted = Vec::new();
        while filter.fill() < (FILTER_SIZE * 8 / 2) as u32 {
            let item: [u8; 32] = std::array::from_fn(|_| rng.u8(..));
            filter.insert(&item);
            inserted.push(item);
        }

        let mut false_positives = 0;
        let trials = 10_000;
        for _ in 0..trials {
            let probe: [u8; 32] = std::array::from_fn(|_| rng.u8(..));
            if !inserted.contains(&probe) && filter.contains(&probe) {
                false_positives += 1;
            }
        }
        // ~3% expected; allow generous slack to keep the test stable.
        assert!(
            false_positives < trials / 10,
            "false positive rate too high: {}/{}",
            false_positives,
            trials
        );
    }
}
