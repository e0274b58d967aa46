//! Hash collections seeded from the protocol's randomness source, so that
//! iteration order is unpredictable to remote peers yet reproducible in
//! tests run with a fixed seed.
use std::hash::{BuildHasher, Hasher};

/// A `HashMap` keyed with a random seed.
pub type HashMap<K, V> = std::collections::HashMap<K, V, RandomState>;
/// A `HashSet` keyed with a random seed.
pub type HashSet<K> = std::collections::HashSet<K, RandomState>;

/// Seeded FNV-1a hasher state.
#[derive(Debug, Clone)]
pub struct RandomState {
    key: u64,
}

impl RandomState {
    fn new(key: u64) -> Self {
        Self { key }
    }
}

impl BuildHasher for RandomState {
    type Hasher = FnvHasher;

    fn build_hasher(&self) -> Self::Hasher {
        FnvHasher { state: self.key }
    }
}

impl From<fastrand::Rng> for RandomState {
    fn from(rng: fastrand::Rng) -> Self {
        Self::new(rng.u64(..))
    }
}

/// Fowler–Noll–Vo hasher mixed with a per-map random key.
#[derive(Debug, Default)]
pub struct FnvHasher {
    state: u64,
}

impl Hasher for FnvHasher {
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        const PRIME: u64 = 0x100000001b3;

        for byte in bytes {
            self.state ^= u64::from(*byte);
            self.state = self.state.wrapping_mul(PRIME);
        }
    }
}

/// Create an empty seeded map.
pub fn hash_map<K, V>(rng: fastrand::Rng) -> HashMap<K, V> {
    HashMap::with_hasher(rng.into())
}

/// Create an empty seeded set.
pub fn hash_set<K>(rng: fastrand::Rng) -> HashSet<K> {
    HashSet::with_hasher(rng.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_maps_agree_with_themselves() {
        let mut map = hash_map::<u32, &str>(fastrand::Rng::with_seed(1));
        map.insert(1, "one");
        map.insert(2, "two");

        assert_eq!(map.get(&1), Some(&"one"));
        assert_eq!(map.get(&2), Some(&"two"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_hasher_mixes_key() {
        let a = RandomState::new(1).build_hasher();
        let b = RandomState::new(2).build_hasher();

        assert_ne!(a.finish(), b.finish());
    }
}
