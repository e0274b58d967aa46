//! Named counters reported to the statistics sink.
use std::collections::BTreeMap;

/// Addresses currently marked validated.
pub const VALIDATED_ADDRESSES: &str = "# peer addresses considered valid";
/// Neighbours dropped because their idle timer elapsed.
pub const TIMEOUT_DISCONNECTS: &str = "# disconnects due to timeout";
/// Bytes queued for neighbours but not yet handed to a carrier.
pub const BYTES_PENDING: &str = "# bytes pending with carriers";
/// Messages dropped because a neighbour exceeded its inbound quota.
pub const QUOTA_DROPS: &str = "# messages dropped (quota)";
/// Inbound quota overdraws observed.
pub const QUOTA_VIOLATIONS: &str = "# bandwidth quota violations";
/// PONG signatures that verified.
pub const PONGS_VERIFIED: &str = "# PONG signatures verified";
/// PONGs discarded for a bad signature, stale expiration or identity
/// mismatch.
pub const PONGS_DISCARDED: &str = "# PONG messages discarded";
/// PING challenges answered.
pub const PINGS_ANSWERED: &str = "# PING messages answered";
/// Malformed or misaddressed messages dropped.
pub const MALFORMED_DROPS: &str = "# messages dropped (malformed)";
/// Sessions handed to the kill queue.
pub const SESSIONS_KILLED: &str = "# sessions killed";
/// HELLOs written into outgoing frames by the advertiser.
pub const HELLOS_ADVERTISED: &str = "# HELLOs advertised";
/// Neighbours currently connected.
pub const CONNECTED_NEIGHBOURS: &str = "# peers connected";

/// The in-process statistics sink: a set of named counters, some monotonic,
/// some gauges.
#[derive(Debug, Default)]
pub struct Statistics {
    counters: BTreeMap<&'static str, u64>,
}

impl Statistics {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add to a counter.
    pub fn bump(&mut self, name: &'static str, delta: u64) {
        *self.counters.entry(name).or_insert(0) += delta;
    }

    /// Subtract from a gauge, saturating at zero.
    pub fn lower(&mut self, name: &'static str, delta: u64) {
        let value = self.counters.entry(name).or_insert(0);
        *value = value.saturating_sub(delta);
    }

    /// Overwrite a gauge.
    pub fn set(&mut self, name: &'static str, value: u64) {
        self.counters.insert(name, value);
    }

    /// Read a counter. Unknown counters read as zero.
    pub fn get(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    /// Snapshot all counters for a client.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        self.counters
            .iter()
            .map(|(name, value)| ((*name).to_owned(), *value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let mut stats = Statistics::new();

        stats.bump(VALIDATED_ADDRESSES, 2);
        stats.lower(VALIDATED_ADDRESSES, 1);
        assert_eq!(stats.get(VALIDATED_ADDRESSES), 1);

        stats.lower(VALIDATED_ADDRESSES, 10);
        assert_eq!(stats.get(VALIDATED_ADDRESSES), 0);

        assert_eq!(stats.get("nonexistent"), 0);
    }
}
