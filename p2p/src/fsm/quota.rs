//! Inbound bandwidth accounting.
//!
//! Each neighbour gets a token bucket over inbound payload bytes. Overdraws
//! raise a violation counter; once the counter passes a threshold the
//! offending message is dropped outright and the carrier is told to back
//! off.
use switchyard_common::time::{LocalDuration, LocalTime};

/// Seconds of unused quota a neighbour may carry forward.
pub const MAX_CARRY_SECS: u64 = 5;
/// Excess clawed back from the bucket on each violation, to damp
/// oscillation.
pub const VIOLATION_CLAWBACK: i64 = 32 * 1024;
/// Counter increment per overdraw.
const VIOLATION_PENALTY: u32 = 10;
/// Counter value at which the next inbound message is dropped.
pub const VIOLATION_THRESHOLD: u32 = 10;

/// Result of offering bytes to the tracker.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum QuotaOutcome {
    /// Within quota; no backpressure needed.
    Accepted,
    /// Over quota but below the violation threshold; the carrier should
    /// pause for the given delay.
    Throttled(LocalDuration),
    /// Too many violations: the message must be discarded and the carrier
    /// must pause for the given delay.
    Dropped(LocalDuration),
}

/// Single-writer token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Refill rate, bytes per second.
    rate: u32,
    /// Maximum balance: `rate * MAX_CARRY_SECS`.
    capacity: i64,
    /// Current balance. Negative after an overdraw.
    available: i64,
    last_update: LocalTime,
}

impl TokenBucket {
    /// Create a full bucket with the given refill rate.
    pub fn new(rate: u32, now: LocalTime) -> Self {
        let capacity = rate as i64 * MAX_CARRY_SECS as i64;
        Self {
            rate,
            capacity,
            available: capacity,
            last_update: now,
        }
    }

    /// Change the refill rate, preserving the current fill fraction's sign.
    pub fn set_rate(&mut self, rate: u32, now: LocalTime) {
        self.refill(now);
        self.rate = rate;
        self.capacity = rate as i64 * MAX_CARRY_SECS as i64;
        self.available = self.available.min(self.capacity);
    }

    /// The refill rate in bytes per second.
    pub fn rate(&self) -> u32 {
        self.rate
    }

    fn refill(&mut self, now: LocalTime) {
        let elapsed = now.duration_since(self.last_update);
        let refill = (self.rate as u128 * elapsed.as_millis() as u128 / 1000) as i64;

        self.available = (self.available + refill).min(self.capacity);
        self.last_update = now;
    }

    /// Withdraw `bytes`; returns `false` on overdraw (the balance still goes
    /// negative, tracking the debt).
    pub fn consume(&mut self, bytes: u32, now: LocalTime) -> bool {
        self.refill(now);
        self.available -= bytes as i64;
        self.available >= 0
    }

    /// Forgive part of the debt after a violation.
    pub fn claw_back(&mut self, bytes: i64) {
        self.available = (self.available + bytes).min(self.capacity);
    }

    /// How long until the balance is non-negative again.
    pub fn recovery_delay(&self) -> LocalDuration {
        if self.available >= 0 || self.rate == 0 {
            return LocalDuration::default();
        }
        let debt = (-self.available) as u64;
        LocalDuration::from_millis(debt * 1000 / self.rate as u64 + 1)
    }
}

/// Per-neighbour inbound quota state.
#[derive(Debug, Clone)]
pub struct QuotaTracker {
    bucket: TokenBucket,
    violations: u32,
}

impl QuotaTracker {
    /// Create a tracker with the given inbound rate.
    pub fn new(rate: u32, now: LocalTime) -> Self {
        Self {
            bucket: TokenBucket::new(rate, now),
            violations: 0,
        }
    }

    /// Account for an inbound payload of `bytes`.
    pub fn receive(&mut self, bytes: u32, now: LocalTime) -> QuotaOutcome {
        if self.violations >= VIOLATION_THRESHOLD {
            // Past the threshold the message is not even counted. The
            // counter only heals once the bucket itself has recovered.
            if self.bucket.consume(0, now) {
                self.violations = self.violations.saturating_sub(1);
            }
            let delay = self.bucket.recovery_delay().max(LocalDuration::from_secs(
                MAX_CARRY_SECS,
            ));
            return QuotaOutcome::Dropped(delay);
        }

        if self.bucket.consume(bytes, now) {
            self.violations = self.violations.saturating_sub(1);
            QuotaOutcome::Accepted
        } else {
            self.violations += VIOLATION_PENALTY;
            self.bucket.claw_back(VIOLATION_CLAWBACK);
            QuotaOutcome::Throttled(self.bucket.recovery_delay())
        }
    }

    /// Change the inbound rate.
    pub fn set_rate(&mut self, rate: u32, now: LocalTime) {
        self.bucket.set_rate(rate, now);
    }

    /// The inbound rate in bytes per second.
    pub fn rate(&self) -> u32 {
        self.bucket.rate()
    }

    /// Current violation counter.
    pub fn violations(&self) -> u32 {
        self.violations
    }
}
