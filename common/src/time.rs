//! Monotonic local time and durations, tracked explicitly.
//!
//! The protocol core never reads the system clock; the reactor injects the
//! current time and components cache it behind a [`Clock`].
use std::cell::RefCell;
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum duration representable. Used as "never".
pub const MAX_DURATION: LocalDuration = LocalDuration(u64::MAX);

/// A point in local time, measured in milliseconds since the UNIX epoch.
///
/// This is "local" in the sense that it is not synchronized with remote
/// peers; it only ever comes from the local reactor.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalTime {
    millis: u64,
}

impl LocalTime {
    /// The current system time. Only the reactor and tests should call this;
    /// protocol code receives time through a [`Clock`].
    pub fn now() -> Self {
        SystemTime::now().into()
    }

    /// Construct from milliseconds since the epoch.
    pub const fn from_millis(millis: u64) -> Self {
        Self { millis }
    }

    /// Construct from seconds since the epoch.
    pub const fn from_secs(secs: u64) -> Self {
        Self {
            millis: secs * 1000,
        }
    }

    /// Milliseconds since the epoch.
    pub const fn as_millis(&self) -> u64 {
        self.millis
    }

    /// Seconds since the epoch, truncated.
    pub const fn as_secs(&self) -> u64 {
        self.millis / 1000
    }

    /// Time elapsed since `earlier`, or zero if `earlier` is in the future.
    pub fn duration_since(&self, earlier: LocalTime) -> LocalDuration {
        LocalDuration(self.millis.saturating_sub(earlier.millis))
    }
}

impl fmt::Display for LocalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_secs())
    }
}

impl From<SystemTime> for LocalTime {
    fn from(t: SystemTime) -> Self {
        let duration = t
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        Self {
            millis: duration.as_millis() as u64,
        }
    }
}

impl Add<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn add(self, other: LocalDuration) -> Self {
        Self {
            millis: self.millis.saturating_add(other.0),
        }
    }
}

impl AddAssign<LocalDuration> for LocalTime {
    fn add_assign(&mut self, other: LocalDuration) {
        *self = *self + other;
    }
}

impl Sub<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn sub(self, other: LocalDuration) -> Self {
        Self {
            millis: self.millis.saturating_sub(other.0),
        }
    }
}

impl Sub<LocalTime> for LocalTime {
    type Output = LocalDuration;

    fn sub(self, other: LocalTime) -> LocalDuration {
        LocalDuration(self.millis.saturating_sub(other.millis))
    }
}

/// A span of time, measured in milliseconds.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalDuration(u64);

impl LocalDuration {
    /// Construct from milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Construct from seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * 1000)
    }

    /// Construct from minutes.
    pub const fn from_mins(mins: u64) -> Self {
        Self::from_secs(mins * 60)
    }

    /// The duration in milliseconds.
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// The duration in whole seconds.
    pub const fn as_secs(&self) -> u64 {
        self.0 / 1000
    }

    /// The smaller of the two durations.
    pub fn min(self, other: Self) -> Self {
        Self(self.0.min(other.0))
    }

    /// The larger of the two durations.
    pub fn max(self, other: Self) -> Self {
        Self(self.0.max(other.0))
    }

    /// Clamp to the inclusive range `[lo, hi]`.
    pub fn clamp(self, lo: Self, hi: Self) -> Self {
        Self(self.0.clamp(lo.0, hi.0))
    }
}

impl fmt::Display for LocalDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == u64::MAX {
            write!(f, "forever")
        } else if self.0 >= 60_000 && self.0 % 60_000 == 0 {
            write!(f, "{} minute(s)", self.0 / 60_000)
        } else if self.0 >= 1000 {
            write!(f, "{:.1} second(s)", self.0 as f64 / 1000.)
        } else {
            write!(f, "{} millisecond(s)", self.0)
        }
    }
}

impl Add for LocalDuration {
    type Output = LocalDuration;

    fn add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }
}

impl Sub for LocalDuration {
    type Output = LocalDuration;

    fn sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl std::ops::Mul<u64> for LocalDuration {
    type Output = LocalDuration;

    fn mul(self, n: u64) -> Self {
        Self(self.0.saturating_mul(n))
    }
}

impl std::ops::Div<u64> for LocalDuration {
    type Output = LocalDuration;

    fn div(self, n: u64) -> Self {
        Self(self.0 / n)
    }
}

impl From<LocalDuration> for std::time::Duration {
    fn from(d: LocalDuration) -> Self {
        std::time::Duration::from_millis(d.0)
    }
}

/// Source of the current local time.
pub trait Clock: Clone {
    /// The current local time, as last set by the reactor.
    fn local_time(&self) -> LocalTime;

    /// Update the cached time.
    fn set(&self, time: LocalTime);
}

/// Shared clock for a single-threaded protocol instance. Cheap to clone;
/// all clones observe the same time.
#[derive(Debug, Clone, Default)]
pub struct RefClock {
    time: Rc<RefCell<LocalTime>>,
}

impl RefClock {
    /// Create a clock starting at the given time.
    pub fn from(time: LocalTime) -> Self {
        Self {
            time: Rc::new(RefCell::new(time)),
        }
    }

    /// Advance the clock by a duration.
    pub fn elapse(&self, duration: LocalDuration) {
        let now = self.local_time();
        self.set(now + duration);
    }
}

impl Clock for RefClock {
    fn local_time(&self) -> LocalTime {
        *self.time.borrow()
    }

    fn set(&self, time: LocalTime) {
        *self.time.borrow_mut() = time;
    }
}
