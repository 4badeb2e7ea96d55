//! Versioning timestamps and the injectable clock.
//!
//! Every persisted entity carries a [`Timestamp`] version. Components
//! that do delay arithmetic (launch backoff, health grace periods,
//! staged-task expiry) take a [`Clock`] so tests control time.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A wall-clock instant in milliseconds since the Unix epoch, used as
/// an entity version. Totally ordered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub fn millis(&self) -> u64 {
        self.0
    }

    /// The current system time. Prefer a [`Clock`] in anything that
    /// needs to be tested deterministically.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self(millis)
    }

    pub fn plus(&self, d: Duration) -> Self {
        Self(self.0.saturating_add(d.as_millis() as u64))
    }

    pub fn minus(&self, d: Duration) -> Self {
        Self(self.0.saturating_sub(d.as_millis() as u64))
    }

    /// Duration from `earlier` to `self`, zero if `earlier` is later.
    pub fn since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of "now". Shared as `Arc<dyn Clock>`.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// A manually advanced clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Arc<Self> {
        Arc::new(Self {
            millis: AtomicU64::new(start.millis()),
        })
    }

    pub fn advance(&self, d: Duration) {
        self.millis.fetch_add(d.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, t: Timestamp) {
        self.millis.store(t.millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_totally_ordered() {
        let a = Timestamp::from_millis(1_000);
        let b = Timestamp::from_millis(2_000);
        assert!(a < b);
        assert_eq!(a, Timestamp::from_millis(1_000));
    }

    #[test]
    fn plus_and_since() {
        let a = Timestamp::from_millis(1_000);
        let b = a.plus(Duration::from_secs(5));
        assert_eq!(b.millis(), 6_000);
        assert_eq!(b.since(a), Duration::from_secs(5));
        assert_eq!(a.since(b), Duration::ZERO);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(Timestamp::from_millis(10_000));
        assert_eq!(clock.now().millis(), 10_000);
        clock.advance(Duration::from_secs(3));
        assert_eq!(clock.now().millis(), 13_000);
        clock.set(Timestamp::from_millis(500));
        assert_eq!(clock.now().millis(), 500);
    }

    #[test]
    fn serde_is_transparent() {
        let t = Timestamp::from_millis(42);
        assert_eq!(serde_json::to_string(&t).unwrap(), "42");
        let back: Timestamp = serde_json::from_str("42").unwrap();
        assert_eq!(back, t);
    }
}
