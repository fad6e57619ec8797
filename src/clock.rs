//! Time sources for the limiters.
//!
//! Limiters never read the system clock themselves; they ask a [`Clock`].
//! Any `Fn() -> Timestamp` closure is a clock, which keeps simulated time in
//! tests down to a captured variable.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Point in time used for all limiter bookkeeping.
pub type Timestamp = DateTime<Utc>;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// The current time.
    fn now(&self) -> Timestamp;
}

impl<F> Clock for F
where
    F: Fn() -> Timestamp + Send + Sync,
{
    fn now(&self) -> Timestamp {
        self()
    }
}

/// Wall clock backed by `Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Timestamp>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward. Durations beyond chrono's range are ignored.
    pub fn advance(&self, by: Duration) {
        if let Ok(by) = chrono::Duration::from_std(by) {
            *self.now.lock() += by;
        }
    }

    /// Jump to an arbitrary time, including backwards.
    pub fn set(&self, to: Timestamp) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock()
    }
}

/// Time elapsed from `since` to `now`, clamped to zero when the clock went
/// backwards.
pub fn elapsed(since: Timestamp, now: Timestamp) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch() -> Timestamp {
        DateTime::parse_from_rfc3339("2021-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(epoch());
        clock.advance(Duration::from_millis(1500));
        assert_eq!(elapsed(epoch(), clock.now()), Duration::from_millis(1500));
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::new(epoch());
        let other = clock.clone();
        clock.advance(Duration::from_secs(3));
        assert_eq!(other.now(), clock.now());
    }

    #[test]
    fn test_elapsed_clamps_backwards_clock() {
        let later = epoch() + chrono::Duration::seconds(5);
        assert_eq!(elapsed(later, epoch()), Duration::ZERO);
    }

    #[test]
    fn test_closure_is_a_clock() {
        let fixed = epoch();
        let clock = move || fixed;
        assert_eq!(Clock::now(&clock), fixed);
    }
}
