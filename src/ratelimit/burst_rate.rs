//! Burst rates: "at most N permits per window".

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{Result, TurnstileError};

/// Time unit for configured rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// An immutable rate constraint: `permits` per `window`.
///
/// `permits == 0` denies everything. The window must be non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BurstRate {
    permits: u32,
    window: Duration,
}

impl BurstRate {
    /// Create a rate, rejecting a zero-length window.
    pub fn new(permits: u32, window: Duration) -> Result<Self> {
        if window.is_zero() {
            return Err(TurnstileError::InvalidArgument(
                "burst rate window must be longer than zero".to_string(),
            ));
        }
        Ok(Self { permits, window })
    }

    /// `permits` per `count` units of time.
    pub fn per(permits: u32, count: u32, unit: TimeUnit) -> Result<Self> {
        Self::new(permits, unit.duration() * count)
    }

    /// `permits` per second.
    pub fn per_second(permits: u32) -> Self {
        Self::per_unit(permits, TimeUnit::Second)
    }

    /// `permits` per minute.
    pub fn per_minute(permits: u32) -> Self {
        Self::per_unit(permits, TimeUnit::Minute)
    }

    /// `permits` per hour.
    pub fn per_hour(permits: u32) -> Self {
        Self::per_unit(permits, TimeUnit::Hour)
    }

    fn per_unit(permits: u32, unit: TimeUnit) -> Self {
        Self {
            permits,
            window: unit.duration(),
        }
    }

    /// Permits allowed per window.
    pub fn permits(&self) -> u32 {
        self.permits
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }
}

impl fmt::Display for BurstRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}", self.permits, self.window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_unit_duration() {
        assert_eq!(TimeUnit::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeUnit::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeUnit::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeUnit::Day.duration(), Duration::from_secs(86400));
    }

    #[test]
    fn test_zero_window_is_rejected() {
        let err = BurstRate::new(5, Duration::ZERO).unwrap_err();
        assert!(matches!(err, TurnstileError::InvalidArgument(_)));

        assert!(BurstRate::per(5, 0, TimeUnit::Minute).is_err());
    }

    #[test]
    fn test_zero_permits_is_allowed() {
        let rate = BurstRate::new(0, Duration::from_secs(1)).unwrap();
        assert_eq!(rate.permits(), 0);
    }

    #[test]
    fn test_multi_unit_window() {
        let rate = BurstRate::per(100, 15, TimeUnit::Minute).unwrap();
        assert_eq!(rate.window(), Duration::from_secs(900));
        assert_eq!(rate.to_string(), "100/900s");
    }
}
