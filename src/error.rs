//! Error types for Turnstile.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::{BurstRate, GroupKey};

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// An operation was denied by a rate limit
    #[error(transparent)]
    RateLimitExceeded(#[from] RateLimitExceeded),

    /// Invalid construction or call arguments
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;

/// Denial signal carrying the constraint that refused the request.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Rate limited: {available} of requested {requested} permits available ({violation})")]
pub struct RateLimitExceeded {
    /// Permits the caller asked for
    pub requested: u32,
    /// Permits that were available at the time of the request
    pub available: u32,
    /// The constraint that was not satisfied
    pub violation: Violation,
}

impl RateLimitExceeded {
    pub(crate) fn new(requested: u32, available: u32, violation: Violation) -> Self {
        Self {
            requested,
            available,
            violation,
        }
    }
}

/// Identity of the constraint responsible for a denial.
#[derive(Debug, Clone, PartialEq)]
pub enum Violation {
    /// A token bucket ran dry.
    Bucket {
        /// The bucket key
        key: String,
    },
    /// A burst rate of a rule's grouping was exhausted.
    Rate {
        /// Name of the rule
        rule: String,
        /// Name of the grouping within the rule
        grouping: String,
        /// Position of the rate within the grouping
        rate_index: usize,
        /// The partition the operation fell into
        group_key: GroupKey,
        /// The exhausted rate
        rate: BurstRate,
    },
}

impl Violation {
    /// Name of the rule, if the denial came from a rule.
    pub fn rule(&self) -> Option<&str> {
        match self {
            Violation::Bucket { .. } => None,
            Violation::Rate { rule, .. } => Some(rule),
        }
    }

    /// Window of the exhausted rate, if the denial came from a rule.
    pub fn window(&self) -> Option<Duration> {
        match self {
            Violation::Bucket { .. } => None,
            Violation::Rate { rate, .. } => Some(rate.window()),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Bucket { key } => write!(f, "bucket '{}'", key),
            Violation::Rate {
                rule,
                grouping,
                rate_index,
                group_key,
                rate,
            } => write!(
                f,
                "rule '{}', grouping '{}' [{}], rate #{} {}",
                rule, grouping, group_key, rate_index, rate
            ),
        }
    }
}
