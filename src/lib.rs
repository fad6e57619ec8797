//! Turnstile - In-Process Admission Control
//!
//! This crate guards operations with rate limits kept entirely in memory:
//! per-key token buckets, and rule trees that constrain an operation along
//! several dimensions at once (globally, per IP, per user, ...) with a
//! check-then-commit guarantee. Rules can be swapped at runtime without
//! losing the quota already consumed.

pub mod cleanup;
pub mod clock;
pub mod config;
pub mod error;
pub mod observable;
pub mod ratelimit;
pub mod reload;

pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use error::{RateLimitExceeded, Result, TurnstileError, Violation};
pub use observable::{Observable, ObservableValue, Subscription};
