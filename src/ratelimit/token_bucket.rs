//! Per-key token bucket rate limiter.
//!
//! Each key owns a bucket holding up to `capacity` tokens that refills
//! continuously at `refill_rate` tokens per second. Refill is applied lazily
//! whenever a key is touched, in floating point, so slow fractional refill
//! accumulates across calls instead of being rounded away.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::backend::{OpRateLimiter, Permits};
use crate::clock::{elapsed, Clock, Timestamp};
use crate::error::{RateLimitExceeded, Result, TurnstileError, Violation};

/// Key used when a limiter guards a single resource.
pub const DEFAULT_KEY: &str = "";

/// Shortest sleep between retries in [`TokenBucketRateLimiter::wait_for_permits`].
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Longest single sleep in [`TokenBucketRateLimiter::wait_for_permits`]; the
/// bucket is checked again after it.
const MAX_WAIT: Duration = Duration::from_secs(3600);

/// Time for `deficit` tokens to refill at `refill_rate` per second, bounded
/// to `[MIN_WAIT, MAX_WAIT]`.
fn refill_delay(deficit: f64, refill_rate: f64) -> Duration {
    Duration::try_from_secs_f64((deficit / refill_rate).max(0.0))
        .unwrap_or(MAX_WAIT)
        .clamp(MIN_WAIT, MAX_WAIT)
}

/// Bucket sizing.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucketConfig {
    capacity: u32,
    refill_rate: f64,
    cleanup_idle_after: Option<Duration>,
}

impl TokenBucketConfig {
    /// Create a configuration. `capacity` must be positive and `refill_rate`
    /// (tokens per second) positive and finite.
    pub fn new(capacity: u32, refill_rate: f64) -> Result<Self> {
        if capacity == 0 {
            return Err(TurnstileError::InvalidArgument(
                "token bucket capacity must be greater than zero".to_string(),
            ));
        }
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(TurnstileError::InvalidArgument(format!(
                "token bucket refill rate must be positive and finite, got {}",
                refill_rate
            )));
        }
        Ok(Self {
            capacity,
            refill_rate,
            cleanup_idle_after: None,
        })
    }

    /// Let [`TokenBucketRateLimiter::clean_up_now`] drop full buckets that
    /// have not been touched for `idle`.
    pub fn with_cleanup_idle_after(mut self, idle: Duration) -> Self {
        self.cleanup_idle_after = Some(idle);
        self
    }

    /// Maximum tokens per bucket.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Idle time after which full buckets may be dropped.
    pub fn cleanup_idle_after(&self) -> Option<Duration> {
        self.cleanup_idle_after
    }
}

/// Token state of a single key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeyState {
    /// Tokens in the bucket, in `[0, capacity]`
    pub available: f64,
    /// When refill was last applied
    pub last_refill: Timestamp,
}

impl KeyState {
    fn full(config: &TokenBucketConfig, now: Timestamp) -> Self {
        Self {
            available: f64::from(config.capacity),
            last_refill: now,
        }
    }

    fn refill(&mut self, config: &TokenBucketConfig, now: Timestamp) {
        let secs = elapsed(self.last_refill, now).as_secs_f64();
        self.available = (self.available + secs * config.refill_rate)
            .clamp(0.0, f64::from(config.capacity));
        // a clock that went backwards must not rewind the bookkeeping
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    fn whole(&self) -> u32 {
        self.available.floor() as u32
    }

    fn is_full(&self, config: &TokenBucketConfig) -> bool {
        self.available >= f64::from(config.capacity)
    }

    fn take(&mut self, permits: u32, partial: bool) -> u32 {
        let whole = self.whole();
        let granted = if whole >= permits {
            permits
        } else if partial {
            whole
        } else {
            0
        };
        self.available -= f64::from(granted);
        granted
    }
}

/// Immutable snapshot of all bucket state.
///
/// An untouched (or fully cleaned up) limiter has the default, empty state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketState {
    /// State per key; keys with full buckets may be absent
    pub per_key: BTreeMap<String, KeyState>,
}

/// Hook invoked with a fresh snapshot after state changes.
pub type StateChangeHook = Box<dyn Fn(&TokenBucketState) + Send + Sync>;

struct Take {
    granted: u32,
    available: f64,
    changed: bool,
}

/// A rate limiter using the token bucket algorithm, one bucket per key.
///
/// Unknown keys behave as full buckets and are only stored once they
/// consume tokens. Per-key check-and-debit is atomic.
pub struct TokenBucketRateLimiter {
    config: TokenBucketConfig,
    clock: Arc<dyn Clock>,
    buckets: DashMap<String, KeyState>,
    on_state_change: Option<StateChangeHook>,
}

impl fmt::Debug for TokenBucketRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucketRateLimiter")
            .field("config", &self.config)
            .field("keys", &self.buckets.len())
            .finish()
    }
}

impl TokenBucketRateLimiter {
    /// Create a limiter with empty state.
    pub fn new(config: TokenBucketConfig, clock: impl Clock + 'static) -> Self {
        Self {
            config,
            clock: Arc::new(clock),
            buckets: DashMap::new(),
            on_state_change: None,
        }
    }

    /// Restore previously captured state. Token counts are clamped to the
    /// current capacity.
    pub fn with_state(self, state: TokenBucketState) -> Self {
        let capacity = f64::from(self.config.capacity);
        for (key, mut key_state) in state.per_key {
            key_state.available = key_state.available.clamp(0.0, capacity);
            self.buckets.insert(key, key_state);
        }
        self
    }

    /// Install a hook that observes every state change.
    pub fn on_state_change(
        mut self,
        hook: impl Fn(&TokenBucketState) + Send + Sync + 'static,
    ) -> Self {
        self.on_state_change = Some(Box::new(hook));
        self
    }

    /// The limiter's configuration.
    pub fn config(&self) -> &TokenBucketConfig {
        &self.config
    }

    /// Whole permits currently available for `key`.
    pub fn available_permits(&self, key: &str) -> u32 {
        let now = self.clock.now();
        match self.buckets.get(key) {
            Some(bucket) => {
                let mut bucket = *bucket;
                bucket.refill(&self.config, now);
                bucket.whole()
            }
            None => self.config.capacity,
        }
    }

    /// Request `permits` for `key` and return how many were granted.
    ///
    /// Without `partial` the result is either `permits` or `0`; with it,
    /// as many as are available up to `permits`.
    pub fn request_permits(&self, key: &str, permits: u32, partial: bool) -> u32 {
        self.take(key, permits, partial).granted
    }

    /// Request exactly `permits` for `key`, failing if they are not available.
    pub fn require_permits(&self, key: &str, permits: u32) -> Result<u32> {
        let take = self.take(key, permits, false);
        if take.granted < permits {
            return Err(RateLimitExceeded::new(
                permits,
                take.available.floor() as u32,
                Violation::Bucket {
                    key: key.to_string(),
                },
            )
            .into());
        }
        Ok(take.granted)
    }

    /// Return unused permits to `key`'s bucket, up to its capacity.
    pub fn give_back(&self, key: &str, permits: u32) {
        if permits == 0 {
            return;
        }
        let now = self.clock.now();
        let changed = match self.buckets.get_mut(key) {
            Some(mut bucket) => {
                let before = *bucket;
                bucket.refill(&self.config, now);
                bucket.available =
                    (bucket.available + f64::from(permits)).min(f64::from(self.config.capacity));
                before != *bucket
            }
            // absent keys are already full
            None => false,
        };
        if changed {
            self.notify();
        }
    }

    /// Wait until `permits` are available for `key`, then take them.
    ///
    /// `on_wait` runs once, and only if the caller actually has to wait.
    pub async fn wait_for_permits(
        &self,
        key: &str,
        permits: u32,
        on_wait: impl FnOnce(),
    ) -> Result<u32> {
        if permits > self.config.capacity {
            return Err(TurnstileError::InvalidArgument(format!(
                "cannot wait for {} permits from a bucket of capacity {}",
                permits, self.config.capacity
            )));
        }

        let mut on_wait = Some(on_wait);
        loop {
            let take = self.take(key, permits, false);
            if take.granted == permits {
                return Ok(permits);
            }

            if let Some(on_wait) = on_wait.take() {
                on_wait();
            }
            let deficit = f64::from(permits) - take.available;
            let delay = refill_delay(deficit, self.config.refill_rate);
            trace!(key = %key, permits, delay_ms = delay.as_millis() as u64, "Waiting for permits");
            tokio::time::sleep(delay).await;
        }
    }

    /// Drop buckets that are back at capacity, so no information is lost.
    ///
    /// Unless `force` is set, a bucket must also have been idle for the
    /// configured `cleanup_idle_after`; without that setting only forced
    /// cleanups remove anything. Returns the number of keys removed.
    pub fn clean_up_now(&self, force: bool) -> usize {
        let idle_after = self.config.cleanup_idle_after;
        if !force && idle_after.is_none() {
            return 0;
        }

        let now = self.clock.now();
        let mut removed = 0;
        self.buckets.retain(|_, bucket| {
            let mut refilled = *bucket;
            refilled.refill(&self.config, now);
            let idle = force
                || idle_after.is_some_and(|after| elapsed(bucket.last_refill, now) >= after);
            let remove = idle && refilled.is_full(&self.config);
            if remove {
                removed += 1;
            }
            !remove
        });

        if removed > 0 {
            debug!(removed, remaining = self.buckets.len(), "Cleaned up token buckets");
            self.notify();
        }
        removed
    }

    /// Snapshot of every stored bucket.
    pub fn state(&self) -> TokenBucketState {
        TokenBucketState {
            per_key: self
                .buckets
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
        }
    }

    /// Number of stored buckets.
    pub fn key_count(&self) -> usize {
        self.buckets.len()
    }

    fn take(&self, key: &str, permits: u32, partial: bool) -> Take {
        let now = self.clock.now();
        let config = &self.config;
        let apply = |bucket: &mut KeyState| {
            let before = *bucket;
            bucket.refill(config, now);
            let available = bucket.available;
            let granted = bucket.take(permits, partial);
            Take {
                granted,
                available,
                changed: before != *bucket,
            }
        };

        // The entry guard must be gone before notify() iterates the map.
        let take = match self.buckets.get_mut(key) {
            Some(mut bucket) => apply(bucket.value_mut()),
            None => match self.buckets.entry(key.to_string()) {
                Entry::Occupied(mut occupied) => apply(occupied.get_mut()),
                Entry::Vacant(vacant) => {
                    let mut bucket = KeyState::full(config, now);
                    let take = apply(&mut bucket);
                    if take.granted > 0 {
                        vacant.insert(bucket);
                    }
                    Take {
                        changed: take.granted > 0,
                        ..take
                    }
                }
            },
        };

        trace!(
            key = %key,
            requested = permits,
            granted = take.granted,
            available = take.available,
            "Token bucket request"
        );
        if take.granted < permits {
            debug!(key = %key, requested = permits, granted = take.granted, "Token bucket short of permits");
        }
        if take.changed {
            self.notify();
        }
        take
    }

    fn notify(&self) {
        if let Some(hook) = &self.on_state_change {
            hook(&self.state());
        }
    }
}

impl OpRateLimiter<str> for TokenBucketRateLimiter {
    fn available(&self, key: &str) -> u32 {
        self.available_permits(key)
    }

    fn acquire(&self, key: &str, permits: u32, partial: bool) -> Permits {
        let take = self.take(key, permits, partial);
        let available = take.available.floor() as u32;
        Permits {
            requested: permits,
            available,
            granted: take.granted,
            limited_by: (available < permits).then(|| Violation::Bucket {
                key: key.to_string(),
            }),
        }
    }

    fn give_back(&self, key: &str, permits: u32) {
        TokenBucketRateLimiter::give_back(self, key, permits)
    }
}
