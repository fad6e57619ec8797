//! Rule-based limiter enforcing every matching rule, grouping and rate at once.

use std::fmt;
use std::sync::Arc;

use super::backend::{OpRateLimiter, Permits};
use super::cells::{CellSnapshot, CellStore, GrantHistory};
use super::counter::WindowPolicy;
use super::rule::Rule;
use crate::clock::Clock;
use crate::error::{RateLimitExceeded, Result};

/// Admits an operation only if every rate of every grouping of every rule
/// that applies to it has room, and then counts it against all of them.
///
/// Check and commit happen under the locks of all implicated cells, so
/// concurrent callers never push a cell past its rate.
pub struct MultiRateLimiter<O: ?Sized> {
    rules: Arc<[Rule<O>]>,
    store: Arc<CellStore>,
    clock: Arc<dyn Clock>,
}

impl<O: ?Sized> fmt::Debug for MultiRateLimiter<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiRateLimiter")
            .field("rules", &self.rules)
            .field("policy", &self.store.policy())
            .field("cells", &self.store.len())
            .finish()
    }
}

impl<O: ?Sized> MultiRateLimiter<O> {
    /// Create a limiter for `rules` using sliding windows.
    pub fn new(rules: Vec<Rule<O>>, clock: impl Clock + 'static) -> Self {
        Self {
            rules: rules.into(),
            store: Arc::new(CellStore::new(WindowPolicy::default())),
            clock: Arc::new(clock),
        }
    }

    /// Use `policy` for all cells. Any existing state is discarded.
    pub fn with_window_policy(mut self, policy: WindowPolicy) -> Self {
        self.store = Arc::new(CellStore::new(policy));
        self
    }

    /// The rules this limiter enforces.
    pub fn rules(&self) -> &[Rule<O>] {
        &self.rules
    }

    /// Take one permit for `op` or fail with the first violated rate.
    pub fn require_permits(&self, op: &O) -> Result<()> {
        self.require_n(op, 1).map(|_| ())
    }

    /// Take exactly `permits` for `op` or fail with the first violated rate.
    pub fn require_n(&self, op: &O, permits: u32) -> Result<u32> {
        let grant = self.request_permits(op, permits, false);
        match grant.limited_by {
            Some(violation) if grant.granted < permits => {
                Err(RateLimitExceeded::new(permits, grant.available, violation).into())
            }
            _ => Ok(grant.granted),
        }
    }

    /// Request up to `permits` for `op`. With `partial`, grants whatever
    /// every implicated rate can still admit; otherwise all or nothing.
    pub fn request_permits(&self, op: &O, permits: u32, partial: bool) -> Permits {
        self.store
            .acquire(&self.rules, op, permits, partial, self.clock.now())
    }

    /// Permits `op` could take right now. `u32::MAX` if no rule applies.
    pub fn available_permits(&self, op: &O) -> u32 {
        self.store.available(&self.rules, op, self.clock.now())
    }

    /// Return `permits` granted to `op` that went unused, in every cell the
    /// grant was counted in.
    pub fn give_back(&self, op: &O, permits: u32) {
        self.store
            .give_back(&self.rules, op, permits, self.clock.now())
    }

    /// Grants still counted, for persisting usage across restarts.
    pub fn grant_history(&self) -> GrantHistory {
        self.store.grant_history(self.clock.now())
    }

    /// Count the still-live grants of `history` on top of current usage.
    ///
    /// Fails if `history` was taken with a different window policy.
    pub fn add_grant_history(&self, history: &GrantHistory) -> Result<usize> {
        self.store.add_grant_history(history, self.clock.now())
    }

    /// Drop cells whose usage has fully expired. Returns how many were removed.
    pub fn clean_up_now(&self) -> usize {
        self.store.clean_up(self.clock.now())
    }

    /// Usage of every live cell, ordered by rule, grouping, group and window.
    pub fn cells(&self) -> Vec<CellSnapshot> {
        self.store.snapshot(self.clock.now())
    }
}

impl<O: ?Sized> OpRateLimiter<O> for MultiRateLimiter<O> {
    fn available(&self, op: &O) -> u32 {
        self.available_permits(op)
    }

    fn acquire(&self, op: &O, permits: u32, partial: bool) -> Permits {
        self.request_permits(op, permits, partial)
    }

    fn give_back(&self, op: &O, permits: u32) {
        MultiRateLimiter::give_back(self, op, permits)
    }
}
