//! Rule-based limiter whose rules can be replaced while it runs.
//!
//! Cell state is keyed by rule and grouping names rather than by rule
//! objects, so swapping in a rule list that raises or lowers a rate keeps
//! every permit already counted. Cells whose rule or grouping disappeared
//! keep their usage until it drains; the sweep that runs on every rule
//! change (and any explicit cleanup) then evicts them.

use std::fmt;
use std::sync::Arc;

use tracing::info;

use super::backend::{OpRateLimiter, Permits};
use super::cells::{CellSnapshot, CellStore, GrantHistory};
use super::counter::WindowPolicy;
use super::rule::Rule;
use crate::clock::Clock;
use crate::error::{RateLimitExceeded, Result};
use crate::observable::{Observable, Subscription};

/// A [`MultiRateLimiter`](super::MultiRateLimiter) that reads its rules from
/// an [`Observable`] on every call.
pub struct DynamicMultiRateLimiter<O: ?Sized + 'static> {
    rules: Box<dyn Observable<Vec<Rule<O>>>>,
    store: Arc<CellStore>,
    clock: Arc<dyn Clock>,
    subscription: Subscription,
}

impl<O: ?Sized + 'static> fmt::Debug for DynamicMultiRateLimiter<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicMultiRateLimiter")
            .field("rules", &self.rules.current())
            .field("policy", &self.store.policy())
            .field("cells", &self.store.len())
            .field("subscription", &self.subscription)
            .finish()
    }
}

impl<O: ?Sized + 'static> DynamicMultiRateLimiter<O> {
    /// Create a limiter following `rules`, using sliding windows.
    pub fn new(
        rules: impl Observable<Vec<Rule<O>>> + 'static,
        clock: impl Clock + 'static,
    ) -> Self {
        Self::build(Box::new(rules), Arc::new(clock), WindowPolicy::default())
    }

    /// Use `policy` for all cells. Any existing state is discarded.
    pub fn with_window_policy(self, policy: WindowPolicy) -> Self {
        let Self {
            rules,
            clock,
            subscription,
            ..
        } = self;
        // the old subscription still points at the old store
        drop(subscription);
        Self::build(rules, clock, policy)
    }

    fn build(
        rules: Box<dyn Observable<Vec<Rule<O>>>>,
        clock: Arc<dyn Clock>,
        policy: WindowPolicy,
    ) -> Self {
        let store = Arc::new(CellStore::new(policy));
        let subscription = {
            let store = store.clone();
            let clock = clock.clone();
            rules.subscribe(Arc::new(move |rules: Arc<Vec<Rule<O>>>| {
                let names: Vec<&str> = rules.iter().map(Rule::name).collect();
                info!(rules = ?names, "Rate limit rules updated");
                store.clean_up(clock.now());
            }))
        };
        Self {
            rules,
            store,
            clock,
            subscription,
        }
    }

    /// The rules currently in force.
    pub fn rules(&self) -> Arc<Vec<Rule<O>>> {
        self.rules.current()
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

    /// Request up to `permits` for `op` against the current rules.
    pub fn request_permits(&self, op: &O, permits: u32, partial: bool) -> Permits {
        let rules = self.rules.current();
        self.store
            .acquire(&rules, op, permits, partial, self.clock.now())
    }

    /// Permits `op` could take right now. `u32::MAX` if no rule applies.
    pub fn available_permits(&self, op: &O) -> u32 {
        let rules = self.rules.current();
        self.store.available(&rules, op, self.clock.now())
    }

    /// Return `permits` granted to `op` that went unused. The grant is
    /// located through the rules in force now.
    pub fn give_back(&self, op: &O, permits: u32) {
        let rules = self.rules.current();
        self.store.give_back(&rules, op, permits, self.clock.now())
    }

    /// Grants still counted, for persisting usage across restarts.
    pub fn grant_history(&self) -> GrantHistory {
        self.store.grant_history(self.clock.now())
    }

    /// Count the still-live grants of `history` on top of current usage.
    pub fn add_grant_history(&self, history: &GrantHistory) -> Result<usize> {
        self.store.add_grant_history(history, self.clock.now())
    }

    /// Drop cells whose usage has fully expired, including cells of rules
    /// that are no longer configured.
    pub fn clean_up_now(&self) -> usize {
        self.store.clean_up(self.clock.now())
    }

    /// Usage of every live cell, ordered by rule, grouping, group and window.
    pub fn cells(&self) -> Vec<CellSnapshot> {
        self.store.snapshot(self.clock.now())
    }
}

impl<O: ?Sized + 'static> OpRateLimiter<O> for DynamicMultiRateLimiter<O> {
    fn available(&self, op: &O) -> u32 {
        self.available_permits(op)
    }

    fn acquire(&self, op: &O, permits: u32, partial: bool) -> Permits {
        self.request_permits(op, permits, partial)
    }

    fn give_back(&self, op: &O, permits: u32) {
        DynamicMultiRateLimiter::give_back(self, op, permits)
    }
}
