//! Shared cell store and the check-then-commit admission engine used by the
//! rule-based limiters.
//!
//! Cells are keyed by names, group key and window rather than by rule
//! objects, so a store outlives any particular rule list.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use super::backend::Permits;
use super::burst_rate::BurstRate;
use super::counter::{WindowCell, WindowPolicy};
use super::rule::{GroupKey, Rule};
use crate::clock::{elapsed, Timestamp};
use crate::error::{Result, TurnstileError, Violation};

/// Stable identity of a cell.
///
/// The derived ordering is the global lock order for cells.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct CellKey {
    pub(crate) rule: Arc<str>,
    pub(crate) grouping: Arc<str>,
    pub(crate) group: GroupKey,
    pub(crate) window: Duration,
}

/// Point-in-time view of one cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CellSnapshot {
    /// Name of the rule the cell belongs to
    pub rule: String,
    /// Name of the grouping within that rule
    pub grouping: String,
    /// Group the operations counted here fall into
    pub group: GroupKey,
    /// Window shared by the rates counted in this cell
    pub window: Duration,
    /// Permits counted in the window at snapshot time
    pub used: u32,
    /// Time until the oldest counted permit stops counting
    pub resets_in: Option<Duration>,
}

/// Grants still counted by the cells of a rule-based limiter.
///
/// Meant for carrying usage across restarts: take it with `grant_history`,
/// persist it with any serde format, and feed it to `add_grant_history` of a
/// fresh limiter using the same window policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrantHistory {
    /// Policy of the cells the grants were taken from
    #[serde(default)]
    pub policy: WindowPolicy,
    pub cells: Vec<CellGrants>,
}

/// Grants of one cell, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellGrants {
    pub rule: String,
    pub grouping: String,
    /// `None` for the global group
    pub group: Option<String>,
    pub window: Duration,
    pub grants: Vec<(Timestamp, u32)>,
}

impl CellGrants {
    fn key(&self) -> CellKey {
        CellKey {
            rule: Arc::from(self.rule.as_str()),
            grouping: Arc::from(self.grouping.as_str()),
            group: match &self.group {
                Some(value) => GroupKey::from(value.as_str()),
                None => GroupKey::Global,
            },
            window: self.window,
        }
    }
}

/// One rate of one grouping of one rule that applies to an operation.
struct RateCheck {
    key: CellKey,
    rate_index: usize,
    rate: BurstRate,
}

impl RateCheck {
    fn violation(&self) -> Violation {
        Violation::Rate {
            rule: self.key.rule.to_string(),
            grouping: self.key.grouping.to_string(),
            rate_index: self.rate_index,
            group_key: self.key.group.clone(),
            rate: self.rate,
        }
    }
}

/// Concurrent map of window cells, each behind its own lock.
#[derive(Debug)]
pub(crate) struct CellStore {
    policy: WindowPolicy,
    cells: DashMap<CellKey, Arc<Mutex<WindowCell>>>,
}

impl CellStore {
    pub(crate) fn new(policy: WindowPolicy) -> Self {
        Self {
            policy,
            cells: DashMap::new(),
        }
    }

    pub(crate) fn policy(&self) -> WindowPolicy {
        self.policy
    }

    /// Every rate implicated by `op`, in rule → grouping → rate order.
    fn plan<O: ?Sized>(rules: &[Rule<O>], op: &O) -> Vec<RateCheck> {
        let mut checks = Vec::new();
        for rule in rules.iter().filter(|rule| rule.applies_to(op)) {
            for grouping in rule.groupings() {
                let group = grouping.group_of(op);
                for (rate_index, rate) in grouping.rates().iter().enumerate() {
                    checks.push(RateCheck {
                        key: CellKey {
                            rule: rule.name_arc().clone(),
                            grouping: grouping.name_arc().clone(),
                            group: group.clone(),
                            window: rate.window(),
                        },
                        rate_index,
                        rate: *rate,
                    });
                }
            }
        }
        checks
    }

    fn cell(&self, key: &CellKey) -> Arc<Mutex<WindowCell>> {
        if let Some(cell) = self.cells.get(key) {
            return cell.value().clone();
        }
        self.cells
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(
                    rule = %key.rule,
                    grouping = %key.grouping,
                    group = %key.group,
                    window_ms = key.window.as_millis() as u64,
                    "Creating rate limit cell"
                );
                Arc::new(Mutex::new(WindowCell::new(self.policy)))
            })
            .value()
            .clone()
    }

    /// Admission test and commit for `permits` on `op`.
    ///
    /// All implicated cells are locked, in key order, for the whole
    /// check-then-commit sequence. Either every distinct cell records the
    /// grant or none does.
    pub(crate) fn acquire<O: ?Sized>(
        &self,
        rules: &[Rule<O>],
        op: &O,
        permits: u32,
        partial: bool,
        now: Timestamp,
    ) -> Permits {
        let checks = Self::plan(rules, op);
        if checks.is_empty() {
            return Permits::unlimited(permits);
        }

        // BTreeMap dedups shared cells and yields them in lock order.
        let cells: BTreeMap<CellKey, Arc<Mutex<WindowCell>>> = checks
            .iter()
            .map(|check| (check.key.clone(), self.cell(&check.key)))
            .collect();
        let slots: BTreeMap<&CellKey, usize> =
            cells.keys().enumerate().map(|(slot, key)| (key, slot)).collect();
        let mut guards: Vec<_> = cells.values().map(|cell| cell.lock()).collect();

        let mut available = u32::MAX;
        let mut limited_by = None;
        for check in &checks {
            let used = guards[slots[&check.key]].used(now, check.key.window);
            let left = check.rate.permits().saturating_sub(used);
            trace!(
                rule = %check.key.rule,
                grouping = %check.key.grouping,
                group = %check.key.group,
                rate_index = check.rate_index,
                used,
                left,
                "Evaluated rate"
            );
            available = available.min(left);
            if left < permits && limited_by.is_none() {
                limited_by = Some(check);
            }
        }

        let granted = if available >= permits {
            permits
        } else if partial {
            available
        } else {
            0
        };

        if granted > 0 {
            for (key, guard) in cells.keys().zip(guards.iter_mut()) {
                guard.record(now, key.window, granted);
            }
            if cfg!(debug_assertions) {
                for check in &checks {
                    let used = guards[slots[&check.key]].used(now, check.key.window);
                    debug_assert!(
                        used <= check.rate.permits(),
                        "cell {:?} holds {} permits, rate allows {}",
                        check.key,
                        used,
                        check.rate.permits()
                    );
                }
            }
        }
        drop(guards);

        if let Some(check) = limited_by.filter(|_| granted < permits) {
            debug!(
                rule = %check.key.rule,
                grouping = %check.key.grouping,
                group = %check.key.group,
                rate_index = check.rate_index,
                requested = permits,
                available,
                "Rate limit exceeded"
            );
        }

        Permits {
            requested: permits,
            available,
            granted,
            limited_by: limited_by.map(RateCheck::violation),
        }
    }

    /// Undo up to `permits` in every distinct cell implicated by `op`.
    ///
    /// Cells that do not exist hold nothing to return and are not created.
    /// Locks are taken in key order, as in [`CellStore::acquire`].
    pub(crate) fn give_back<O: ?Sized>(
        &self,
        rules: &[Rule<O>],
        op: &O,
        permits: u32,
        now: Timestamp,
    ) {
        if permits == 0 {
            return;
        }
        let cells: BTreeMap<CellKey, Arc<Mutex<WindowCell>>> = Self::plan(rules, op)
            .into_iter()
            .filter_map(|check| {
                let cell = self.cells.get(&check.key)?.value().clone();
                Some((check.key, cell))
            })
            .collect();
        let mut guards: Vec<_> = cells.values().map(|cell| cell.lock()).collect();
        for (key, guard) in cells.keys().zip(guards.iter_mut()) {
            guard.give_back(now, key.window, permits);
        }
        drop(guards);
        trace!(permits, cells = cells.len(), "Gave back permits");
    }

    /// Minimum availability over every rate implicated by `op`, without
    /// creating or changing cells. `u32::MAX` when no rule applies.
    pub(crate) fn available<O: ?Sized>(&self, rules: &[Rule<O>], op: &O, now: Timestamp) -> u32 {
        Self::plan(rules, op)
            .iter()
            .map(|check| {
                let cell = self.cells.get(&check.key).map(|cell| cell.value().clone());
                let used = cell.map_or(0, |cell| cell.lock().used(now, check.key.window));
                check.rate.permits().saturating_sub(used)
            })
            .min()
            .unwrap_or(u32::MAX)
    }

    /// Drop cells whose usage has fully expired and that no request holds.
    pub(crate) fn clean_up(&self, now: Timestamp) -> usize {
        let mut removed = 0;
        self.cells.retain(|key, cell| {
            // a request holding the cell may be about to record into it
            if Arc::strong_count(cell) > 1 {
                return true;
            }
            let drained = cell.lock().is_drained(now, key.window);
            if drained {
                removed += 1;
            }
            !drained
        });
        if removed > 0 {
            debug!(removed, remaining = self.cells.len(), "Cleaned up rate limit cells");
        }
        removed
    }

    pub(crate) fn snapshot(&self, now: Timestamp) -> Vec<CellSnapshot> {
        let mut snapshot: Vec<CellSnapshot> = self
            .cells
            .iter()
            .map(|entry| {
                let key = entry.key();
                let cell = entry.value().lock();
                CellSnapshot {
                    rule: key.rule.to_string(),
                    grouping: key.grouping.to_string(),
                    group: key.group.clone(),
                    window: key.window,
                    used: cell.used(now, key.window),
                    resets_in: cell.next_expiry(now, key.window),
                }
            })
            .collect();
        snapshot.sort_by(|a, b| {
            (&a.rule, &a.grouping, &a.group, a.window).cmp(&(&b.rule, &b.grouping, &b.group, b.window))
        });
        snapshot
    }

    /// Grants every live cell still counts at `now`, ordered by cell key.
    pub(crate) fn grant_history(&self, now: Timestamp) -> GrantHistory {
        let mut cells: Vec<(CellKey, Vec<(Timestamp, u32)>)> = self
            .cells
            .iter()
            .map(|entry| {
                let grants = entry.value().lock().grants(now, entry.key().window);
                (entry.key().clone(), grants)
            })
            .filter(|(_, grants)| !grants.is_empty())
            .collect();
        cells.sort_by(|a, b| a.0.cmp(&b.0));
        GrantHistory {
            policy: self.policy,
            cells: cells
                .into_iter()
                .map(|(key, grants)| CellGrants {
                    rule: key.rule.to_string(),
                    grouping: key.grouping.to_string(),
                    group: match &key.group {
                        GroupKey::Global => None,
                        GroupKey::Value(value) => Some(value.to_string()),
                    },
                    window: key.window,
                    grants,
                })
                .collect(),
        }
    }

    /// Record the grants of `history` that still count at `now` on top of
    /// the current usage. Returns how many grants were added.
    pub(crate) fn add_grant_history(&self, history: &GrantHistory, now: Timestamp) -> Result<usize> {
        if history.policy != self.policy {
            return Err(TurnstileError::InvalidArgument(format!(
                "grant history uses {:?} windows, limiter uses {:?}",
                history.policy, self.policy
            )));
        }
        let mut added = 0;
        for cell_grants in &history.cells {
            let live: Vec<_> = cell_grants
                .grants
                .iter()
                .filter(|(at, permits)| *permits > 0 && elapsed(*at, now) < cell_grants.window)
                .collect();
            if live.is_empty() {
                continue;
            }
            let key = cell_grants.key();
            let cell = self.cell(&key);
            let mut cell = cell.lock();
            for (at, permits) in live {
                cell.record(*at, key.window, *permits);
                added += 1;
            }
        }
        info!(added, cells = history.cells.len(), "Added grant history");
        Ok(added)
    }

    pub(crate) fn len(&self) -> usize {
        self.cells.len()
    }
}
