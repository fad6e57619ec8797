//! Window counters backing each burst rate of a grouping.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use crate::clock::{elapsed, Timestamp};

/// How a cell decides which past grants still count.
///
/// Both policies treat a grant as expired once `now - t >= window`, so a
/// request arriving exactly one window after the grant sees it gone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowPolicy {
    /// Every grant counts for exactly one window after it was made.
    #[default]
    Sliding,
    /// Grants accumulate in a window anchored at the first grant after the
    /// previous window expired.
    Fixed,
}

#[derive(Debug, Clone)]
enum Usage {
    Sliding {
        /// Grants in timestamp order
        grants: VecDeque<(Timestamp, u32)>,
    },
    Fixed {
        window_start: Option<Timestamp>,
        count: u32,
    },
}

/// Counter for one (rule, grouping, group key, window) combination.
///
/// The cell does not know its limit; callers compare [`WindowCell::used`]
/// against the rate's permits before calling [`WindowCell::record`]. Reading
/// never mutates, so a check that ends in a denial leaves no trace.
#[derive(Debug, Clone)]
pub struct WindowCell {
    usage: Usage,
}

impl WindowCell {
    /// Create an empty cell.
    pub fn new(policy: WindowPolicy) -> Self {
        let usage = match policy {
            WindowPolicy::Sliding => Usage::Sliding {
                grants: VecDeque::new(),
            },
            WindowPolicy::Fixed => Usage::Fixed {
                window_start: None,
                count: 0,
            },
        };
        Self { usage }
    }

    /// Permits counted against `window` at `now`.
    pub fn used(&self, now: Timestamp, window: Duration) -> u32 {
        match &self.usage {
            Usage::Sliding { grants } => grants
                .iter()
                .filter(|(at, _)| elapsed(*at, now) < window)
                .fold(0u32, |sum, (_, permits)| sum.saturating_add(*permits)),
            Usage::Fixed {
                window_start,
                count,
            } => match window_start {
                Some(start) if elapsed(*start, now) < window => *count,
                _ => 0,
            },
        }
    }

    /// Count `permits` granted at `now`.
    pub fn record(&mut self, now: Timestamp, window: Duration, permits: u32) {
        match &mut self.usage {
            Usage::Sliding { grants } => {
                while grants
                    .front()
                    .is_some_and(|(at, _)| elapsed(*at, now) >= window)
                {
                    grants.pop_front();
                }
                // the clock may have gone backwards, so insert in order
                let slot = grants.partition_point(|(at, _)| *at < now);
                match grants.get_mut(slot) {
                    Some((at, count)) if *at == now => *count = count.saturating_add(permits),
                    _ => grants.insert(slot, (now, permits)),
                }
            }
            Usage::Fixed {
                window_start,
                count,
            } => match window_start {
                Some(start) if elapsed(*start, now) < window => {
                    *count = count.saturating_add(permits);
                }
                _ => {
                    *window_start = Some(now);
                    *count = permits;
                }
            },
        }
    }

    /// Whether nothing recorded still counts, i.e. the cell can be dropped
    /// without losing information.
    pub fn is_drained(&self, now: Timestamp, window: Duration) -> bool {
        self.used(now, window) == 0
    }

    /// When the oldest counted grant stops counting, if any does.
    pub fn next_expiry(&self, now: Timestamp, window: Duration) -> Option<Duration> {
        let oldest = match &self.usage {
            Usage::Sliding { grants } => grants
                .iter()
                .find(|(at, _)| elapsed(*at, now) < window)
                .map(|(at, _)| *at),
            Usage::Fixed {
                window_start: Some(start),
                ..
            } if elapsed(*start, now) < window => Some(*start),
            Usage::Fixed { .. } => None,
        }?;
        // a grant stamped after `now` counts for its full window from then on
        Some(window.saturating_sub(elapsed(oldest, now)) + elapsed(now, oldest))
    }

    /// Undo up to `permits` counted at `now`, newest grants first.
    pub fn give_back(&mut self, now: Timestamp, window: Duration, permits: u32) {
        match &mut self.usage {
            Usage::Sliding { grants } => {
                let mut left = permits;
                for (_, count) in grants
                    .iter_mut()
                    .rev()
                    .take_while(|(at, _)| elapsed(*at, now) < window)
                {
                    let taken = left.min(*count);
                    *count -= taken;
                    left -= taken;
                    if left == 0 {
                        break;
                    }
                }
                grants.retain(|(_, count)| *count > 0);
            }
            Usage::Fixed {
                window_start,
                count,
            } => {
                if matches!(*window_start, Some(start) if elapsed(start, now) < window) {
                    *count = count.saturating_sub(permits);
                }
            }
        }
    }

    /// Grants still counted at `now`, oldest first.
    ///
    /// A fixed window reports its whole count at the window start. Recording
    /// the returned grants into an empty cell of the same policy reproduces
    /// the usage.
    pub fn grants(&self, now: Timestamp, window: Duration) -> Vec<(Timestamp, u32)> {
        match &self.usage {
            Usage::Sliding { grants } => grants
                .iter()
                .filter(|(at, _)| elapsed(*at, now) < window)
                .copied()
                .collect(),
            Usage::Fixed {
                window_start: Some(start),
                count,
            } if *count > 0 && elapsed(*start, now) < window => vec![(*start, *count)],
            Usage::Fixed { .. } => Vec::new(),
        }
    }
}
