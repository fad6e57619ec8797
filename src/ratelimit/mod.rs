//! Rate limiting logic and state management.

mod backend;
mod burst_rate;
mod cells;
mod counter;
mod descriptor;
mod dynamic;
mod multi;
mod rule;
mod rules;
mod token_bucket;

pub use backend::{OpRateLimiter, Permits, RateUnlimiter};
pub use burst_rate::{BurstRate, TimeUnit};
pub use cells::{CellGrants, CellSnapshot, GrantHistory};
pub use counter::{WindowCell, WindowPolicy};
pub use descriptor::Descriptor;
pub use dynamic::DynamicMultiRateLimiter;
pub use multi::MultiRateLimiter;
pub use rule::{rules_flat, GroupKey, Grouping, Rule, RuleFlat};
pub use rules::{GroupingConfig, MatchConfig, RateConfig, RuleConfig, RuleSetConfig};
pub use token_bucket::{
    KeyState, StateChangeHook, TokenBucketConfig, TokenBucketRateLimiter, TokenBucketState,
    DEFAULT_KEY,
};
