//! Rules and groupings: which operations a rate applies to, and how they are
//! partitioned.

use serde::{Serialize, Serializer};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use super::burst_rate::BurstRate;

/// Identity of a partition within a grouping, e.g. an IP address or a user id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupKey {
    /// The single partition of a global grouping
    Global,
    /// Any other partition
    Value(Arc<str>),
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::Global => write!(f, "global"),
            GroupKey::Value(value) => write!(f, "{}", value),
        }
    }
}

impl Serialize for GroupKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl From<()> for GroupKey {
    fn from(_: ()) -> Self {
        GroupKey::Global
    }
}

impl From<&str> for GroupKey {
    fn from(value: &str) -> Self {
        GroupKey::Value(Arc::from(value))
    }
}

impl From<String> for GroupKey {
    fn from(value: String) -> Self {
        GroupKey::Value(Arc::from(value))
    }
}

impl From<IpAddr> for GroupKey {
    fn from(value: IpAddr) -> Self {
        GroupKey::Value(Arc::from(value.to_string()))
    }
}

macro_rules! group_key_from_integer {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for GroupKey {
                fn from(value: $ty) -> Self {
                    GroupKey::Value(Arc::from(value.to_string()))
                }
            }
        )*
    };
}

group_key_from_integer!(u32, u64, i32, i64, usize);

type GroupFn<O> = dyn Fn(&O) -> GroupKey + Send + Sync;
type ScopeFn<O> = dyn Fn(&O) -> bool + Send + Sync;

/// One partitioning dimension of a rule, with the rates enforced per
/// partition. Every rate must admit an operation for the grouping to admit it.
pub struct Grouping<O: ?Sized> {
    name: Arc<str>,
    group_of: Arc<GroupFn<O>>,
    rates: Arc<[BurstRate]>,
}

impl<O: ?Sized> Grouping<O> {
    /// Create a grouping that partitions operations with `group_of`.
    pub fn new<G, F>(name: impl Into<Arc<str>>, group_of: F, rates: Vec<BurstRate>) -> Self
    where
        O: 'static,
        G: Into<GroupKey>,
        F: Fn(&O) -> G + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            group_of: Arc::new(move |op: &O| group_of(op).into()),
            rates: rates.into(),
        }
    }

    /// Create a grouping that puts every operation in the same partition.
    pub fn global(name: impl Into<Arc<str>>, rates: Vec<BurstRate>) -> Self
    where
        O: 'static,
    {
        Self {
            name: name.into(),
            group_of: Arc::new(|_: &O| GroupKey::Global),
            rates: rates.into(),
        }
    }

    /// The grouping's name, unique within its rule.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> &Arc<str> {
        &self.name
    }

    /// The partition `op` belongs to.
    pub fn group_of(&self, op: &O) -> GroupKey {
        (self.group_of)(op)
    }

    /// Rates enforced per partition, in evaluation order.
    pub fn rates(&self) -> &[BurstRate] {
        &self.rates
    }
}

impl<O: ?Sized> Clone for Grouping<O> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            group_of: self.group_of.clone(),
            rates: self.rates.clone(),
        }
    }
}

impl<O: ?Sized> fmt::Debug for Grouping<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Grouping")
            .field("name", &self.name)
            .field("rates", &self.rates)
            .finish_non_exhaustive()
    }
}

/// A named scope and the groupings that constrain operations inside it.
///
/// Rule names identify rate-limit state, so they should be unique within a
/// rule list.
pub struct Rule<O: ?Sized> {
    name: Arc<str>,
    scope: Arc<ScopeFn<O>>,
    groupings: Arc<[Grouping<O>]>,
}

impl<O: ?Sized> Rule<O> {
    /// Create a rule applying to operations for which `scope` holds.
    pub fn new<F>(name: impl Into<Arc<str>>, scope: F, groupings: Vec<Grouping<O>>) -> Self
    where
        F: Fn(&O) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            scope: Arc::new(scope),
            groupings: groupings.into(),
        }
    }

    /// Create a rule applying to every operation.
    pub fn everything(name: impl Into<Arc<str>>, groupings: Vec<Grouping<O>>) -> Self
    where
        O: 'static,
    {
        Self::new(name, |_: &O| true, groupings)
    }

    /// The rule's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> &Arc<str> {
        &self.name
    }

    /// Whether the rule applies to `op`.
    pub fn applies_to(&self, op: &O) -> bool {
        (self.scope)(op)
    }

    /// The rule's groupings, in evaluation order.
    pub fn groupings(&self) -> &[Grouping<O>] {
        &self.groupings
    }
}

impl<O: ?Sized> Clone for Rule<O> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            scope: self.scope.clone(),
            groupings: self.groupings.clone(),
        }
    }
}

impl<O: ?Sized> fmt::Debug for Rule<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("groupings", &self.groupings)
            .finish_non_exhaustive()
    }
}

/// One row of a flattened rule list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleFlat {
    pub rule: String,
    pub grouping: String,
    pub permits: u32,
    pub window: Duration,
}

/// Flatten rules into one row per (rule, grouping, rate).
pub fn rules_flat<O: ?Sized>(rules: &[Rule<O>]) -> impl Iterator<Item = RuleFlat> + '_ {
    rules.iter().flat_map(|rule| {
        rule.groupings().iter().flat_map(move |grouping| {
            grouping.rates().iter().map(move |rate| RuleFlat {
                rule: rule.name().to_string(),
                grouping: grouping.name().to_string(),
                permits: rate.permits(),
                window: rate.window(),
            })
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    struct Request {
        path: &'static str,
        ip: IpAddr,
        user: u64,
    }

    fn request() -> Request {
        Request {
            path: "/api/foobars",
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            user: 42,
        }
    }

    #[test]
    fn test_group_keys() {
        let by_ip = Grouping::new("ip", |r: &Request| r.ip, vec![BurstRate::per_second(3)]);
        let by_user = Grouping::new("user", |r: &Request| r.user, vec![]);
        let global = Grouping::<Request>::global("global", vec![]);

        assert_eq!(by_ip.group_of(&request()), GroupKey::from("10.0.0.1"));
        assert_eq!(by_user.group_of(&request()), GroupKey::from("42"));
        assert_eq!(global.group_of(&request()), GroupKey::Global);
        assert_eq!(GroupKey::from(()), GroupKey::Global);
    }

    #[test]
    fn test_rule_scope() {
        let api = Rule::new("api", |r: &Request| r.path.starts_with("/api"), vec![]);
        let other = Rule::new("other", |r: &Request| r.path == "/other", vec![]);
        let all = Rule::<Request>::everything("all", vec![]);

        assert!(api.applies_to(&request()));
        assert!(!other.applies_to(&request()));
        assert!(all.applies_to(&request()));
    }

    #[test]
    fn test_rules_flat() {
        let rules = vec![Rule::<Request>::everything(
            "api",
            vec![
                Grouping::global(
                    "global",
                    vec![BurstRate::per_second(6), BurstRate::per_minute(60)],
                ),
                Grouping::new("ip", |r: &Request| r.ip, vec![BurstRate::per_second(3)]),
            ],
        )];

        let flat: Vec<RuleFlat> = rules_flat(&rules).collect();
        assert_eq!(flat.len(), 3);
        assert_eq!(
            flat[1],
            RuleFlat {
                rule: "api".to_string(),
                grouping: "global".to_string(),
                permits: 60,
                window: Duration::from_secs(60),
            }
        );
        assert_eq!(flat[2].grouping, "ip");
    }

    #[test]
    fn test_debug_omits_closures() {
        let rule = Rule::<Request>::everything(
            "api",
            vec![Grouping::global("global", vec![BurstRate::per_second(1)])],
        );
        let debug = format!("{:?}", rule);
        assert!(debug.contains("\"api\""));
        assert!(debug.contains("global"));
    }
}
