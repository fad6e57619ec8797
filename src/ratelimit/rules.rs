//! Rate limit rule sets loaded from configuration.
//!
//! A rule set is a YAML document that compiles into [`Rule<Descriptor>`]
//! trees:
//!
//! ```yaml
//! domain: edge
//! rules:
//!   - name: api
//!     match:
//!       - key: path
//!         prefix: /api
//!     groupings:
//!       - name: global
//!         rates:
//!           - { requests_per_unit: 6, unit: second }
//!       - name: ip
//!         group_by: [remote_address]
//!         rates:
//!           - { requests_per_unit: 3, unit: second }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

use super::burst_rate::{BurstRate, TimeUnit};
use super::descriptor::Descriptor;
use super::rule::{GroupKey, Grouping, Rule};
use crate::error::{Result, TurnstileError};

/// A complete rule set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSetConfig {
    /// If set, rules only apply to descriptors of this domain
    #[serde(default)]
    pub domain: Option<String>,
    /// Rules in evaluation order
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// Configuration for a single rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Rule name, unique within the rule set
    pub name: String,
    /// Conditions that must all hold; empty matches every descriptor
    #[serde(default, rename = "match")]
    pub matches: Vec<MatchConfig>,
    /// Groupings in evaluation order
    #[serde(default)]
    pub groupings: Vec<GroupingConfig>,
}

/// A condition on one descriptor entry.
///
/// With `value` the entry must equal it, with `prefix` it must start with
/// it. With neither, the key only has to be present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchConfig {
    /// The entry key
    pub key: String,
    /// Exact value to match
    #[serde(default)]
    pub value: Option<String>,
    /// Value prefix to match
    #[serde(default)]
    pub prefix: Option<String>,
}

/// Configuration for a grouping within a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupingConfig {
    /// Grouping name, unique within its rule
    pub name: String,
    /// Entry keys whose values form the group key; empty means global
    #[serde(default)]
    pub group_by: Vec<String>,
    /// Rates enforced per group
    pub rates: Vec<RateConfig>,
}

/// A rate in Envoy-style notation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateConfig {
    /// Number of requests allowed per window
    pub requests_per_unit: u32,
    /// The time unit
    pub unit: TimeUnit,
    /// Window length in units
    #[serde(default = "default_units")]
    pub units: u32,
}

fn default_units() -> u32 {
    1
}

impl MatchConfig {
    fn matches(&self, descriptor: &Descriptor) -> bool {
        let Some(actual) = descriptor.get(&self.key) else {
            return false;
        };
        if let Some(value) = &self.value {
            if actual != value {
                return false;
            }
        }
        if let Some(prefix) = &self.prefix {
            if !actual.starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }
}

impl RateConfig {
    fn compile(&self) -> Result<BurstRate> {
        if self.units == 0 {
            return Err(TurnstileError::Config(
                "rate units must be at least 1".to_string(),
            ));
        }
        BurstRate::per(self.requests_per_unit, self.units, self.unit)
    }
}

impl GroupingConfig {
    fn compile(&self, rule: &str) -> Result<Grouping<Descriptor>> {
        let mut rates = Vec::with_capacity(self.rates.len());
        for (index, rate) in self.rates.iter().enumerate() {
            rates.push(rate.compile().map_err(|e| {
                TurnstileError::Config(format!(
                    "rule '{}', grouping '{}', rate #{}: {}",
                    rule, self.name, index, e
                ))
            })?);
        }

        if self.group_by.is_empty() {
            return Ok(Grouping::global(self.name.as_str(), rates));
        }

        let keys = self.group_by.clone();
        Ok(Grouping::new(
            self.name.as_str(),
            move |descriptor: &Descriptor| group_key(&keys, descriptor),
            rates,
        ))
    }
}

/// Values of `keys` in `descriptor`, joined with `|`. Missing entries
/// contribute an empty value; `\` and `|` inside values are escaped so
/// distinct value tuples never share a key.
fn group_key(keys: &[String], descriptor: &Descriptor) -> GroupKey {
    let mut joined = String::new();
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            joined.push('|');
        }
        for c in descriptor.get(key).unwrap_or_default().chars() {
            if c == '|' || c == '\\' {
                joined.push('\\');
            }
            joined.push(c);
        }
    }
    GroupKey::from(joined)
}

impl RuleSetConfig {
    /// Load a rule set from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a rule set from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse rate limit rules: {}", e)))
    }

    /// Build the rules, validating names and rates.
    pub fn compile(&self) -> Result<Vec<Rule<Descriptor>>> {
        let mut names = HashSet::new();
        let mut rules = Vec::with_capacity(self.rules.len());

        for rule in &self.rules {
            if !names.insert(rule.name.as_str()) {
                return Err(TurnstileError::Config(format!(
                    "duplicate rule name '{}'",
                    rule.name
                )));
            }

            let mut grouping_names = HashSet::new();
            let mut groupings = Vec::with_capacity(rule.groupings.len());
            for grouping in &rule.groupings {
                if !grouping_names.insert(grouping.name.as_str()) {
                    return Err(TurnstileError::Config(format!(
                        "duplicate grouping name '{}' in rule '{}'",
                        grouping.name, rule.name
                    )));
                }
                groupings.push(grouping.compile(&rule.name)?);
            }

            let domain = self.domain.clone();
            let matches = rule.matches.clone();
            rules.push(Rule::new(
                rule.name.as_str(),
                move |descriptor: &Descriptor| {
                    domain.as_ref().map_or(true, |d| *d == descriptor.domain)
                        && matches.iter().all(|m| m.matches(descriptor))
                },
                groupings,
            ));
        }

        debug!(rules = rules.len(), "Compiled rate limit rules");
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::MultiRateLimiter;
    use chrono::Utc;
    use std::time::Duration;

    const API_RULES: &str = r#"
domain: edge
rules:
  - name: api
    match:
      - key: path
        prefix: /api
    groupings:
      - name: global
        rates:
          - requests_per_unit: 6
            unit: second
          - requests_per_unit: 60
            unit: minute
      - name: ip
        group_by: [remote_address]
        rates:
          - requests_per_unit: 3
            unit: second
  - name: login
    match:
      - key: path
        value: /login
    groupings:
      - name: user
        group_by: [user]
        rates:
          - requests_per_unit: 5
            unit: minute
            units: 15
"#;

    fn descriptor(entries: &[(&str, &str)]) -> Descriptor {
        Descriptor::new("edge", entries.iter().copied())
    }

    #[test]
    fn test_parse_rule_set() {
        let config = RuleSetConfig::from_yaml(API_RULES).unwrap();
        assert_eq!(config.domain.as_deref(), Some("edge"));
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[0].matches[0].prefix.as_deref(), Some("/api"));
        assert_eq!(config.rules[0].groupings[1].group_by, vec!["remote_address"]);
        assert_eq!(config.rules[0].groupings[0].rates[1].units, 1);
        assert_eq!(config.rules[1].groupings[0].rates[0].units, 15);
    }

    #[test]
    fn test_compile_rates() {
        let rules = RuleSetConfig::from_yaml(API_RULES).unwrap().compile().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].groupings()[0].rates()[1], BurstRate::per_minute(60));
        assert_eq!(
            rules[1].groupings()[0].rates()[0].window(),
            Duration::from_secs(15 * 60)
        );
    }

    #[test]
    fn test_compiled_scope() {
        let rules = RuleSetConfig::from_yaml(API_RULES).unwrap().compile().unwrap();
        let (api, login) = (&rules[0], &rules[1]);

        assert!(api.applies_to(&descriptor(&[("path", "/api/foobars")])));
        assert!(!api.applies_to(&descriptor(&[("path", "/login")])));
        assert!(!api.applies_to(&descriptor(&[("remote_address", "10.0.0.1")])));
        assert!(login.applies_to(&descriptor(&[("path", "/login")])));
        assert!(!login.applies_to(&descriptor(&[("path", "/login/reset")])));

        let other_domain = Descriptor::new("internal", [("path", "/api")]);
        assert!(!api.applies_to(&other_domain));
    }

    #[test]
    fn test_compiled_group_keys() {
        let rules = RuleSetConfig::from_yaml(API_RULES).unwrap().compile().unwrap();
        let op = descriptor(&[("path", "/api"), ("remote_address", "10.0.0.1")]);

        assert_eq!(rules[0].groupings()[0].group_of(&op), GroupKey::Global);
        assert_eq!(rules[0].groupings()[1].group_of(&op), GroupKey::from("10.0.0.1"));
        assert_eq!(
            rules[1].groupings()[0].group_of(&op),
            GroupKey::from(""),
        );
    }

    #[test]
    fn test_presence_match() {
        let yaml = r#"
rules:
  - name: authenticated
    match:
      - key: user
    groupings:
      - name: user
        group_by: [user, tenant]
        rates:
          - { requests_per_unit: 1, unit: second }
"#;
        let rules = RuleSetConfig::from_yaml(yaml).unwrap().compile().unwrap();
        let op = Descriptor::new("any", [("user", "alice"), ("tenant", "acme")]);

        assert!(rules[0].applies_to(&op));
        assert!(!rules[0].applies_to(&Descriptor::new("any", [("tenant", "acme")])));
        assert_eq!(rules[0].groupings()[0].group_of(&op), GroupKey::from("alice|acme"));
    }

    #[test]
    fn test_separator_in_values_keeps_groups_apart() {
        let yaml = r#"
rules:
  - name: pairs
    groupings:
      - name: pair
        group_by: [a, b]
        rates:
          - { requests_per_unit: 1, unit: second }
"#;
        let rules = RuleSetConfig::from_yaml(yaml).unwrap().compile().unwrap();
        let left = Descriptor::new("any", [("a", "x|y"), ("b", "z")]);
        let right = Descriptor::new("any", [("a", "x"), ("b", "y|z")]);
        let slash = Descriptor::new("any", [("a", r"x\"), ("b", "y|z")]);

        let grouping = &rules[0].groupings()[0];
        assert_eq!(grouping.group_of(&left), GroupKey::from(r"x\|y|z"));
        assert_ne!(grouping.group_of(&left), grouping.group_of(&right));
        assert_ne!(grouping.group_of(&slash), grouping.group_of(&right));

        let limiter = MultiRateLimiter::new(rules, ManualClock::new(Utc::now()));
        limiter.require_permits(&left).unwrap();
        limiter.require_permits(&right).unwrap();
        limiter.require_permits(&slash).unwrap();
        assert!(limiter.require_permits(&left).is_err());
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let yaml = r#"
rules:
  - name: api
  - name: api
"#;
        let err = RuleSetConfig::from_yaml(yaml).unwrap().compile().unwrap_err();
        assert!(matches!(err, TurnstileError::Config(msg) if msg.contains("duplicate rule")));

        let yaml = r#"
rules:
  - name: api
    groupings:
      - name: ip
        rates: []
      - name: ip
        rates: []
"#;
        let err = RuleSetConfig::from_yaml(yaml).unwrap().compile().unwrap_err();
        assert!(matches!(err, TurnstileError::Config(msg) if msg.contains("duplicate grouping")));
    }

    #[test]
    fn test_zero_units_are_rejected() {
        let yaml = r#"
rules:
  - name: api
    groupings:
      - name: global
        rates:
          - { requests_per_unit: 1, unit: second, units: 0 }
"#;
        let err = RuleSetConfig::from_yaml(yaml).unwrap().compile().unwrap_err();
        assert!(matches!(err, TurnstileError::Config(msg) if msg.contains("units")));
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(RuleSetConfig::from_yaml("rules: [").is_err());
        assert!(RuleSetConfig::from_yaml("rules:\n  - groupings: []").is_err());
    }

    #[test]
    fn test_compiled_rules_limit() {
        let rules = RuleSetConfig::from_yaml(API_RULES).unwrap().compile().unwrap();
        let limiter = MultiRateLimiter::new(rules, ManualClock::new(Utc::now()));
        let op = descriptor(&[("path", "/api"), ("remote_address", "10.0.0.1")]);

        for _ in 0..3 {
            limiter.require_permits(&op).unwrap();
        }
        assert!(limiter.require_permits(&op).is_err());
        assert_eq!(
            limiter.available_permits(&descriptor(&[("path", "/api"), ("remote_address", "10.0.0.2")])),
            3
        );
    }
}
