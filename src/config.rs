//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{TokenBucketConfig, WindowPolicy};

/// Prefix of environment variables overriding file settings, e.g.
/// `TURNSTILE__CLEANUP__INTERVAL_SECS=5`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Rule file configuration
    #[serde(default)]
    pub rules: RulesConfig,

    /// Background cleanup configuration
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Window accounting for rule-based limiters
    #[serde(default)]
    pub window_policy: WindowPolicy,

    /// Optional token bucket applied before the rules
    #[serde(default)]
    pub token_bucket: Option<TokenBucketSettings>,
}

/// Rule file configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Path to the rate limit rules file
    #[serde(default)]
    pub path: Option<String>,

    /// How often the rules file is checked for changes, in seconds
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            path: None,
            reload_interval_secs: default_reload_interval(),
        }
    }
}

impl RulesConfig {
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs.max(1))
    }
}

fn default_reload_interval() -> u64 {
    10
}

/// Background cleanup configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Interval between cleanup sweeps, in seconds
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
        }
    }
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

fn default_cleanup_interval() -> u64 {
    60
}

/// Token bucket settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketSettings {
    /// Bucket capacity
    pub capacity: u32,

    /// Tokens added per second
    pub refill_rate: f64,

    /// Idle time after which full buckets are dropped, in seconds
    #[serde(default = "default_cleanup_idle_after")]
    pub cleanup_idle_after_secs: u64,
}

fn default_cleanup_idle_after() -> u64 {
    300
}

impl TryFrom<&TokenBucketSettings> for TokenBucketConfig {
    type Error = TurnstileError;

    fn try_from(settings: &TokenBucketSettings) -> Result<Self> {
        Ok(TokenBucketConfig::new(settings.capacity, settings.refill_rate)?
            .with_cleanup_idle_after(Duration::from_secs(settings.cleanup_idle_after_secs)))
    }
}

impl TurnstileConfig {
    /// Load configuration from a YAML file, with `TURNSTILE__*` environment
    /// variables taking precedence.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(Some(path.as_ref()))
    }

    /// Load configuration from defaults and environment variables only.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize::<Self>())
            .map_err(|e| TurnstileError::Config(e.to_string()))
    }
}
