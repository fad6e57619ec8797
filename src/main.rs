use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::cleanup::CleanupTask;
use turnstile::config::TurnstileConfig;
use turnstile::ratelimit::{
    Descriptor, DynamicMultiRateLimiter, TokenBucketConfig, TokenBucketRateLimiter,
};
use turnstile::reload::RuleFileWatcher;
use turnstile::{ObservableValue, SystemClock, TurnstileError};

/// Admission decisions for descriptors read from stdin, one per line
/// (`domain:key=value,...`). Decisions are printed to stdout as JSON.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Path to the service configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the rate limit rules file (overrides the configuration)
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, Serialize)]
struct Decision<'a> {
    input: &'a str,
    allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries decisions
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if args.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => TurnstileConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => TurnstileConfig::from_env()?,
    };
    let rules_path = args
        .rules
        .clone()
        .or_else(|| config.rules.path.as_ref().map(PathBuf::from))
        .context("no rules file given (use --rules or rules.path)")?;
    info!(rules = %rules_path.display(), policy = ?config.window_policy, "Configuration loaded");

    let rules = ObservableValue::new(Vec::new());
    let watcher = RuleFileWatcher::spawn(&rules_path, config.rules.reload_interval(), rules.clone())
        .await
        .with_context(|| format!("loading rules from {}", rules_path.display()))?;

    let limiter = Arc::new(
        DynamicMultiRateLimiter::new(rules, SystemClock).with_window_policy(config.window_policy),
    );
    let mut cleanup = vec![CleanupTask::spawn(limiter.clone(), config.cleanup.interval())];

    let bucket = match &config.token_bucket {
        Some(settings) => {
            let bucket = Arc::new(TokenBucketRateLimiter::new(
                TokenBucketConfig::try_from(settings)?,
                SystemClock,
            ));
            cleanup.push(CleanupTask::spawn(bucket.clone(), config.cleanup.interval()));
            Some(bucket)
        }
        None => None,
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut shutdown => break,
        };
        let Some(line) = line else {
            info!("Input closed");
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        let decision = match input.parse::<Descriptor>() {
            Ok(descriptor) => {
                match admit(bucket.as_deref(), &limiter, &descriptor) {
                    Ok(()) => Decision {
                        input,
                        allowed: true,
                        reason: None,
                    },
                    Err(e @ TurnstileError::RateLimitExceeded(_)) => Decision {
                        input,
                        allowed: false,
                        reason: Some(e.to_string()),
                    },
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => {
                warn!(input = %input, error = %e, "Skipping malformed descriptor");
                Decision {
                    input,
                    allowed: false,
                    reason: Some(e.to_string()),
                }
            }
        };
        println!("{}", serde_json::to_string(&decision)?);
    }

    watcher.shutdown().await;
    for task in cleanup {
        task.shutdown().await;
    }

    info!("Turnstile stopped");
    Ok(())
}

/// Admit one operation for `descriptor`: a token from the domain's bucket,
/// if configured, then a permit from every matching rule. A token taken for
/// an operation the rules deny is returned.
fn admit(
    bucket: Option<&TokenBucketRateLimiter>,
    limiter: &DynamicMultiRateLimiter<Descriptor>,
    descriptor: &Descriptor,
) -> turnstile::Result<()> {
    let Some(bucket) = bucket else {
        return limiter.require_permits(descriptor);
    };
    bucket.require_permits(&descriptor.domain, 1)?;
    let admitted = limiter.require_permits(descriptor);
    if admitted.is_err() {
        bucket.give_back(&descriptor.domain, 1);
    }
    admitted
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use turnstile::ratelimit::{BurstRate, Grouping, Rule};
    use turnstile::ManualClock;

    fn descriptor(user: &str) -> Descriptor {
        Descriptor::new("edge", [("user", user)])
    }

    #[test]
    fn test_denied_operation_keeps_bucket_token() {
        let clock = ManualClock::new(Utc::now());
        let bucket =
            TokenBucketRateLimiter::new(TokenBucketConfig::new(3, 0.001).unwrap(), clock.clone());
        let rules = ObservableValue::new(vec![Rule::everything(
            "users",
            vec![Grouping::new(
                "user",
                |d: &Descriptor| d.get("user").unwrap_or_default().to_string(),
                vec![BurstRate::per_minute(1)],
            )],
        )]);
        let limiter = DynamicMultiRateLimiter::new(rules, clock);

        admit(Some(&bucket), &limiter, &descriptor("alice")).unwrap();
        for _ in 0..5 {
            let err = admit(Some(&bucket), &limiter, &descriptor("alice")).unwrap_err();
            assert!(matches!(err, TurnstileError::RateLimitExceeded(_)));
        }

        // only the admitted operation spent a token
        assert_eq!(bucket.available_permits("edge"), 2);
        admit(Some(&bucket), &limiter, &descriptor("bob")).unwrap();
        admit(Some(&bucket), &limiter, &descriptor("carol")).unwrap();
        assert!(admit(Some(&bucket), &limiter, &descriptor("dave")).is_err());
        assert!(admit(None, &limiter, &descriptor("dave")).is_ok());
    }
}
