//! Live reloading of rule files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::observable::ObservableValue;
use crate::ratelimit::{Descriptor, Rule, RuleSetConfig};

/// Rules compiled from a rule file.
pub type DescriptorRules = Vec<Rule<Descriptor>>;

/// Polls a rule file and publishes recompiled rules whenever its contents
/// change. A file that fails to parse or compile is logged and skipped; the
/// previously published rules stay in force.
#[derive(Debug)]
pub struct RuleFileWatcher {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

async fn load(path: &Path) -> Result<(String, DescriptorRules)> {
    let contents = tokio::fs::read_to_string(path).await?;
    let rules = RuleSetConfig::from_yaml(&contents)?.compile()?;
    Ok((contents, rules))
}

impl RuleFileWatcher {
    /// Load `path` into `target`, then keep polling it every `interval`.
    ///
    /// Fails if the initial load fails.
    pub async fn spawn(
        path: impl Into<PathBuf>,
        interval: Duration,
        target: ObservableValue<DescriptorRules>,
    ) -> Result<Self> {
        let path = path.into();
        let (mut last, rules) = load(&path).await?;
        info!(path = %path.display(), rules = rules.len(), "Loaded rate limit rules");
        target.set(rules);

        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // discard the first tick
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = &mut shutdown_rx => break,
                }

                let contents = match tokio::fs::read_to_string(&path).await {
                    Ok(contents) => contents,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to read rate limit rules");
                        continue;
                    }
                };
                if contents == last {
                    debug!(path = %path.display(), "Rate limit rules unchanged");
                    continue;
                }

                match RuleSetConfig::from_yaml(&contents).and_then(|config| config.compile()) {
                    Ok(rules) => {
                        info!(path = %path.display(), rules = rules.len(), "Reloaded rate limit rules");
                        target.set(rules);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Keeping previous rate limit rules");
                    }
                }
                // a broken file is only reported once
                last = contents;
            }
        });

        Ok(Self { shutdown, handle })
    }

    /// Stop polling and wait for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observable::Observable;
    use std::io::Write;

    const ONE_RULE: &str = r#"
rules:
  - name: api
    groupings:
      - name: global
        rates:
          - { requests_per_unit: 3, unit: second }
"#;

    const TWO_RULES: &str = r#"
rules:
  - name: api
    groupings:
      - name: global
        rates:
          - { requests_per_unit: 5, unit: second }
  - name: login
"#;

    fn write_rules(file: &tempfile::NamedTempFile, contents: &str) {
        let mut handle = file.reopen().unwrap();
        handle.set_len(0).unwrap();
        handle.write_all(contents.as_bytes()).unwrap();
        handle.sync_all().unwrap();
    }

    fn rule_names(value: &ObservableValue<DescriptorRules>) -> Vec<String> {
        value.current().iter().map(|r| r.name().to_string()).collect()
    }

    #[tokio::test]
    async fn test_initial_load() {
        let file = tempfile::NamedTempFile::new().unwrap();
        write_rules(&file, ONE_RULE);

        let target = ObservableValue::new(Vec::new());
        let watcher = RuleFileWatcher::spawn(file.path(), Duration::from_secs(60), target.clone())
            .await
            .unwrap();

        assert_eq!(rule_names(&target), ["api"]);
        watcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_initial_load_failure() {
        let file = tempfile::NamedTempFile::new().unwrap();
        write_rules(&file, "rules: [");

        let target = ObservableValue::new(Vec::new());
        let result = RuleFileWatcher::spawn(file.path(), Duration::from_secs(60), target).await;
        assert!(result.is_err());

        let missing = RuleFileWatcher::spawn(
            "/nonexistent/rules.yaml",
            Duration::from_secs(60),
            ObservableValue::new(Vec::new()),
        )
        .await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn test_reloads_changed_file_and_keeps_rules_on_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        write_rules(&file, ONE_RULE);

        let target = ObservableValue::new(Vec::new());
        let watcher = RuleFileWatcher::spawn(file.path(), Duration::from_millis(20), target.clone())
            .await
            .unwrap();

        write_rules(&file, TWO_RULES);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(rule_names(&target), ["api", "login"]);
        assert_eq!(target.current()[0].groupings()[0].rates()[0].permits(), 5);

        write_rules(&file, "rules:\n  - name: api\n  - name: api\n");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(rule_names(&target), ["api", "login"]);

        watcher.shutdown().await;
    }
}
