//! Background cleanup of limiter state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::ratelimit::{DynamicMultiRateLimiter, MultiRateLimiter, TokenBucketRateLimiter};

/// State that can be swept of entries carrying no information.
pub trait CleanUp: Send + Sync {
    /// Remove what can be removed and return how many entries went.
    fn clean_up(&self) -> usize;
}

impl CleanUp for TokenBucketRateLimiter {
    fn clean_up(&self) -> usize {
        self.clean_up_now(false)
    }
}

impl<O: ?Sized> CleanUp for MultiRateLimiter<O> {
    fn clean_up(&self) -> usize {
        self.clean_up_now()
    }
}

impl<O: ?Sized + 'static> CleanUp for DynamicMultiRateLimiter<O> {
    fn clean_up(&self) -> usize {
        self.clean_up_now()
    }
}

/// Periodically runs [`CleanUp::clean_up`] on a tokio task.
///
/// The task stops on [`CleanupTask::shutdown`] or when the handle is dropped.
#[derive(Debug)]
pub struct CleanupTask {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl CleanupTask {
    /// Start sweeping `target` every `interval`, the first sweep one
    /// interval from now.
    pub fn spawn<C>(target: Arc<C>, interval: Duration) -> Self
    where
        C: CleanUp + ?Sized + 'static,
    {
        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // discard the first tick
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = target.clean_up();
                        debug!(removed, "Cleanup sweep finished");
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
            info!("Cleanup task stopped");
        });

        Self { shutdown, handle }
    }

    /// Stop the task and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::{BurstRate, Grouping, Rule};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingCleanUp {
        calls: AtomicUsize,
    }

    impl CleanUp for CountingCleanUp {
        fn clean_up(&self) -> usize {
            self.calls.fetch_add(1, Ordering::SeqCst);
            0
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeps_every_interval_until_shutdown() {
        let target = Arc::new(CountingCleanUp::default());
        let task = CleanupTask::spawn(target.clone(), Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(target.calls.load(Ordering::SeqCst), 3);

        task.shutdown().await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(target.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicts_drained_cells() {
        let clock = ManualClock::new(Utc::now());
        let rules = vec![Rule::<str>::everything(
            "api",
            vec![Grouping::global("global", vec![BurstRate::per_second(3)])],
        )];
        let limiter = Arc::new(MultiRateLimiter::new(rules, clock.clone()));
        limiter.require_permits("op").unwrap();

        let task = CleanupTask::spawn(limiter.clone(), Duration::from_secs(1));
        clock.advance(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(limiter.cells().is_empty());
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_works_with_trait_objects() {
        let target: Arc<dyn CleanUp> = Arc::new(CountingCleanUp::default());
        let task = CleanupTask::spawn(target, Duration::from_secs(1));
        task.shutdown().await;
    }
}
