use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::tls::cache::CertCache;

/// Periodically evicts cache entries that are about to expire.
pub struct Janitor {
    cache: Arc<CertCache>,
    interval: Duration,
    horizon: Duration,
}

impl Janitor {
    pub fn new(cache: Arc<CertCache>, interval: Duration, horizon: Duration) -> Self {
        Self {
            cache,
            interval,
            horizon,
        }
    }

    pub fn sweep(&self) -> usize {
        let evicted = self.cache.evict_expiring(self.horizon);
        debug!(evicted, remaining = self.cache.len(), "certificate cache swept");
        evicted
    }

    /// Sweeps every `interval` until `shutdown` fires. The first sweep runs immediately.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("certificate cache janitor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::test_support::test_factory;

    #[tokio::test]
    async fn evicts_on_tick_and_stops_on_cancel() {
        let cache = Arc::new(CertCache::new());
        let short = test_factory(Duration::from_secs(120));
        let long = test_factory(Duration::from_secs(3600));
        cache.store("short.test", short.issue("short.test").unwrap());
        cache.store("long.test", long.issue("long.test").unwrap());

        let janitor = Janitor::new(
            Arc::clone(&cache),
            Duration::from_millis(20),
            Duration::from_secs(300),
        );
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(janitor.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cache.lookup("short.test").is_none());
        assert!(cache.lookup("long.test").is_some());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("janitor did not stop")
            .unwrap();
    }
}
