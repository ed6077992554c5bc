//! Periodic eviction of expired host limiters.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::info;

use crate::upstream::store::ProxyStore;

/// Sweeps every upstream's limiter list on a fixed cadence, evicting
/// deletable entries that have not been read for [`super::LIMITER_TTL`].
pub struct LimiterGc {
    store: Arc<dyn ProxyStore>,
    period: Duration,
}

impl LimiterGc {
    #[must_use]
    pub fn new(store: Arc<dyn ProxyStore>) -> Self {
        Self { store, period: super::GC_INTERVAL }
    }

    #[must_use]
    pub fn with_period(store: Arc<dyn ProxyStore>, period: Duration) -> Self {
        Self { store, period }
    }

    /// Spawns the sweep loop; exits when the shutdown channel fires.
    #[must_use]
    pub fn start_with_shutdown(
        &self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let period = self.period;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            // The first tick fires immediately; skip it so a fresh start
            // does not sweep an empty map.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = store.gc_limiters().await;
                        info!(removed, "cleaned up limiters");
                    }
                    _ = shutdown_rx.recv() => {
                        info!("limiter gc shutting down");
                        break;
                    }
                }
            }
        })
    }
}
