//! Liveness probing of dead upstreams.
//!
//! Every cycle, each dead upstream gets a GET to the probe URL through its
//! own client; a 2xx response revives it. Probes run under a bounded
//! worker pool so a large graveyard cannot flood egress.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info};

use super::store::ProxyStore;
use crate::config::SharedConfig;

/// Interval between probe cycles.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Periodically revives dead upstreams that answer the probe URL.
pub struct Prober {
    store: Arc<dyn ProxyStore>,
    config: SharedConfig,
    period: Duration,
}

impl Prober {
    #[must_use]
    pub fn new(store: Arc<dyn ProxyStore>, config: SharedConfig) -> Self {
        Self { store, config, period: PROBE_INTERVAL }
    }

    #[must_use]
    pub fn with_period(
        store: Arc<dyn ProxyStore>,
        config: SharedConfig,
        period: Duration,
    ) -> Self {
        Self { store, config, period }
    }

    /// Spawns the probe loop; exits when the shutdown channel fires.
    #[must_use]
    pub fn start_with_shutdown(
        self: Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.revive_dead().await,
                    _ = shutdown_rx.recv() => {
                        info!("prober shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// One probe cycle over the current dead pool.
    pub async fn revive_dead(&self) {
        let config = self.config.load_full();
        let dead = self.store.dead().await;
        if dead.is_empty() {
            return;
        }
        debug!(count = dead.len(), "probing dead proxies");

        stream::iter(dead)
            .for_each_concurrent(config.probe_workers.max(1), |upstream| {
                let probe_url = config.probe_url.clone();
                async move {
                    match upstream.probe(&probe_url).await {
                        Ok(response) if response.status().is_success() => {
                            info!(proxy = %upstream.name(), "probe succeeded, reviving");
                            self.store.mark_alive(upstream.name()).await;
                        }
                        Ok(response) => {
                            debug!(
                                proxy = %upstream.name(),
                                status = response.status().as_u16(),
                                "probe failed"
                            );
                        }
                        Err(e) => {
                            debug!(proxy = %upstream.name(), error = %e, "probe failed");
                        }
                    }
                }
            })
            .await;
    }
}
