//! In-process upstream store.
//!
//! Pool membership lives behind one readers-writer lock; per-upstream
//! counters are atomics, so selection takes the lock in read mode and only
//! alive/dead transitions and reloads take it in write mode. Scores are
//! computed from the atomic counters at selection time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::RwLock;
use tracing::{info, trace, warn};

use super::endpoint::Upstream;
use super::scoring::SELECTION_WINDOW;
use super::store::{AttemptRecord, ProxyStore, StoreError};
use crate::config::{HostEntry, SharedConfig};
use crate::limiter::{LimitChange, LimiterSet, LIMITER_TTL};
use crate::metrics::{MetricPoint, MetricsEmitter};

/// How an upstream is picked from the alive pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionStrategy {
    /// Uniform sample from the top-scored window, avoiding the proxy that
    /// just failed.
    #[default]
    TopScore,
    /// Fewest in-flight connections, ties broken uniformly.
    LeastConnections,
}

#[derive(Default)]
struct Pools {
    alive: Vec<Arc<Upstream>>,
    dead: Vec<Arc<Upstream>>,
}

/// Upstream registry and limiters held in process memory.
pub struct MemoryStore {
    config: SharedConfig,
    metrics: Arc<MetricsEmitter>,
    pools: RwLock<Pools>,
    limiters: DashMap<Arc<str>, Arc<LimiterSet>>,
    strategy: SelectionStrategy,
}

impl MemoryStore {
    /// Builds the store and registers the configured proxies.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when a configured proxy URL is invalid.
    pub async fn new(
        config: SharedConfig,
        metrics: Arc<MetricsEmitter>,
    ) -> Result<Self, StoreError> {
        Self::with_strategy(config, metrics, SelectionStrategy::default()).await
    }

    /// Builds the store with an explicit selection strategy.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when a configured proxy URL is invalid.
    pub async fn with_strategy(
        config: SharedConfig,
        metrics: Arc<MetricsEmitter>,
        strategy: SelectionStrategy,
    ) -> Result<Self, StoreError> {
        let store = Self {
            config,
            metrics,
            pools: RwLock::new(Pools::default()),
            limiters: DashMap::new(),
            strategy,
        };
        store.rebuild().await?;
        Ok(store)
    }

    fn limiter_set(&self, upstream: &Upstream) -> Arc<LimiterSet> {
        if let Some(set) = self.limiters.get(upstream.name()) {
            return Arc::clone(&set);
        }
        let config = self.config.load();
        Arc::clone(
            &self
                .limiters
                .entry(upstream.name_arc())
                .or_insert_with(|| Arc::new(LimiterSet::seeded(&config.hosts))),
        )
    }

    fn choose_top_score(
        alive: &[Arc<Upstream>],
        last_failed: Option<&str>,
    ) -> Arc<Upstream> {
        let mut scored: Vec<(f64, &Arc<Upstream>)> =
            alive.iter().map(|u| (u.score(), u)).collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let window: Vec<&Arc<Upstream>> =
            scored.into_iter().take(SELECTION_WINDOW).map(|(_, u)| u).collect();

        if window.len() == 1 {
            return Arc::clone(window[0]);
        }

        let candidates: Vec<&&Arc<Upstream>> = window
            .iter()
            .filter(|u| last_failed != Some(u.name()))
            .collect();
        if candidates.is_empty() {
            return Arc::clone(window[0]);
        }

        let idx = rand::thread_rng().gen_range(0..candidates.len());
        Arc::clone(candidates[idx])
    }

    fn choose_least_connections(alive: &[Arc<Upstream>]) -> Arc<Upstream> {
        let min = alive.iter().map(|u| u.connections()).min().unwrap_or(0);
        let tied: Vec<&Arc<Upstream>> =
            alive.iter().filter(|u| u.connections() == min).collect();
        let idx = rand::thread_rng().gen_range(0..tied.len());
        Arc::clone(tied[idx])
    }

    async fn emit_pool_size(&self) {
        let count = self.pools.read().await.alive.len();
        self.metrics.emit(MetricPoint::AddProxy { new_count: count });
    }
}

#[async_trait]
impl ProxyStore for MemoryStore {
    async fn choose(&self, last_failed: Option<&str>) -> Result<Arc<Upstream>, StoreError> {
        let pools = self.pools.read().await;
        if pools.alive.is_empty() {
            return Err(StoreError::NoProxiesAvailable);
        }

        Ok(match self.strategy {
            SelectionStrategy::TopScore => Self::choose_top_score(&pools.alive, last_failed),
            SelectionStrategy::LeastConnections => {
                Self::choose_least_connections(&pools.alive)
            }
        })
    }

    async fn connection_opened(&self, upstream: &Upstream) {
        upstream.connection_opened();
    }

    fn connection_closed(&self, upstream: &Upstream) {
        upstream.connection_closed();
    }

    async fn record_attempt(&self, upstream: &Arc<Upstream>, record: &AttemptRecord) {
        if record.success {
            upstream.record_success(record.elapsed_seconds);
            if upstream.kill_on_error() {
                // A revived upstream proved itself.
                upstream.clear_revived();
            }
            return;
        }

        upstream.record_failure(record.elapsed_seconds);

        let kill = if upstream.kill_on_error() {
            true
        } else if record.blame {
            let good = upstream.good();
            let bad = upstream.bad();
            #[allow(clippy::cast_precision_loss)]
            let ratio = bad as f64 / good as f64;
            bad >= 5 && ratio > self.config.load().max_error
        } else {
            false
        };

        if kill {
            warn!(
                upstream = %upstream.name(),
                good = upstream.good(),
                bad = upstream.bad(),
                "kill condition met"
            );
            self.mark_dead(upstream.name()).await;
        }
    }

    async fn mark_dead(&self, name: &str) {
        {
            let mut pools = self.pools.write().await;
            let Some(idx) = pools.alive.iter().position(|u| u.name() == name) else {
                return;
            };
            let upstream = pools.alive.remove(idx);
            trace!(proxy = name, "dead");
            pools.dead.push(upstream);
        }
        self.emit_pool_size().await;
    }

    async fn mark_alive(&self, name: &str) {
        {
            let mut pools = self.pools.write().await;
            let Some(idx) = pools.dead.iter().position(|u| u.name() == name) else {
                return;
            };
            let upstream = pools.dead.remove(idx);
            upstream.reset_counters();
            upstream.mark_revived();
            trace!(proxy = name, "revive");
            pools.alive.push(upstream);
        }
        self.emit_pool_size().await;
    }

    async fn add(&self, name: &str, url: &str) -> Result<bool, StoreError> {
        let timeout = self.config.load().timeout;
        {
            let mut pools = self.pools.write().await;
            let exists = pools
                .alive
                .iter()
                .chain(pools.dead.iter())
                .any(|u| u.name() == name);
            if exists {
                return Ok(false);
            }

            let upstream = Arc::new(Upstream::new(name, url, timeout)?);
            self.limiters
                .insert(upstream.name_arc(), Arc::new(LimiterSet::seeded(&self.config.load().hosts)));
            info!(name, url, "add proxy");
            pools.alive.push(upstream);
        }
        self.emit_pool_size().await;
        Ok(true)
    }

    async fn alive(&self) -> Vec<Arc<Upstream>> {
        self.pools.read().await.alive.clone()
    }

    async fn dead(&self) -> Vec<Arc<Upstream>> {
        self.pools.read().await.dead.clone()
    }

    async fn reserve(
        &self,
        upstream: &Upstream,
        host: &str,
        _effective: &HostEntry,
    ) -> Result<Duration, StoreError> {
        // The per-upstream limiter list already encodes entry precedence;
        // misses fall back to the default (`*`) entry's limits.
        let default = Arc::clone(&self.config.load().default_host);
        Ok(self.limiter_set(upstream).reserve(host, &default))
    }

    async fn adjust_limit(
        &self,
        upstream: &Upstream,
        host: &str,
        _effective: &HostEntry,
        change: LimitChange,
    ) {
        let default = Arc::clone(&self.config.load().default_host);
        self.limiter_set(upstream).adjust(host, &default, change);
    }

    async fn gc_limiters(&self) -> usize {
        self.limiters.iter().map(|set| set.sweep(LIMITER_TTL)).sum()
    }

    async fn rebuild(&self) -> Result<(), StoreError> {
        let config = self.config.load_full();

        let mut alive = Vec::with_capacity(config.proxies.len());
        for seed in &config.proxies {
            let upstream = Arc::new(Upstream::new(&seed.name, &seed.url, config.timeout)?);
            info!(name = %seed.name, url = %seed.url, "proxy");
            alive.push(upstream);
        }

        let mut pools = self.pools.write().await;
        self.limiters.clear();
        for upstream in &alive {
            self.limiters
                .insert(upstream.name_arc(), Arc::new(LimiterSet::seeded(&config.hosts)));
        }
        pools.alive = alive;
        pools.dead.clear();
        Ok(())
    }
}
