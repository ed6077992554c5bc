//! The storage seam for upstream state and limiters.
//!
//! The pipeline only talks to [`ProxyStore`]; whether upstream counters and
//! rate limits live in this process ([`super::MemoryStore`]) or in a shared
//! Redis instance ([`super::RedisStore`]) is a deployment choice made from
//! `redis_url` in the configuration.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::endpoint::Upstream;
use crate::config::HostEntry;
use crate::limiter::LimitChange;

/// Errors surfaced by a store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The alive pool is empty.
    #[error("no proxies available")]
    NoProxiesAvailable,

    #[error("invalid url for proxy {name:?}: {source}")]
    InvalidProxyUrl {
        name: String,
        #[source]
        source: url::ParseError,
    },

    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// What one attempt did to an upstream's counters.
#[derive(Debug, Clone, Copy)]
pub struct AttemptRecord {
    /// The attempt produced a 2xx response.
    pub success: bool,
    /// The failure is attributable to the upstream (per the HTTP-code and
    /// transport-error blame tables); gates the error-ratio kill.
    pub blame: bool,
    pub elapsed_seconds: f64,
}

/// Shared upstream registry and limiter state.
#[async_trait]
pub trait ProxyStore: Send + Sync {
    /// Selects an upstream for the next attempt, preferring one that is not
    /// `last_failed`.
    ///
    /// # Errors
    ///
    /// [`StoreError::NoProxiesAvailable`] when the alive pool is empty, or a
    /// backend error.
    async fn choose(&self, last_failed: Option<&str>) -> Result<Arc<Upstream>, StoreError>;

    /// Accounts a dispatched in-flight request on the upstream.
    async fn connection_opened(&self, upstream: &Upstream);

    /// Accounts request completion. Synchronous so a drop guard can call it
    /// on every exit path, including unwinds.
    fn connection_closed(&self, upstream: &Upstream);

    /// Applies one attempt's result to the upstream's counters and score,
    /// and kills the upstream when the attempt tripped a kill condition.
    async fn record_attempt(&self, upstream: &Arc<Upstream>, record: &AttemptRecord);

    /// Moves an upstream from the alive pool to the dead pool.
    async fn mark_dead(&self, name: &str);

    /// Moves an upstream back to the alive pool, resetting its counters and
    /// flagging it one-strike.
    async fn mark_alive(&self, name: &str);

    /// Registers a new upstream with an unproven score. Returns `false`
    /// without touching anything when the name already exists.
    ///
    /// # Errors
    ///
    /// Invalid URL or backend errors.
    async fn add(&self, name: &str, url: &str) -> Result<bool, StoreError>;

    async fn alive(&self) -> Vec<Arc<Upstream>>;

    async fn dead(&self) -> Vec<Arc<Upstream>>;

    /// Reserves a rate-limit token for `(host, upstream)` and returns how
    /// long the caller must sleep before sending.
    ///
    /// # Errors
    ///
    /// Backend errors in shared mode; the in-process limiter is infallible.
    async fn reserve(
        &self,
        upstream: &Upstream,
        host: &str,
        effective: &HostEntry,
    ) -> Result<Duration, StoreError>;

    /// Applies a rule-driven rate change to the `(host, upstream)` limiter.
    async fn adjust_limit(
        &self,
        upstream: &Upstream,
        host: &str,
        effective: &HostEntry,
        change: LimitChange,
    );

    /// Evicts expired limiters; returns how many were removed.
    async fn gc_limiters(&self) -> usize;

    /// Rebuilds upstreams and seeded limiters from the current config
    /// snapshot. Called at startup and on `/reload`.
    ///
    /// # Errors
    ///
    /// Invalid proxy URLs or backend errors.
    async fn rebuild(&self) -> Result<(), StoreError>;
}

/// Decrements an upstream's in-flight counter when dropped, unless the
/// attempt already accounted for it. Guards the `connections ≥ 0` balance on
/// every exit path.
pub struct ConnGuard<'a> {
    store: &'a dyn ProxyStore,
    upstream: Arc<Upstream>,
}

impl<'a> ConnGuard<'a> {
    #[must_use]
    pub fn new(store: &'a dyn ProxyStore, upstream: Arc<Upstream>) -> Self {
        Self { store, upstream }
    }
}

impl Drop for ConnGuard<'_> {
    fn drop(&mut self) {
        self.store.connection_closed(&self.upstream);
    }
}
