//! A single upstream forwarder: its HTTP client and its counters.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use super::scoring;
use super::store::StoreError;
use crate::types::ProxiedRequest;

/// A named forwarder through which client requests are sent.
///
/// An upstream with no URL egresses directly. Counters are atomics so the
/// hot path never locks; the pool lock only guards membership and ordering.
pub struct Upstream {
    name: Arc<str>,
    url: Option<Url>,
    client: reqwest::Client,

    good: AtomicU64,
    bad: AtomicU64,
    /// Summed request time in microseconds.
    total_latency_us: AtomicU64,
    connections: AtomicI64,

    /// One-strike flag: the next failed attempt kills this upstream.
    /// Set when an upstream is revived; cleared once it proves itself.
    kill_on_error: AtomicBool,
    revived: AtomicBool,
}

impl Upstream {
    /// Creates an upstream with fresh counters.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the proxy URL does not parse or the HTTP
    /// client cannot be constructed.
    pub fn new(name: &str, url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let url = if url.is_empty() {
            None
        } else {
            Some(Url::parse(url).map_err(|source| StoreError::InvalidProxyUrl {
                name: name.to_string(),
                source,
            })?)
        };

        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout);
        if let Some(proxy_url) = &url {
            builder = builder.proxy(reqwest::Proxy::all(proxy_url.clone()).map_err(StoreError::Client)?);
        }
        let client = builder.build().map_err(StoreError::Client)?;

        Ok(Self {
            name: Arc::from(name),
            url,
            client,
            good: AtomicU64::new(0),
            bad: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            connections: AtomicI64::new(0),
            kill_on_error: AtomicBool::new(false),
            revived: AtomicBool::new(false),
        })
    }

    /// Creates an upstream with counters restored from the shared store.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Upstream::new`].
    #[allow(clippy::too_many_arguments)]
    pub fn hydrated(
        name: &str,
        url: &str,
        timeout: Duration,
        good: u64,
        bad: u64,
        total_latency_seconds: f64,
        connections: i64,
        revived: bool,
    ) -> Result<Self, StoreError> {
        let upstream = Self::new(name, url, timeout)?;
        upstream.good.store(good, Ordering::Relaxed);
        upstream.bad.store(bad, Ordering::Relaxed);
        upstream
            .total_latency_us
            .store(seconds_to_us(total_latency_seconds), Ordering::Relaxed);
        upstream.connections.store(connections, Ordering::Relaxed);
        upstream.revived.store(revived, Ordering::Relaxed);
        upstream.kill_on_error.store(revived, Ordering::Relaxed);
        Ok(upstream)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn name_arc(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    /// URL of the upstream proxy, or the empty string for direct egress.
    #[must_use]
    pub fn url_str(&self) -> &str {
        self.url.as_ref().map_or("", Url::as_str)
    }

    /// Returns `true` when requests go through an upstream proxy link.
    #[must_use]
    pub fn is_proxied(&self) -> bool {
        self.url.is_some()
    }

    /// Sends a prepared request through this upstream's client.
    pub async fn execute(&self, request: &ProxiedRequest) -> reqwest::Result<reqwest::Response> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }
        builder.send().await
    }

    /// Issues a liveness probe GET through this upstream.
    pub async fn probe(&self, url: &str) -> reqwest::Result<reqwest::Response> {
        self.client.get(url).send().await
    }

    pub fn record_success(&self, elapsed_seconds: f64) {
        self.good.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us.fetch_add(seconds_to_us(elapsed_seconds), Ordering::Relaxed);
    }

    pub fn record_failure(&self, elapsed_seconds: f64) {
        self.bad.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us.fetch_add(seconds_to_us(elapsed_seconds), Ordering::Relaxed);
    }

    pub fn connection_opened(&self) -> i64 {
        self.connections.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn connection_closed(&self) -> i64 {
        self.connections.fetch_sub(1, Ordering::Relaxed) - 1
    }

    pub fn set_connections(&self, value: i64) {
        self.connections.store(value, Ordering::Relaxed);
    }

    #[must_use]
    pub fn good(&self) -> u64 {
        self.good.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bad(&self) -> u64 {
        self.bad.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn connections(&self) -> i64 {
        self.connections.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn kill_on_error(&self) -> bool {
        self.kill_on_error.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn revived(&self) -> bool {
        self.revived.load(Ordering::Relaxed)
    }

    /// Marks this upstream one-strike: the next failed attempt kills it.
    pub fn mark_revived(&self) {
        self.revived.store(true, Ordering::Relaxed);
        self.kill_on_error.store(true, Ordering::Relaxed);
    }

    /// Clears the one-strike flag after a proven request.
    pub fn clear_revived(&self) {
        self.revived.store(false, Ordering::Relaxed);
        self.kill_on_error.store(false, Ordering::Relaxed);
    }

    /// Resets counters, as on revival.
    pub fn reset_counters(&self) {
        self.good.store(0, Ordering::Relaxed);
        self.bad.store(0, Ordering::Relaxed);
        self.total_latency_us.store(0, Ordering::Relaxed);
        self.connections.store(0, Ordering::Relaxed);
    }

    /// Total request time in seconds across all completed attempts.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn total_latency_seconds(&self) -> f64 {
        self.total_latency_us.load(Ordering::Relaxed) as f64 / 1e6
    }

    /// Average attempt latency in seconds; zero before any attempt completes.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn avg_latency(&self) -> f64 {
        let completed = self.good() + self.bad();
        if completed == 0 {
            return 0.0;
        }
        self.total_latency_seconds() / completed as f64
    }

    /// Current selection score.
    #[must_use]
    pub fn score(&self) -> f64 {
        scoring::score(self.good(), self.bad(), self.avg_latency(), self.connections())
    }

    /// Point-in-time counters for the stats dashboard.
    #[must_use]
    pub fn stats(&self) -> UpstreamStats {
        UpstreamStats {
            name: self.name.to_string(),
            url: self.url_str().to_string(),
            good: self.good(),
            bad: self.bad(),
            avg_latency: self.avg_latency(),
            connections: self.connections(),
            score: self.score(),
        }
    }
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("name", &self.name)
            .field("url", &self.url_str())
            .field("good", &self.good())
            .field("bad", &self.bad())
            .field("connections", &self.connections())
            .finish_non_exhaustive()
    }
}

/// Snapshot of one upstream's counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UpstreamStats {
    pub name: String,
    pub url: String,
    pub good: u64,
    pub bad: u64,
    pub avg_latency: f64,
    pub connections: i64,
    pub score: f64,
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn seconds_to_us(seconds: f64) -> u64 {
    (seconds.max(0.0) * 1e6) as u64
}
