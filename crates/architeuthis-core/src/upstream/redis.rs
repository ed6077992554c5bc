//! Redis-backed upstream store for multi-process deployments.
//!
//! Layout matches the shared-store contract: sorted set `proxies` keyed by
//! score, set `deadProxies`, and one `proxy:<name>` hash per upstream with
//! fields `url`, `conn`, `reqtime`, `good`, `bad`, `revived`. Counter
//! updates, pool transitions, and score maintenance are pipelined
//! transactions so concurrent processes never observe a half-applied
//! update.
//!
//! Rate limits collapse to fixed windows: `rl:<host>:<upstream>` counts
//! reservations inside the current window and the returned wait is the
//! window's remaining TTL once the burst is spent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{error, info, trace, warn};

use super::endpoint::Upstream;
use super::scoring::{SELECTION_WINDOW, UNPROVEN_SCORE};
use super::store::{AttemptRecord, ProxyStore, StoreError};
use crate::config::{HostEntry, SharedConfig};
use crate::limiter::LimitChange;
use crate::metrics::{MetricPoint, MetricsEmitter};

const KEY_PROXIES: &str = "proxies";
const KEY_DEAD_PROXIES: &str = "deadProxies";
const PREFIX_PROXY: &str = "proxy:";
const PREFIX_LIMIT_COUNT: &str = "rl:";
const PREFIX_LIMIT_OVERRIDE: &str = "rlcfg:";

const FIELD_URL: &str = "url";
const FIELD_CONNECTIONS: &str = "conn";
const FIELD_REQUEST_TIME: &str = "reqtime";
const FIELD_GOOD: &str = "good";
const FIELD_BAD: &str = "bad";
const FIELD_REVIVED: &str = "revived";

fn proxy_key(name: &str) -> String {
    format!("{PREFIX_PROXY}{name}")
}

fn window_key(host: &str, upstream: &str) -> String {
    format!("{PREFIX_LIMIT_COUNT}{host}:{upstream}")
}

fn override_key(host: &str, upstream: &str) -> String {
    format!("{PREFIX_LIMIT_OVERRIDE}{host}:{upstream}")
}

/// Upstream registry and limiters shared through Redis.
pub struct RedisStore {
    config: SharedConfig,
    metrics: Arc<MetricsEmitter>,
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connects to Redis and registers the configured proxies.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on connection failure or invalid proxy URLs.
    pub async fn connect(
        url: &str,
        config: SharedConfig,
        metrics: Arc<MetricsEmitter>,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        let store = Self { config, metrics, conn };
        store.rebuild().await?;
        Ok(store)
    }

    /// Loads one upstream from its hash.
    async fn fetch(&self, name: &str) -> Result<Arc<Upstream>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: std::collections::HashMap<String, String> =
            conn.hgetall(proxy_key(name)).await?;

        let url = fields.get(FIELD_URL).map(String::as_str).unwrap_or("");
        let good = fields.get(FIELD_GOOD).and_then(|v| v.parse().ok()).unwrap_or(0);
        let bad = fields.get(FIELD_BAD).and_then(|v| v.parse().ok()).unwrap_or(0);
        let reqtime = fields.get(FIELD_REQUEST_TIME).and_then(|v| v.parse().ok()).unwrap_or(0.0);
        let connections =
            fields.get(FIELD_CONNECTIONS).and_then(|v| v.parse().ok()).unwrap_or(0);
        let revived = fields.get(FIELD_REVIVED).map(String::as_str) == Some("1");

        let timeout = self.config.load().timeout;
        Ok(Arc::new(Upstream::hydrated(
            name,
            url,
            timeout,
            good,
            bad,
            reqtime,
            connections,
            revived,
        )?))
    }

    async fn fetch_all(&self, names: Vec<String>) -> Vec<Arc<Upstream>> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            match self.fetch(&name).await {
                Ok(upstream) => out.push(upstream),
                Err(e) => warn!(proxy = %name, error = %e, "failed to load proxy"),
            }
        }
        out
    }

    async fn emit_pool_size(&self) {
        let mut conn = self.conn.clone();
        match conn.zcard::<_, usize>(KEY_PROXIES).await {
            Ok(count) => self.metrics.emit(MetricPoint::AddProxy { new_count: count }),
            Err(e) => warn!(error = %e, "zcard failed"),
        }
    }

    /// Effective window period, preferring a rule-driven override.
    async fn window_period(&self, host: &str, upstream: &str, fallback: Duration) -> Duration {
        let mut conn = self.conn.clone();
        let stored: Option<u64> = conn.get(override_key(host, upstream)).await.unwrap_or(None);
        stored.map_or(fallback, Duration::from_micros)
    }
}

#[async_trait]
impl ProxyStore for RedisStore {
    async fn choose(&self, last_failed: Option<&str>) -> Result<Arc<Upstream>, StoreError> {
        let mut conn = self.conn.clone();
        let window_end = isize::try_from(SELECTION_WINDOW).unwrap_or(13) - 1;
        let names: Vec<String> = conn.zrevrange(KEY_PROXIES, 0, window_end).await?;

        if names.is_empty() {
            return Err(StoreError::NoProxiesAvailable);
        }
        if names.len() == 1 {
            return self.fetch(&names[0]).await;
        }

        let candidates: Vec<&String> =
            names.iter().filter(|n| last_failed != Some(n.as_str())).collect();
        let pool = if candidates.is_empty() { names.iter().collect() } else { candidates };
        let picked = pool[rand::thread_rng().gen_range(0..pool.len())];
        self.fetch(picked).await
    }

    async fn connection_opened(&self, upstream: &Upstream) {
        let mut conn = self.conn.clone();
        match conn
            .hincr::<_, _, _, i64>(proxy_key(upstream.name()), FIELD_CONNECTIONS, 1)
            .await
        {
            Ok(count) => upstream.set_connections(count),
            Err(e) => error!(proxy = %upstream.name(), error = %e, "conn incr failed"),
        }
    }

    fn connection_closed(&self, upstream: &Upstream) {
        upstream.connection_closed();
        let mut conn = self.conn.clone();
        let key = proxy_key(upstream.name());
        tokio::spawn(async move {
            if let Err(e) = conn.hincr::<_, _, _, i64>(&key, FIELD_CONNECTIONS, -1).await {
                error!(error = %e, "conn decr failed");
            }
        });
    }

    async fn record_attempt(&self, upstream: &Arc<Upstream>, record: &AttemptRecord) {
        let key = proxy_key(upstream.name());

        // Mirror locally first so the score in the ZADD reflects the attempt.
        if record.success {
            upstream.record_success(record.elapsed_seconds);
        } else {
            upstream.record_failure(record.elapsed_seconds);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        if record.success {
            pipe.hincr(&key, FIELD_GOOD, 1).ignore();
            if upstream.kill_on_error() {
                // A revived upstream proved itself.
                upstream.clear_revived();
                pipe.hset(&key, FIELD_REVIVED, 0).ignore();
            }
        } else {
            pipe.hincr(&key, FIELD_BAD, 1).ignore();
        }
        pipe.cmd("HINCRBYFLOAT")
            .arg(&key)
            .arg(FIELD_REQUEST_TIME)
            .arg(record.elapsed_seconds)
            .ignore();
        pipe.cmd("ZADD")
            .arg(KEY_PROXIES)
            .arg("XX")
            .arg(upstream.score())
            .arg(upstream.name())
            .ignore();

        let mut conn = self.conn.clone();
        if let Err(e) = pipe.query_async::<_, ()>(&mut conn).await {
            error!(proxy = %upstream.name(), error = %e, "proxy update failed");
        }

        if !record.success {
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
                    proxy = %upstream.name(),
                    good = upstream.good(),
                    bad = upstream.bad(),
                    "kill condition met"
                );
                self.mark_dead(upstream.name()).await;
            }
        }
    }

    async fn mark_dead(&self, name: &str) {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.zrem(KEY_PROXIES, name).ignore();
        pipe.sadd(KEY_DEAD_PROXIES, name).ignore();

        let mut conn = self.conn.clone();
        if let Err(e) = pipe.query_async::<_, ()>(&mut conn).await {
            error!(proxy = %name, error = %e, "mark dead failed");
            return;
        }
        trace!(proxy = %name, "dead");
        self.emit_pool_size().await;
    }

    async fn mark_alive(&self, name: &str) {
        let key = proxy_key(name);
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.srem(KEY_DEAD_PROXIES, name).ignore();
        pipe.hset_multiple(
            &key,
            &[
                (FIELD_REVIVED, "1"),
                (FIELD_REQUEST_TIME, "0"),
                (FIELD_GOOD, "0"),
                (FIELD_BAD, "0"),
                (FIELD_CONNECTIONS, "0"),
            ],
        )
        .ignore();
        pipe.cmd("ZADD").arg(KEY_PROXIES).arg(UNPROVEN_SCORE).arg(name).ignore();

        let mut conn = self.conn.clone();
        if let Err(e) = pipe.query_async::<_, ()>(&mut conn).await {
            error!(proxy = %name, error = %e, "mark alive failed");
            return;
        }
        trace!(proxy = %name, "revive");
        self.emit_pool_size().await;
    }

    async fn add(&self, name: &str, url: &str) -> Result<bool, StoreError> {
        if !url.is_empty() {
            url::Url::parse(url).map_err(|source| StoreError::InvalidProxyUrl {
                name: name.to_string(),
                source,
            })?;
        }

        let mut conn = self.conn.clone();

        // A dead proxy keeps its slot; re-adding it must not resurrect it
        // behind the prober's back.
        let is_dead: bool = conn.sismember(KEY_DEAD_PROXIES, name).await?;
        if is_dead {
            return Ok(false);
        }

        let added: i64 = redis::cmd("ZADD")
            .arg(KEY_PROXIES)
            .arg("NX")
            .arg(UNPROVEN_SCORE)
            .arg(name)
            .query_async(&mut conn)
            .await?;
        if added == 0 {
            return Ok(false);
        }

        let key = proxy_key(name);
        conn.hset_multiple::<_, _, _, ()>(
            &key,
            &[
                (FIELD_URL, url),
                (FIELD_REQUEST_TIME, "0"),
                (FIELD_GOOD, "0"),
                (FIELD_BAD, "0"),
                (FIELD_CONNECTIONS, "0"),
                (FIELD_REVIVED, "0"),
            ],
        )
        .await?;

        info!(name, url, "add proxy");
        self.emit_pool_size().await;
        Ok(true)
    }

    async fn alive(&self) -> Vec<Arc<Upstream>> {
        let mut conn = self.conn.clone();
        match conn.zrange::<_, Vec<String>>(KEY_PROXIES, 0, -1).await {
            Ok(names) => self.fetch_all(names).await,
            Err(e) => {
                error!(error = %e, "zrange failed");
                Vec::new()
            }
        }
    }

    async fn dead(&self) -> Vec<Arc<Upstream>> {
        let mut conn = self.conn.clone();
        match conn.smembers::<_, Vec<String>>(KEY_DEAD_PROXIES).await {
            Ok(names) => self.fetch_all(names).await,
            Err(e) => {
                error!(error = %e, "smembers failed");
                Vec::new()
            }
        }
    }

    async fn reserve(
        &self,
        upstream: &Upstream,
        _host: &str,
        effective: &HostEntry,
    ) -> Result<Duration, StoreError> {
        let counter = window_key(&effective.host, upstream.name());
        let period = self
            .window_period(&effective.host, upstream.name(), effective.every)
            .await;

        if period.is_zero() {
            return Ok(Duration::ZERO);
        }

        let mut conn = self.conn.clone();
        let count: i64 = conn.incr(&counter, 1).await?;
        if count == 1 {
            #[allow(clippy::cast_possible_truncation)]
            let period_ms = period.as_millis() as i64;
            conn.pexpire::<_, ()>(&counter, period_ms.max(1)).await?;
        }

        if count <= i64::from(effective.burst) {
            return Ok(Duration::ZERO);
        }

        let remaining_ms: i64 = conn.pttl(&counter).await?;
        Ok(Duration::from_millis(u64::try_from(remaining_ms.max(0)).unwrap_or(0)))
    }

    async fn adjust_limit(
        &self,
        upstream: &Upstream,
        _host: &str,
        effective: &HostEntry,
        change: LimitChange,
    ) {
        let current = self
            .window_period(&effective.host, upstream.name(), effective.every)
            .await;

        let new_period = match change {
            LimitChange::Set(rate) if rate > 0.0 => Duration::from_secs_f64(1.0 / rate),
            LimitChange::Set(_) => return,
            LimitChange::Multiply(factor) if factor > 0.0 => current.mul_f64(factor),
            LimitChange::Multiply(_) => return,
        };

        let mut conn = self.conn.clone();
        #[allow(clippy::cast_possible_truncation)]
        let micros = new_period.as_micros() as u64;
        if let Err(e) = conn
            .set::<_, _, ()>(override_key(&effective.host, upstream.name()), micros)
            .await
        {
            error!(proxy = %upstream.name(), error = %e, "limit override failed");
        }
    }

    async fn gc_limiters(&self) -> usize {
        // Fixed windows carry their own TTL; Redis evicts them itself.
        0
    }

    async fn rebuild(&self) -> Result<(), StoreError> {
        let config = self.config.load_full();
        for seed in &config.proxies {
            // No-op for proxies already registered; shared state survives
            // reloads.
            self.add(&seed.name, &seed.url).await?;
        }
        Ok(())
    }
}
