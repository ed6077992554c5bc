//! Per-(host, upstream) token-bucket pacing.
//!
//! Buckets hand out reservations: a call to [`TokenBucket::reserve`] always
//! consumes a token and returns how long the caller must sleep before acting
//! on it. Tokens may go negative, so back-to-back callers queue up in
//! arrival order rather than being rejected.
//!
//! Each upstream carries an ordered list of [`ExpiringLimiter`] entries.
//! Entries seeded from configuration are permanent; entries created on the
//! fly for unmatched hosts expire after an hour of disuse and are swept by
//! the periodic GC.

mod gc;

pub use self::gc::LimiterGc;

use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::HostEntry;
use crate::policy::glob;

/// Interval between GC sweeps.
pub const GC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Idle time after which an eligible limiter is evicted.
pub const LIMITER_TTL: Duration = Duration::from_secs(60 * 60);

/// Rule-driven adjustment of a limiter's rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LimitChange {
    /// Replace the rate (tokens per second).
    Set(f64),
    /// Divide the rate by the factor (factor > 1 slows down).
    Multiply(f64),
}

/// A token bucket with reservation semantics.
///
/// Refills at `rate` tokens per second up to `burst`. A zero `every`
/// configuration yields an infinite rate, i.e. no pacing.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    burst: f64,
    /// Tokens per second.
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    #[must_use]
    pub fn new(every: Duration, burst: u32) -> Self {
        let rate = if every.is_zero() { f64::INFINITY } else { 1.0 / every.as_secs_f64() };
        Self { tokens: f64::from(burst), burst: f64::from(burst), rate, last_refill: Instant::now() }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }

    /// Consumes one token and returns how long the caller must wait before
    /// acting on the reservation. Zero when a token was available.
    pub fn reserve(&mut self, now: Instant) -> Duration {
        self.refill(now);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 || self.rate.is_infinite() {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }

    /// Applies a rate change, settling accumulated debt at the old rate
    /// first so already-issued reservations keep their pacing.
    pub fn apply(&mut self, change: LimitChange, now: Instant) {
        self.refill(now);
        match change {
            LimitChange::Set(rate) => self.rate = rate,
            LimitChange::Multiply(factor) => self.rate /= factor,
        }
    }

    /// Current rate in tokens per second.
    #[must_use]
    pub fn rate(&self) -> f64 {
        self.rate
    }
}

/// One host-pattern limiter in an upstream's ordered list.
#[derive(Debug)]
pub struct ExpiringLimiter {
    pub host_glob: String,
    pub is_glob: bool,
    /// Entries not seeded from configuration may be garbage collected.
    pub can_delete: bool,
    pub last_read: Instant,
    pub bucket: TokenBucket,
}

impl ExpiringLimiter {
    fn matches(&self, host: &str) -> bool {
        if self.is_glob {
            glob::glob_match(&self.host_glob, host)
        } else {
            self.host_glob == host
        }
    }
}

/// The ordered limiter list of one upstream.
///
/// Insertion order is match precedence: lookups walk the list front to back
/// and the first matching entry wins. Misses create a new entry at the
/// front, so an exact host always shadows the broader seeded globs.
#[derive(Debug, Default)]
pub struct LimiterSet {
    entries: Mutex<Vec<ExpiringLimiter>>,
}

impl LimiterSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds one permanent entry per host entry, in reverse declaration
    /// order so that earlier (broader) configuration entries end up later
    /// in the list and more specific ones win the prefix walk.
    #[must_use]
    pub fn seeded(hosts: &[Arc<HostEntry>]) -> Self {
        let now = Instant::now();
        let entries = hosts
            .iter()
            .rev()
            .map(|entry| ExpiringLimiter {
                host_glob: entry.host.clone(),
                is_glob: entry.is_glob,
                can_delete: false,
                last_read: now,
                bucket: TokenBucket::new(entry.every, entry.burst),
            })
            .collect();
        Self { entries: Mutex::new(entries) }
    }

    fn with_entry<T>(
        &self,
        host: &str,
        default: &HostEntry,
        f: impl FnOnce(&mut ExpiringLimiter, Instant) -> T,
    ) -> T {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("limiter lock poisoned");

        if let Some(entry) = entries.iter_mut().find(|e| e.matches(host)) {
            entry.last_read = now;
            return f(entry, now);
        }

        entries.insert(
            0,
            ExpiringLimiter {
                host_glob: host.to_string(),
                is_glob: false,
                can_delete: true,
                last_read: now,
                bucket: TokenBucket::new(default.every, default.burst),
            },
        );
        f(&mut entries[0], now)
    }

    /// Reserves a token for `host`, creating a default-shaped entry on miss.
    pub fn reserve(&self, host: &str, default: &HostEntry) -> Duration {
        self.with_entry(host, default, |entry, now| entry.bucket.reserve(now))
    }

    /// Applies a rule-driven rate change to the limiter matching `host`.
    pub fn adjust(&self, host: &str, default: &HostEntry, change: LimitChange) {
        self.with_entry(host, default, |entry, now| entry.bucket.apply(change, now));
    }

    /// Evicts deletable entries idle for longer than `ttl`; returns how many
    /// were removed.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("limiter lock poisoned");
        let before = entries.len();
        entries.retain(|e| !(e.can_delete && now.saturating_duration_since(e.last_read) > ttl));
        before - entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("limiter lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
