//! Application configuration.
//!
//! The config file is JSON (see the repository's `config.example.json`).
//! Durations are humantime strings (`"500ms"`, `"10s"`). Loading compiles
//! host rules into their evaluated form and resolves rate-limit inheritance,
//! so the rest of the system only ever sees a validated [`Config`].
//!
//! Reload swaps an immutable snapshot: the live handle is a
//! [`SharedConfig`] (`Arc<ArcSwap<Config>>`) and readers load it once per
//! request, so a reload never tears an in-flight request's view.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::policy::glob;
use crate::policy::rules::{Rule, RuleError};

/// Default liveness probe target, reachable through any general-purpose
/// forwarder.
pub const DEFAULT_PROBE_URL: &str = "https://google.com/";

/// Default bound on concurrent liveness probes.
pub const DEFAULT_PROBE_WORKERS: usize = 50;

/// Shared, atomically swappable configuration handle.
pub type SharedConfig = Arc<ArcSwap<Config>>;

/// Errors surfaced while loading or validating configuration.
///
/// All of these are fatal at load time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("host {host:?}: {source}")]
    Rule {
        host: String,
        #[source]
        source: RuleError,
    },

    #[error("{0}")]
    Validation(String),
}

/// One raw rule as it appears in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct RawRule {
    pub condition: String,
    pub action: String,
    #[serde(default)]
    pub arg: String,
}

/// One host entry as it appears in the config file.
#[derive(Debug, Clone, Deserialize)]
struct RawHostEntry {
    host: String,
    #[serde(default, with = "humantime_serde::option")]
    every: Option<Duration>,
    #[serde(default)]
    burst: u32,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    rules: Vec<RawRule>,
}

/// A named upstream forwarder from the `proxies` array.
///
/// An empty `url` means direct egress (no upstream proxy).
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySeed {
    pub name: String,
    #[serde(default)]
    pub url: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: `"json"` or `"pretty"`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format() }
    }
}

/// The raw file shape.
#[derive(Debug, Deserialize)]
struct RawConfig {
    addr: String,
    #[serde(with = "humantime_serde")]
    timeout: Duration,
    #[serde(with = "humantime_serde")]
    wait: Duration,
    multiplier: f64,
    retries: u32,
    #[serde(default)]
    retries_hard: Option<u32>,
    #[serde(default = "default_max_error")]
    max_error: f64,
    #[serde(default)]
    redis_url: Option<String>,
    #[serde(default = "default_probe_url")]
    probe_url: String,
    #[serde(default = "default_probe_workers")]
    probe_workers: usize,
    #[serde(default)]
    logging: LoggingConfig,
    hosts: Vec<RawHostEntry>,
    #[serde(default)]
    proxies: Vec<ProxySeed>,
}

fn default_max_error() -> f64 {
    1.0
}

fn default_probe_url() -> String {
    DEFAULT_PROBE_URL.to_string()
}

fn default_probe_workers() -> usize {
    DEFAULT_PROBE_WORKERS
}

/// A compiled host entry: limits resolved, rules compiled.
#[derive(Debug)]
pub struct HostEntry {
    /// The host pattern; `*` is the mandatory catch-all.
    pub host: String,
    /// Whether `host` contains an unescaped wildcard.
    pub is_glob: bool,
    /// Minimum interval between reservations.
    pub every: Duration,
    /// Token bucket capacity; always ≥ 1 after load.
    pub burst: u32,
    /// Headers injected into matching requests, later entries win.
    pub headers: HashMap<String, String>,
    /// Rules in declaration order.
    pub rules: Vec<Rule>,
}

impl HostEntry {
    /// Returns `true` if any of this entry's rules reads the response body.
    #[must_use]
    pub fn reads_body(&self) -> bool {
        use crate::policy::rules::Operand;
        self.rules.iter().any(|r| r.condition.operand == Operand::Body)
    }
}

/// Validated, compiled configuration.
#[derive(Debug)]
pub struct Config {
    pub addr: String,
    pub timeout: Duration,
    /// Base backoff wait.
    pub wait: Duration,
    /// Backoff multiplier per retry.
    pub multiplier: f64,
    /// Normal retry budget.
    pub retries: u32,
    /// Absolute retry cap, reachable only through `force_retry` rules.
    pub retries_hard: u32,
    /// Kill threshold on `bad / good`.
    pub max_error: f64,
    /// When set, upstream state and limiters live in Redis.
    pub redis_url: Option<String>,
    pub probe_url: String,
    pub probe_workers: usize,
    pub logging: LoggingConfig,
    /// Host entries in declaration order.
    pub hosts: Vec<Arc<HostEntry>>,
    /// The mandatory `*` entry.
    pub default_host: Arc<HostEntry>,
    pub proxies: Vec<ProxySeed>,
}

impl Config {
    /// Loads and compiles configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed, a rule
    /// fails to compile, no `*` host entry exists, a host entry sets
    /// `Accept-Encoding`, or an entry's burst is still zero after
    /// inheritance.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_slice(&std::fs::read(path)?)?;
        Self::compile(raw)
    }

    /// Loads and compiles configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Config::from_file`], minus I/O.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(json)?;
        Self::compile(raw)
    }

    fn compile(raw: RawConfig) -> Result<Self, ConfigError> {
        let mut hosts: Vec<Arc<HostEntry>> = Vec::with_capacity(raw.hosts.len());

        for entry in &raw.hosts {
            for name in entry.headers.keys() {
                if name.eq_ignore_ascii_case("accept-encoding") {
                    return Err(ConfigError::Validation(format!(
                        "headers config for {:?}: do not set the Accept-Encoding header, \
                         it breaks content negotiation through the interceptor",
                        entry.host
                    )));
                }
            }

            // A missing `every` or zero burst inherits the resolved value
            // of the nearest earlier entry whose glob matches this entry's
            // host.
            let mut every = entry.every;
            if every.is_none() {
                for prev in &hosts {
                    if glob::glob_match(&prev.host, &entry.host) {
                        every = Some(prev.every);
                    }
                }
            }

            let mut burst = entry.burst;
            if burst == 0 {
                for prev in &hosts {
                    if glob::glob_match(&prev.host, &entry.host) {
                        burst = prev.burst;
                    }
                }
            }
            if burst == 0 {
                return Err(ConfigError::Validation(format!(
                    "burst must be > 0 (host: {})",
                    entry.host
                )));
            }

            let mut rules = Vec::with_capacity(entry.rules.len());
            for raw_rule in &entry.rules {
                let rule = Rule::parse(&raw_rule.condition, &raw_rule.action, &raw_rule.arg)
                    .map_err(|source| ConfigError::Rule { host: entry.host.clone(), source })?;
                info!(
                    host = %entry.host,
                    condition = %rule.condition,
                    action = %rule.action,
                    "rule"
                );
                rules.push(rule);
            }

            let compiled = Arc::new(HostEntry {
                host: entry.host.clone(),
                is_glob: glob::is_glob(&entry.host),
                every: every.unwrap_or(Duration::ZERO),
                burst,
                headers: entry.headers.clone(),
                rules,
            });

            info!(
                host = %compiled.host,
                every = %humantime::format_duration(compiled.every),
                burst = compiled.burst,
                "host"
            );
            hosts.push(compiled);
        }

        let default_host = hosts
            .iter()
            .find(|h| h.host == "*")
            .cloned()
            .ok_or_else(|| {
                ConfigError::Validation("you must specify a default host ('*')".to_string())
            })?;

        Ok(Self {
            addr: raw.addr,
            timeout: raw.timeout,
            wait: raw.wait,
            multiplier: raw.multiplier,
            retries: raw.retries,
            retries_hard: raw.retries_hard.unwrap_or(raw.retries.saturating_mul(2)),
            max_error: raw.max_error,
            redis_url: raw.redis_url,
            probe_url: raw.probe_url,
            probe_workers: raw.probe_workers,
            logging: raw.logging,
            hosts,
            default_host,
            proxies: raw.proxies,
        })
    }

    /// Wraps the config into a swappable shared handle.
    #[must_use]
    pub fn into_shared(self) -> SharedConfig {
        Arc::new(ArcSwap::from_pointee(self))
    }
}
