//! # Architeuthis Core
//!
//! Core library for the Architeuthis intercepting forward proxy: it
//! multiplexes client requests across a pool of named upstream proxies,
//! enforces per-host rate limits, applies host-scoped rewrite and retry
//! policies, and tracks per-upstream quality scores so the best forwarder
//! serves each request.
//!
//! - **[`config`]**: JSON configuration with compiled host rules and
//!   atomically swappable snapshots for `/reload`.
//!
//! - **[`policy`]**: host matching, the condition/action rule DSL, and
//!   per-attempt rule aggregation.
//!
//! - **[`limiter`]**: reservation token buckets per `(host, upstream)` with
//!   rule-driven rate mutation and periodic eviction.
//!
//! - **[`upstream`]**: the registry of named forwarders with quality
//!   scoring, alive/dead lifecycle, a liveness prober, and in-process or
//!   Redis-shared storage.
//!
//! - **[`proxy`]**: transport error classification, retry budgets with
//!   escalating backoff, and the per-request pipeline.
//!
//! - **[`metrics`]**: buffered metric points flushed in batches to a
//!   pluggable timeseries sink.
//!
//! ## Request flow
//!
//! ```text
//! intercepted request
//!       │
//!       ▼
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │ host policy  │───►│   registry   │───►│   limiter    │
//! │ (match+opts) │    │  (choose)    │    │  (reserve)   │
//! └──────────────┘    └──────────────┘    └──────┬───────┘
//!                                                │ sleep
//!                                                ▼
//!                     ┌──────────────┐    ┌──────────────┐
//!                     │ rule engine  │◄───│ upstream HTTP│
//!                     │(compute_rules)    │    send      │
//!                     └──────┬───────┘    └──────────────┘
//!                            │
//!                            ▼
//!                     counters + score ──► retry or return
//! ```

pub mod config;
pub mod limiter;
pub mod metrics;
pub mod policy;
pub mod proxy;
pub mod types;
pub mod upstream;

pub use config::{Config, ConfigError, SharedConfig};
pub use proxy::{PipelineError, RequestPipeline};
pub use types::{ProxiedRequest, ProxiedResponse, ProxyBody};
