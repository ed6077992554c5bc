//! Host policy: request/host matching and per-attempt rule aggregation.
//!
//! Hosts are normalized (port stripped, leading dot added) before matching,
//! so `example.com` becomes `.example.com`, which glob-matches
//! `*.example.com` and the mandatory `*` catch-all.

pub mod glob;
pub mod rules;

use std::sync::Arc;

use http::header::{HeaderMap, CONNECTION};

use crate::config::{Config, HostEntry};
use crate::types::{RequestOptions, ResponseCtx};

use self::rules::Action;

/// Prefix of request headers consumed as proxy options and stripped before
/// forwarding.
pub const RESERVED_HEADER_PREFIX: &str = "x-architeuthis-";

/// Header enabling the Cloudflare bypass option for one request.
pub const CF_BYPASS_HEADER: &str = "x-architeuthis-cf-bypass";

/// Normalizes a request host for policy matching: strips a port suffix and
/// prefixes a leading dot.
#[must_use]
pub fn normalize_host(host: &str) -> String {
    let stripped = match host.rfind(':') {
        Some(idx) if idx > 0 => &host[..idx],
        _ => host,
    };
    format!(".{stripped}")
}

/// Returns every host entry matching the normalized host, in declaration
/// order. The last matching entry supplies the effective rate limit.
#[must_use]
pub fn matching_entries(config: &Config, normalized_host: &str) -> Vec<Arc<HostEntry>> {
    config
        .hosts
        .iter()
        .filter(|entry| glob::glob_match(&entry.host, normalized_host))
        .cloned()
        .collect()
}

/// Parses reserved `X-Architeuthis-*` headers into [`RequestOptions`] and
/// strips them all from the header map.
pub fn parse_options(headers: &mut HeaderMap) -> RequestOptions {
    let options = RequestOptions { cloudflare_bypass: headers.contains_key(CF_BYPASS_HEADER) };

    let reserved: Vec<_> = headers
        .keys()
        .filter(|name| name.as_str().starts_with(RESERVED_HEADER_PREFIX))
        .cloned()
        .collect();
    for name in reserved {
        headers.remove(name);
    }

    options
}

/// Strips the per-hop `Connection` header.
pub fn strip_hop_headers(headers: &mut HeaderMap) {
    headers.remove(CONNECTION);
}

/// Applies each matching entry's injected headers, in entry order; later
/// entries win on conflicts.
pub fn apply_headers(headers: &mut HeaderMap, configs: &[Arc<HostEntry>]) {
    for entry in configs {
        for (name, value) in &entry.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<http::header::HeaderName>(),
                value.parse::<http::header::HeaderValue>(),
            ) {
                headers.insert(name, value);
            }
        }
    }
}

/// Returns `true` if any rule of any matching entry reads the response body,
/// in which case the pipeline must buffer the body before rule evaluation.
#[must_use]
pub fn needs_body(configs: &[Arc<HostEntry>]) -> bool {
    configs.iter().any(|entry| entry.reads_body())
}

/// Aggregate of all matching rules for one attempt.
///
/// Flags are sticky: once any matching rule sets one, it stays set. The
/// limit adjustments keep the last matching rule's value.
#[derive(Debug, Clone, Copy)]
pub struct RuleOutcome {
    pub dont_retry: bool,
    pub force_retry: bool,
    pub should_retry: bool,
    /// `every` multiplier; 1.0 means unchanged.
    pub limit_multiplier: f64,
    /// Replacement rate in tokens per second, when a `set_every` rule matched.
    pub new_limit: Option<f64>,
}

impl Default for RuleOutcome {
    fn default() -> Self {
        Self {
            dont_retry: false,
            force_retry: false,
            should_retry: false,
            limit_multiplier: 1.0,
            new_limit: None,
        }
    }
}

/// Evaluates every rule of every matching entry, in declaration order, and
/// folds the actions of matching rules into a [`RuleOutcome`].
#[must_use]
pub fn compute_rules(configs: &[Arc<HostEntry>], response: &ResponseCtx) -> RuleOutcome {
    let mut outcome = RuleOutcome::default();

    for entry in configs {
        for rule in &entry.rules {
            if !rule.matches(response) {
                continue;
            }
            match rule.action {
                Action::DontRetry => outcome.dont_retry = true,
                Action::ForceRetry => outcome.force_retry = true,
                Action::ShouldRetry => outcome.should_retry = true,
                Action::MultiplyEvery(factor) => outcome.limit_multiplier = factor,
                Action::SetEvery(rate) => outcome.new_limit = Some(rate),
            }
        }
    }

    outcome
}
