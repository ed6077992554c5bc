//! Integration and end-to-end tests for Architeuthis.
//!
//! Test modules:
//!
//! - `pipeline_tests`: end-to-end request scenarios (happy path, retry on
//!   5xx, `dont_retry`, proxy failover, body re-exposure, header policy).
//! - `rate_limit_tests`: pacing and rule-driven limit mutation under the
//!   real clock.
//! - `selection_tests`: score-window behavior over larger pools.
//! - `support`: scripted local origins and pipeline builders.
//!
//! Everything runs against loopback servers; no external network access is
//! required. Redis-backed store tests are exercised against a live `redis`
//! instance in deployment environments and are intentionally absent here.

pub mod support;

#[cfg(test)]
mod pipeline_tests;

#[cfg(test)]
mod rate_limit_tests;

#[cfg(test)]
mod selection_tests;
