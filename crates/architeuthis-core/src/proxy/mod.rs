//! Request pipeline: classification, retry policy, and the per-request
//! orchestrator.
//!
//! # Attempt decision order
//!
//! ```text
//! attempt result
//!   ├─ 2xx ──────────────────────────► return response
//!   ├─ proxy-link error ─────────────► kill upstream, switch, loop
//!   │                                  (no retry budget consumed)
//!   ├─ permanent transport error ────► surface to caller
//!   ├─ force_retry rule ─────────────► backoff, loop (hard cap)
//!   ├─ dont_retry rule ──────────────► "Applied dont_retry rule"
//!   ├─ transient error / retryable ──► backoff, loop (normal budget)
//!   │  status / should_retry rule
//!   └─ otherwise ────────────────────► "HTTP error: <code>"
//! ```

pub mod classify;
pub mod errors;
pub mod pipeline;

pub use self::classify::ErrorClass;
pub use self::errors::PipelineError;
pub use self::pipeline::RequestPipeline;
