//! Errors the pipeline surfaces to the caller.
//!
//! The listener renders these as a `500 text/plain` body, so every message
//! here is client-visible.

use thiserror::Error;

use crate::upstream::StoreError;

/// Terminal outcomes of the request pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The alive pool is empty.
    #[error("no proxies available")]
    NoProxiesAvailable,

    /// Retry budget exhausted.
    #[error("giving up after {0} retries")]
    GivingUp(u32),

    /// A `dont_retry` rule terminated the attempt.
    #[error("Applied dont_retry rule")]
    DontRetry,

    /// Non-retryable status from the origin.
    #[error("HTTP error: {0}")]
    HttpError(u16),

    /// Permanent transport failure, passed through with its message.
    #[error("{0}")]
    Transport(String),

    /// The intercepted request cannot enter the pipeline at all.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<StoreError> for PipelineError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NoProxiesAvailable => Self::NoProxiesAvailable,
            other => Self::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_match_the_wire_contract() {
        assert_eq!(PipelineError::NoProxiesAvailable.to_string(), "no proxies available");
        assert_eq!(PipelineError::GivingUp(3).to_string(), "giving up after 3 retries");
        assert_eq!(PipelineError::DontRetry.to_string(), "Applied dont_retry rule");
        assert_eq!(PipelineError::HttpError(404).to_string(), "HTTP error: 404");
    }

    #[test]
    fn empty_pool_store_error_maps_through() {
        let err: PipelineError = StoreError::NoProxiesAvailable.into();
        assert!(matches!(err, PipelineError::NoProxiesAvailable));
    }
}
