//! Request and response types shared across the pipeline, policy engine,
//! and stores.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use url::Url;

use crate::config::HostEntry;

/// An intercepted client request, normalized for forwarding.
///
/// The body is buffered up front: retries must be able to replay it, and the
/// MITM collaborator hands the inner request over fully read anyway.
#[derive(Debug, Clone)]
pub struct ProxiedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxiedRequest {
    #[must_use]
    pub fn new(method: Method, url: Url, headers: HeaderMap, body: Bytes) -> Self {
        Self { method, url, headers, body }
    }
}

/// Options extracted from reserved `X-Architeuthis-*` request headers.
///
/// The headers are consumed: they are stripped before the request is
/// forwarded upstream.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    pub cloudflare_bypass: bool,
}

/// Status line and headers of one attempt's upstream response.
#[derive(Debug, Clone)]
pub struct AttemptResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Result of one attempt, as seen by the rule interpreter and the retry
/// decision logic.
#[derive(Debug)]
pub struct ResponseCtx {
    /// `None` when the attempt failed before a response arrived.
    pub response: Option<AttemptResponse>,
    /// Response body bytes, cached only when a matching rule reads `body`.
    /// The same bytes are later returned to the client, so rule evaluation
    /// never changes what the client observes.
    pub body: Option<Bytes>,
    /// Elapsed seconds for the attempt.
    pub response_time: f64,
    /// Transport error message, if the attempt failed.
    pub error: Option<String>,
}

/// Mutable per-request state threaded through the attempt loop.
#[derive(Debug)]
pub struct RequestCtx {
    pub request: ProxiedRequest,
    pub retries: u32,
    pub last_failed_proxy: Option<Arc<str>>,
    pub last_error_was_proxy_error: bool,
    pub started: Instant,
    pub options: RequestOptions,
    /// Host entries matching this request's normalized host, in declaration
    /// order.
    pub configs: Vec<Arc<HostEntry>>,
}

impl RequestCtx {
    #[must_use]
    pub fn new(request: ProxiedRequest, options: RequestOptions, configs: Vec<Arc<HostEntry>>) -> Self {
        Self {
            request,
            retries: 0,
            last_failed_proxy: None,
            last_error_was_proxy_error: false,
            started: Instant::now(),
            options,
            configs,
        }
    }
}

/// Body of a response handed back to the listener.
pub enum ProxyBody {
    /// Body was buffered (a rule read it, or the upstream response was
    /// already consumed); the exact bytes the upstream sent.
    Buffered(Bytes),
    /// Body is streamed through untouched.
    Streaming(reqwest::Response),
}

impl std::fmt::Debug for ProxyBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered(b) => f.debug_tuple("Buffered").field(&b.len()).finish(),
            Self::Streaming(_) => f.debug_tuple("Streaming").finish(),
        }
    }
}

/// The response delivered to the client on success.
#[derive(Debug)]
pub struct ProxiedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ProxyBody,
}
