//! The per-request orchestrator.
//!
//! One call to [`RequestPipeline::handle`] serves one intercepted client
//! request: resolve host policy, pick an upstream, pace against the
//! limiter, forward, evaluate rules, account the attempt, then return or
//! loop. Proxy-link failures switch upstreams without consuming retry
//! budget; transient failures back off geometrically until the budget runs
//! out.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{trace, warn};

use crate::config::SharedConfig;
use crate::limiter::LimitChange;
use crate::metrics::{MetricPoint, MetricsEmitter, SleepContext};
use crate::policy;
use crate::types::{
    AttemptResponse, ProxiedRequest, ProxiedResponse, ProxyBody, RequestCtx, ResponseCtx,
};
use crate::upstream::{AttemptRecord, ConnGuard, ProxyStore};

use super::classify::{self, ErrorClass};
use super::errors::PipelineError;

/// Orchestrates attempts for intercepted requests.
pub struct RequestPipeline {
    config: SharedConfig,
    store: Arc<dyn ProxyStore>,
    metrics: Arc<MetricsEmitter>,
}

impl RequestPipeline {
    #[must_use]
    pub fn new(
        config: SharedConfig,
        store: Arc<dyn ProxyStore>,
        metrics: Arc<MetricsEmitter>,
    ) -> Self {
        Self { config, store, metrics }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn ProxyStore> {
        &self.store
    }

    /// Serves one intercepted request to completion.
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineError`] whose message is rendered to the client
    /// as a `500 text/plain` body.
    pub async fn handle(
        &self,
        mut request: ProxiedRequest,
    ) -> Result<ProxiedResponse, PipelineError> {
        let config = self.config.load_full();

        let host = request
            .url
            .host_str()
            .ok_or_else(|| PipelineError::InvalidRequest("request has no host".to_string()))?
            .to_string();
        let normalized = policy::normalize_host(&host);

        let configs = policy::matching_entries(&config, &normalized);
        let options = policy::parse_options(&mut request.headers);
        policy::strip_hop_headers(&mut request.headers);
        policy::apply_headers(&mut request.headers, &configs);

        let buffer_body = policy::needs_body(&configs);
        let effective = configs
            .last()
            .cloned()
            .unwrap_or_else(|| Arc::clone(&config.default_host));

        let mut ctx = RequestCtx::new(request, options, configs);
        trace!(
            host = %normalized,
            configs = ctx.configs.len(),
            cf_bypass = ctx.options.cloudflare_bypass,
            "request accepted"
        );

        loop {
            let upstream = self.store.choose(ctx.last_failed_proxy.as_deref()).await?;
            self.store.connection_opened(&upstream).await;
            let _conn = ConnGuard::new(self.store.as_ref(), Arc::clone(&upstream));

            let pacing = self
                .store
                .reserve(&upstream, &normalized, &effective)
                .await?;
            if !pacing.is_zero() {
                trace!(wait = ?pacing, upstream = %upstream.name(), "sleeping for rate limit");
                self.metrics.emit(MetricPoint::Sleep {
                    context: SleepContext::Rate,
                    duration_seconds: pacing.as_secs_f64(),
                });
                tokio::time::sleep(pacing).await;
            }

            let attempt_started = Instant::now();
            let result = upstream.execute(&ctx.request).await;
            let elapsed = attempt_started.elapsed().as_secs_f64();

            // Split the attempt result into rule-visible parts, keeping the
            // streaming response around for the success path when no rule
            // needs the body.
            let mut streaming: Option<reqwest::Response> = None;
            let mut error: Option<reqwest::Error> = None;
            let (parts, body) = match result {
                Ok(response) => {
                    let parts = AttemptResponse {
                        status: response.status(),
                        headers: response.headers().clone(),
                    };
                    if buffer_body {
                        match response.bytes().await {
                            Ok(bytes) => (Some(parts), Some(bytes)),
                            Err(e) => {
                                error = Some(e);
                                (None, None)
                            }
                        }
                    } else {
                        streaming = Some(response);
                        (Some(parts), None)
                    }
                }
                Err(e) => {
                    error = Some(e);
                    (None, None)
                }
            };

            let response_ctx = ResponseCtx {
                response: parts,
                body,
                response_time: elapsed,
                error: error.as_ref().map(ToString::to_string),
            };

            let outcome = policy::compute_rules(&ctx.configs, &response_ctx);
            if let Some(rate) = outcome.new_limit {
                self.store
                    .adjust_limit(&upstream, &normalized, &effective, LimitChange::Set(rate))
                    .await;
            }
            if (outcome.limit_multiplier - 1.0).abs() > f64::EPSILON {
                self.store
                    .adjust_limit(
                        &upstream,
                        &normalized,
                        &effective,
                        LimitChange::Multiply(outcome.limit_multiplier),
                    )
                    .await;
            }

            let success = response_ctx
                .response
                .as_ref()
                .is_some_and(|r| classify::is_success(r.status));
            let blame = match (&response_ctx.response, &error) {
                (Some(r), _) => !success && classify::blames_upstream(r.status),
                (None, Some(e)) => {
                    classify::classify(e, upstream.is_proxied()) == ErrorClass::Proxy
                }
                (None, None) => false,
            };

            self.emit_request_point(&response_ctx, elapsed);
            self.store
                .record_attempt(
                    &upstream,
                    &AttemptRecord { success, blame, elapsed_seconds: elapsed },
                )
                .await;

            if success {
                let response = response_ctx.response.expect("success implies a response");
                let mut headers = response.headers;
                policy::strip_hop_headers(&mut headers);
                let body = match (response_ctx.body, streaming) {
                    (Some(bytes), _) => ProxyBody::Buffered(bytes),
                    (None, Some(stream)) => ProxyBody::Streaming(stream),
                    (None, None) => ProxyBody::Buffered(Bytes::new()),
                };
                return Ok(ProxiedResponse { status: response.status, headers, body });
            }

            if let Some(e) = &error {
                match classify::classify(e, upstream.is_proxied()) {
                    ErrorClass::Proxy => {
                        warn!(
                            upstream = %upstream.name(),
                            error = %e,
                            "proxy error, marking dead and switching"
                        );
                        self.store.mark_dead(upstream.name()).await;
                        ctx.last_failed_proxy = Some(upstream.name_arc());
                        ctx.last_error_was_proxy_error = true;
                        continue;
                    }
                    ErrorClass::Permanent => {
                        return Err(PipelineError::Transport(e.to_string()));
                    }
                    ErrorClass::Transient => {}
                }
            }
            ctx.last_error_was_proxy_error = false;

            if outcome.force_retry {
                if ctx.retries >= config.retries_hard {
                    return Err(PipelineError::GivingUp(ctx.retries));
                }
                self.sleep_backoff(config.wait, config.multiplier, ctx.retries).await;
                ctx.retries += 1;
                continue;
            }

            if outcome.dont_retry {
                return Err(PipelineError::DontRetry);
            }

            let retryable_status = response_ctx
                .response
                .as_ref()
                .is_some_and(|r| classify::should_retry_status(r.status));
            if error.is_some() || outcome.should_retry || retryable_status {
                if ctx.retries >= config.retries {
                    return Err(PipelineError::GivingUp(ctx.retries));
                }
                self.sleep_backoff(config.wait, config.multiplier, ctx.retries).await;
                ctx.retries += 1;
                continue;
            }

            return match response_ctx.response {
                Some(response) => Err(PipelineError::HttpError(response.status.as_u16())),
                None => Err(PipelineError::Transport(
                    error.map(|e| e.to_string()).unwrap_or_default(),
                )),
            };
        }
    }

    async fn sleep_backoff(&self, wait: std::time::Duration, multiplier: f64, retries: u32) {
        let delay = classify::backoff(wait, multiplier, retries);
        if delay.is_zero() {
            return;
        }
        trace!(wait = ?delay, retries, "sleeping before retry");
        self.metrics.emit(MetricPoint::Sleep {
            context: SleepContext::Retry,
            duration_seconds: delay.as_secs_f64(),
        });
        tokio::time::sleep(delay).await;
    }

    fn emit_request_point(&self, response_ctx: &ResponseCtx, elapsed: f64) {
        let (status, size) = response_ctx.response.as_ref().map_or((None, 0), |r| {
            let size = r
                .headers
                .get(http::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            (Some(r.status.as_u16()), size)
        });

        self.metrics.emit(MetricPoint::Request {
            ok: response_ctx.error.is_none(),
            status,
            latency_seconds: elapsed,
            size,
        });
    }
}
