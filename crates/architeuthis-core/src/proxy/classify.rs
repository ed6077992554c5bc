//! Classification of attempt failures and the backoff schedule.
//!
//! Transport errors fall into three classes that drive the retry loop:
//!
//! - *Proxy*: the link to the upstream itself failed. The upstream is at
//!   fault; it is killed and the request moves to a different one without
//!   consuming retry budget.
//! - *Permanent*: retrying cannot help (DNS failure, connection refused,
//!   proxy authentication required). Surfaced to the caller immediately.
//! - *Transient*: everything else (resets, read timeouts against the
//!   target). Retried after backoff.
//!
//! A pure timeout is transient, not a proxy fault: the tunnel was up, the
//! origin was slow.

use std::time::Duration;

use http::StatusCode;

/// Transport error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Proxy,
    Permanent,
    Transient,
}

/// Flattens an error's source chain into one lowercase haystack.
fn error_chain(error: &reqwest::Error) -> String {
    let mut chain = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain.to_ascii_lowercase()
}

/// Classifies a transport error from one attempt.
///
/// `via_proxy` is whether the attempt went through an upstream proxy link;
/// connect-phase failures are the proxy's fault only when one was in the
/// path at all.
#[must_use]
pub fn classify(error: &reqwest::Error, via_proxy: bool) -> ErrorClass {
    if error.is_timeout() {
        return ErrorClass::Transient;
    }

    let chain = error_chain(error);

    if chain.contains("proxy authentication required") || chain.contains("407") {
        return ErrorClass::Permanent;
    }

    if via_proxy && (error.is_connect() || chain.contains("tunnel") || chain.contains("proxy")) {
        return ErrorClass::Proxy;
    }

    if chain.contains("certificate") || chain.contains("handshake") || chain.contains("tls") {
        // TLS setup failure on a proxied link means the tunnel itself is
        // broken; on a direct link the origin gets another chance.
        return if via_proxy { ErrorClass::Proxy } else { ErrorClass::Transient };
    }

    if chain.contains("dns error") || chain.contains("failed to lookup") {
        return ErrorClass::Permanent;
    }

    if error.is_connect() || chain.contains("connection refused") {
        return ErrorClass::Permanent;
    }

    ErrorClass::Transient
}

/// 2xx check.
#[must_use]
pub fn is_success(status: StatusCode) -> bool {
    status.is_success()
}

/// Statuses worth another attempt: 403, 408, 429, 444, 499 and all 5xx.
#[must_use]
pub fn should_retry_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 403 | 408 | 429 | 444 | 499) || status.as_u16() >= 500
}

/// Whether a failed response is attributable to the upstream.
///
/// 5xx is the origin's problem, not the forwarder's; everything else that
/// failed points at the upstream.
#[must_use]
pub fn blames_upstream(status: StatusCode) -> bool {
    status.as_u16() < 500
}

/// Backoff before retry `retries + 1`: `wait × multiplier^retries`.
#[must_use]
pub fn backoff(wait: Duration, multiplier: f64, retries: u32) -> Duration {
    let factor = multiplier.powi(i32::try_from(retries).unwrap_or(i32::MAX));
    if !factor.is_finite() {
        return Duration::MAX;
    }
    wait.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_codes() {
        assert!(is_success(StatusCode::OK));
        assert!(is_success(StatusCode::NO_CONTENT));
        assert!(!is_success(StatusCode::MOVED_PERMANENTLY));
        assert!(!is_success(StatusCode::NOT_FOUND));
    }

    #[test]
    fn retryable_statuses() {
        for code in [403u16, 408, 429, 444, 499, 500, 502, 503, 599] {
            assert!(
                should_retry_status(StatusCode::from_u16(code).unwrap()),
                "{code} should be retryable"
            );
        }
        for code in [200u16, 301, 400, 404, 410] {
            assert!(
                !should_retry_status(StatusCode::from_u16(code).unwrap()),
                "{code} should not be retryable"
            );
        }
    }

    #[test]
    fn five_xx_does_not_blame_the_upstream() {
        assert!(!blames_upstream(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!blames_upstream(StatusCode::BAD_GATEWAY));
        assert!(blames_upstream(StatusCode::FORBIDDEN));
        assert!(blames_upstream(StatusCode::NOT_FOUND));
    }

    #[test]
    fn backoff_escalates_geometrically() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff(base, 2.0, 0), Duration::from_millis(100));
        assert_eq!(backoff(base, 2.0, 1), Duration::from_millis(200));
        assert_eq!(backoff(base, 2.0, 3), Duration::from_millis(800));
        assert_eq!(backoff(base, 1.0, 10), base);
    }

    #[tokio::test]
    async fn connection_refused_is_permanent_direct_but_proxy_fault_proxied() {
        // Port 1 on localhost refuses connections without touching the
        // network.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        let error = client
            .get("http://127.0.0.1:1/")
            .send()
            .await
            .expect_err("port 1 must refuse");

        assert_eq!(classify(&error, false), ErrorClass::Permanent);
        assert_eq!(classify(&error, true), ErrorClass::Proxy);
    }

    #[tokio::test]
    async fn connect_failure_through_a_proxy_is_a_proxy_error() {
        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all("http://127.0.0.1:1").unwrap())
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        let error = client
            .get("http://example.com/")
            .send()
            .await
            .expect_err("proxy on port 1 must refuse");

        assert_eq!(classify(&error, true), ErrorClass::Proxy);
    }
}
