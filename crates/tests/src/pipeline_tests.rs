//! End-to-end pipeline scenarios against scripted local origins.

use http::StatusCode;

use architeuthis_core::PipelineError;

use crate::support::{
    body_bytes, build_pipeline, get_request, single_upstream_config, ScriptedOrigin,
};

#[tokio::test]
async fn happy_path_returns_the_origin_response() {
    let origin = ScriptedOrigin::start(vec![(StatusCode::OK, "hello from origin")]).await;
    let (pipeline, store, _config) = build_pipeline(&single_upstream_config("")).await;

    let response = pipeline.handle(get_request(origin.url("/"))).await.unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(&body_bytes(response.body).await[..], b"hello from origin");
    assert_eq!(origin.hits(), 1);

    let upstream = &store.alive().await[0];
    assert_eq!(upstream.good(), 1);
    assert_eq!(upstream.bad(), 0);
    assert_eq!(upstream.connections(), 0);
}

#[tokio::test]
async fn retries_through_500s_until_success() {
    let origin = ScriptedOrigin::start(vec![
        (StatusCode::INTERNAL_SERVER_ERROR, "boom"),
        (StatusCode::INTERNAL_SERVER_ERROR, "boom"),
        (StatusCode::OK, "finally"),
    ])
    .await;
    let (pipeline, store, _config) = build_pipeline(&single_upstream_config("")).await;

    let response = pipeline.handle(get_request(origin.url("/flaky"))).await.unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(origin.hits(), 3);

    let upstream = &store.alive().await[0];
    assert_eq!(upstream.good(), 1);
    assert_eq!(upstream.bad(), 2);
}

#[tokio::test]
async fn exhausted_budget_gives_up() {
    let origin =
        ScriptedOrigin::start(vec![(StatusCode::INTERNAL_SERVER_ERROR, "always broken")]).await;
    let config = single_upstream_config("").replace("\"retries\": 3", "\"retries\": 2");
    let (pipeline, _store, _config) = build_pipeline(&config).await;

    let error = pipeline.handle(get_request(origin.url("/"))).await.unwrap_err();

    assert_eq!(error.to_string(), "giving up after 2 retries");
    assert_eq!(origin.hits(), 3);
}

#[tokio::test]
async fn dont_retry_rule_short_circuits() {
    let origin = ScriptedOrigin::start(vec![(StatusCode::NOT_FOUND, "nope")]).await;
    let rules = r#", "rules": [{"condition": "status=404", "action": "dont_retry"}]"#;
    let (pipeline, store, _config) = build_pipeline(&single_upstream_config(rules)).await;

    let error = pipeline.handle(get_request(origin.url("/missing"))).await.unwrap_err();

    assert!(matches!(error, PipelineError::DontRetry));
    assert_eq!(error.to_string(), "Applied dont_retry rule");
    assert_eq!(origin.hits(), 1);
    assert_eq!(store.alive().await[0].bad(), 1);
}

#[tokio::test]
async fn non_retryable_status_surfaces_as_http_error() {
    let origin = ScriptedOrigin::start(vec![(StatusCode::GONE, "gone")]).await;
    let (pipeline, _store, _config) = build_pipeline(&single_upstream_config("")).await;

    let error = pipeline.handle(get_request(origin.url("/"))).await.unwrap_err();

    assert_eq!(error.to_string(), "HTTP error: 410");
    assert_eq!(origin.hits(), 1);
}

#[tokio::test]
async fn empty_pool_reports_no_proxies() {
    let origin = ScriptedOrigin::start(vec![(StatusCode::OK, "unreachable")]).await;
    let config = single_upstream_config("").replace(
        r#"[{"name": "p0", "url": ""}]"#,
        "[]",
    );
    let (pipeline, _store, _config) = build_pipeline(&config).await;

    let error = pipeline.handle(get_request(origin.url("/"))).await.unwrap_err();

    assert_eq!(error.to_string(), "no proxies available");
    assert_eq!(origin.hits(), 0);
}

#[tokio::test]
async fn proxy_failure_kills_the_upstream_and_switches() {
    let origin = ScriptedOrigin::start(vec![(StatusCode::OK, "ok")]).await;
    // pA points at a proxy that refuses connections; pB egresses directly.
    let config = r#"{
        "addr": "localhost:0", "timeout": "2s", "wait": "1ms",
        "multiplier": 1.0, "retries": 3,
        "hosts": [{"host": "*", "every": "1ms", "burst": 1000}],
        "proxies": [
            {"name": "pA", "url": "http://127.0.0.1:1"},
            {"name": "pB", "url": ""}
        ]
    }"#;
    let (pipeline, store, _config) = build_pipeline(config).await;

    // Selection is randomized; drive requests until pA has been picked
    // once. Every request must still succeed, via pB.
    for _ in 0..50 {
        let response = pipeline.handle(get_request(origin.url("/"))).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        if store.dead().await.iter().any(|u| u.name() == "pA") {
            break;
        }
    }

    assert!(
        store.dead().await.iter().any(|u| u.name() == "pA"),
        "pA was never killed in 50 requests"
    );
    assert!(store.alive().await.iter().any(|u| u.name() == "pB"));
}

#[tokio::test]
async fn body_rules_leave_the_client_bytes_intact() {
    let origin = ScriptedOrigin::start(vec![(StatusCode::OK, "the exact payload bytes")]).await;
    let rules = r#", "rules": [{"condition": "body=*rate limited*", "action": "should_retry"}]"#;
    let (pipeline, _store, _config) = build_pipeline(&single_upstream_config(rules)).await;

    let response = pipeline.handle(get_request(origin.url("/"))).await.unwrap();

    // The rule read the body; the client still sees it byte-for-byte.
    assert_eq!(&body_bytes(response.body).await[..], b"the exact payload bytes");
    assert_eq!(origin.hits(), 1);
}

#[tokio::test]
async fn body_rule_matching_retries_despite_200() {
    let origin = ScriptedOrigin::start(vec![
        (StatusCode::OK, "you are being rate limited"),
        (StatusCode::OK, "real content"),
    ])
    .await;
    let rules = r#", "rules": [{"condition": "body=*rate limited*", "action": "should_retry"}]"#;
    let (pipeline, _store, _config) = build_pipeline(&single_upstream_config(rules)).await;

    // A 2xx returns immediately regardless of should_retry; the rule only
    // matters for non-2xx attempts. The first response is a 200, so the
    // pipeline returns it.
    let response = pipeline.handle(get_request(origin.url("/"))).await.unwrap();
    assert_eq!(&body_bytes(response.body).await[..], b"you are being rate limited");
    assert_eq!(origin.hits(), 1);
}

#[tokio::test]
async fn config_headers_are_injected_and_reserved_headers_stripped() {
    let origin = ScriptedOrigin::echo_headers().await;
    let headers = r#", "headers": {"X-Injected": "by-config"}"#;
    let (pipeline, _store, _config) = build_pipeline(&single_upstream_config(headers)).await;

    let mut request = get_request(origin.url("/"));
    request.headers.insert("x-architeuthis-cf-bypass", "1".parse().unwrap());
    request.headers.insert("x-client", "kept".parse().unwrap());

    let response = pipeline.handle(request).await.unwrap();
    let body = body_bytes(response.body).await;
    let listing = String::from_utf8_lossy(&body);

    assert!(listing.contains("x-injected:by-config"), "{listing}");
    assert!(listing.contains("x-client:kept"), "{listing}");
    assert!(!listing.contains("x-architeuthis"), "{listing}");
}

#[tokio::test]
async fn force_retry_extends_past_the_normal_budget() {
    let origin = ScriptedOrigin::start(vec![
        (StatusCode::IM_A_TEAPOT, "try harder"),
        (StatusCode::IM_A_TEAPOT, "try harder"),
        (StatusCode::OK, "eventually"),
    ])
    .await;
    // 418 is not in the retryable status table; only the force_retry rule
    // keeps the attempts coming. retries=0 so the normal budget is spent
    // immediately, while retries_hard still allows progress.
    let config = r#"{
        "addr": "localhost:0", "timeout": "5s", "wait": "1ms",
        "multiplier": 1.0, "retries": 0, "retries_hard": 5,
        "hosts": [
            {"host": "*", "every": "1ms", "burst": 100,
             "rules": [{"condition": "status=418", "action": "force_retry"}]}
        ],
        "proxies": [{"name": "p0", "url": ""}]
    }"#;
    let (pipeline, _store, _config) = build_pipeline(config).await;

    let response = pipeline.handle(get_request(origin.url("/"))).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(origin.hits(), 3);
}

#[tokio::test]
async fn connections_balance_out_under_concurrency() {
    let origin = ScriptedOrigin::start(vec![(StatusCode::OK, "ok")]).await;
    let (pipeline, store, _config) = build_pipeline(&single_upstream_config("")).await;
    let pipeline = std::sync::Arc::new(pipeline);

    let mut handles = Vec::new();
    for _ in 0..20 {
        let pipeline = std::sync::Arc::clone(&pipeline);
        let url = origin.url("/");
        handles.push(tokio::spawn(async move {
            pipeline.handle(get_request(url)).await.unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let upstream = &store.alive().await[0];
    assert_eq!(upstream.connections(), 0);
    assert_eq!(upstream.good(), 20);
}
