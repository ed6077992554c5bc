//! Rate-limit pacing and rule-driven limit mutation, end to end.

use std::time::Instant;

use http::StatusCode;

use crate::support::{build_pipeline, get_request, ScriptedOrigin};

#[tokio::test]
async fn sequential_requests_are_paced_by_the_host_limit() {
    let origin = ScriptedOrigin::start(vec![(StatusCode::OK, "ok")]).await;
    let config = r#"{
        "addr": "localhost:0", "timeout": "5s", "wait": "1ms",
        "multiplier": 1.0, "retries": 1,
        "hosts": [{"host": "*", "every": "500ms", "burst": 1}],
        "proxies": [{"name": "p0", "url": ""}]
    }"#;
    let (pipeline, _store, _config) = build_pipeline(config).await;

    let started = Instant::now();
    for _ in 0..5 {
        let response = pipeline.handle(get_request(origin.url("/"))).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
    }
    let elapsed = started.elapsed();

    // Burst of 1 at 2 tokens/s: four of the five requests wait ~500ms.
    assert!(elapsed.as_millis() >= 1900, "five requests took only {elapsed:?}");
    assert_eq!(origin.hits(), 5);
}

#[tokio::test]
async fn set_every_rule_slows_subsequent_reservations() {
    let origin = ScriptedOrigin::start(vec![
        (StatusCode::TOO_MANY_REQUESTS, "slow down"),
        (StatusCode::OK, "ok"),
    ])
    .await;
    let config = r#"{
        "addr": "localhost:0", "timeout": "5s", "wait": "1ms",
        "multiplier": 1.0, "retries": 3,
        "hosts": [
            {"host": "*", "every": "1ms", "burst": 1,
             "rules": [{"condition": "status=429", "action": "set_every", "arg": "1s"}]}
        ],
        "proxies": [{"name": "p0", "url": ""}]
    }"#;
    let (pipeline, _store, _config) = build_pipeline(config).await;

    let started = Instant::now();
    let response = pipeline.handle(get_request(origin.url("/"))).await.unwrap();
    let elapsed = started.elapsed();

    // The 429 matched set_every("1s") before the retry's reservation, so
    // the second attempt paced at one token per second.
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(origin.hits(), 2);
    assert!(elapsed.as_millis() >= 900, "retry was not repaced: {elapsed:?}");
}

#[tokio::test]
async fn multiply_every_rule_compounds_the_interval() {
    let origin = ScriptedOrigin::start(vec![
        (StatusCode::TOO_MANY_REQUESTS, "slow down"),
        (StatusCode::OK, "ok"),
    ])
    .await;
    // every=200ms multiplied by 2 on the 429: the retry reservation waits
    // roughly 400ms instead of 200ms.
    let config = r#"{
        "addr": "localhost:0", "timeout": "5s", "wait": "1ms",
        "multiplier": 1.0, "retries": 3,
        "hosts": [
            {"host": "*", "every": "200ms", "burst": 1,
             "rules": [{"condition": "status=429", "action": "multiply_every", "arg": "2"}]}
        ],
        "proxies": [{"name": "p0", "url": ""}]
    }"#;
    let (pipeline, _store, _config) = build_pipeline(config).await;

    let started = Instant::now();
    let response = pipeline.handle(get_request(origin.url("/"))).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(response.status, StatusCode::OK);
    assert!(elapsed.as_millis() >= 350, "halved rate not applied: {elapsed:?}");
}
