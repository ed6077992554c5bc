//! Score-based selection behavior over larger pools.

use std::collections::HashMap;

use crate::support::build_pipeline;

fn pool_config(count: usize) -> String {
    let proxies: Vec<String> = (0..count)
        .map(|i| format!(r#"{{"name": "p{i}", "url": ""}}"#))
        .collect();
    format!(
        r#"{{
            "addr": "localhost:0", "timeout": "5s", "wait": "1ms",
            "multiplier": 1.0, "retries": 1,
            "hosts": [{{"host": "*", "every": "1ms", "burst": 1000}}],
            "proxies": [{}]
        }}"#,
        proxies.join(",")
    )
}

#[tokio::test]
async fn selection_window_excludes_the_worst_scored_upstreams() {
    let (_pipeline, store, _config) = build_pipeline(&pool_config(16)).await;

    // p0 stays clean; p1..p15 get strictly decreasing scores, so the
    // bottom three fall outside the 13-wide selection window.
    for upstream in store.alive().await {
        let name = upstream.name().to_string();
        if name == "p0" {
            for _ in 0..20 {
                upstream.record_success(0.1);
            }
            continue;
        }
        let rank: u64 = name[1..].parse().unwrap();
        upstream.record_success(0.1);
        for _ in 0..=rank {
            upstream.record_failure(0.1);
        }
    }

    let mut wins: HashMap<String, u32> = HashMap::new();
    for _ in 0..1000 {
        let picked = store.choose(None).await.unwrap();
        *wins.entry(picked.name().to_string()).or_insert(0) += 1;
    }

    let clean = wins.get("p0").copied().unwrap_or(0);
    assert!(clean > 0, "the best upstream was never selected: {wins:?}");

    for excluded in ["p13", "p14", "p15"] {
        assert_eq!(
            wins.get(excluded).copied().unwrap_or(0),
            0,
            "{excluded} should be outside the selection window: {wins:?}"
        );
    }

    // Everyone inside the window is sampled uniformly, so the clean
    // upstream beats any excluded one by construction and roughly matches
    // its window peers.
    let sampled: u32 = wins.values().sum();
    assert_eq!(sampled, 1000);
}

#[tokio::test]
async fn retry_selection_avoids_the_proxy_that_just_failed() {
    let (_pipeline, store, _config) = build_pipeline(&pool_config(3)).await;

    for _ in 0..200 {
        let picked = store.choose(Some("p1")).await.unwrap();
        assert_ne!(picked.name(), "p1");
    }
}
