//! Reusable test infrastructure: scripted local origins and pipeline
//! builders, so end-to-end scenarios run without touching the network.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use url::Url;

use architeuthis_core::config::{Config, SharedConfig};
use architeuthis_core::metrics::{MetricsEmitter, NullSink};
use architeuthis_core::types::ProxiedRequest;
use architeuthis_core::upstream::{MemoryStore, ProxyStore};
use architeuthis_core::{ProxyBody, RequestPipeline};

enum Behavior {
    /// Response `i` is `script[min(i, len - 1)]`.
    Scripted(Vec<(StatusCode, &'static str)>),
    /// Body lists the request's headers as `name:value` lines.
    EchoHeaders,
}

struct OriginState {
    hits: AtomicUsize,
    behavior: Behavior,
}

/// A local HTTP origin with scripted responses and a hit counter.
pub struct ScriptedOrigin {
    addr: SocketAddr,
    state: Arc<OriginState>,
}

impl ScriptedOrigin {
    /// Starts an origin that walks through `script`, repeating the last
    /// entry once the script is exhausted.
    pub async fn start(script: Vec<(StatusCode, &'static str)>) -> Self {
        assert!(!script.is_empty(), "script must have at least one response");
        Self::serve(Behavior::Scripted(script)).await
    }

    /// Starts an origin whose responses list the received request headers.
    pub async fn echo_headers() -> Self {
        Self::serve(Behavior::EchoHeaders).await
    }

    async fn serve(behavior: Behavior) -> Self {
        let state = Arc::new(OriginState { hits: AtomicUsize::new(0), behavior });
        let router = Router::new()
            .fallback(respond)
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test origin");
        let addr = listener.local_addr().expect("origin addr");
        tokio::spawn(axum::serve(listener, router).into_future());

        Self { addr, state }
    }

    /// Absolute URL for `path` on this origin.
    pub fn url(&self, path: &str) -> Url {
        Url::parse(&format!("http://{}{path}", self.addr)).expect("origin url")
    }

    /// How many requests the origin has served.
    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }
}

async fn respond(State(state): State<Arc<OriginState>>, request: Request) -> Response {
    let hit = state.hits.fetch_add(1, Ordering::SeqCst);

    match &state.behavior {
        Behavior::Scripted(script) => {
            let (status, body) = script[hit.min(script.len() - 1)];
            Response::builder()
                .status(status)
                .body(Body::from(body))
                .expect("scripted response")
        }
        Behavior::EchoHeaders => {
            let mut lines = String::new();
            for (name, value) in request.headers() {
                lines.push_str(name.as_str());
                lines.push(':');
                lines.push_str(value.to_str().unwrap_or(""));
                lines.push('\n');
            }
            Response::builder()
                .status(StatusCode::OK)
                .body(Body::from(lines))
                .expect("echo response")
        }
    }
}

/// Builds a pipeline over an in-process store from a config JSON string.
pub async fn build_pipeline(config_json: &str) -> (RequestPipeline, Arc<dyn ProxyStore>, SharedConfig) {
    let config = Config::from_json(config_json).expect("test config").into_shared();
    let (metrics, _task) = MetricsEmitter::spawn(Arc::new(NullSink));
    let store: Arc<dyn ProxyStore> = Arc::new(
        MemoryStore::new(Arc::clone(&config), Arc::clone(&metrics))
            .await
            .expect("test store"),
    );
    let pipeline = RequestPipeline::new(Arc::clone(&config), Arc::clone(&store), metrics);
    (pipeline, store, config)
}

/// A plain GET with no body.
pub fn get_request(url: Url) -> ProxiedRequest {
    ProxiedRequest::new(Method::GET, url, HeaderMap::new(), Bytes::new())
}

/// Drains a response body to bytes regardless of its representation.
pub async fn body_bytes(body: ProxyBody) -> Bytes {
    match body {
        ProxyBody::Buffered(bytes) => bytes,
        ProxyBody::Streaming(response) => response.bytes().await.expect("stream body"),
    }
}

/// Config template: one direct upstream, a permissive catch-all host.
#[must_use]
pub fn single_upstream_config(extra_host_fields: &str) -> String {
    format!(
        r#"{{
            "addr": "localhost:0",
            "timeout": "5s",
            "wait": "1ms",
            "multiplier": 1.0,
            "retries": 3,
            "hosts": [
                {{"host": "*", "every": "1ms", "burst": 100{extra_host_fields}}}
            ],
            "proxies": [{{"name": "p0", "url": ""}}]
        }}"#
    )
}
