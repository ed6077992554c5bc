//! Admin mux served on the proxy port for non-proxy (origin-form) requests.
//!
//! - `GET /reload` reloads the configuration and rebuilds the store.
//! - `GET /stats` renders the upstream dashboard.
//! - `GET /add_proxy?name=&url=` registers an upstream at runtime.
//! - `GET /` answers with the service identity.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tracing::{error, info};

use crate::app::App;

/// Builds the admin router.
pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/", get(identity))
        .route("/reload", get(reload))
        .route("/stats", get(stats))
        .route("/add_proxy", get(add_proxy))
        .with_state(app)
}

async fn identity() -> Json<serde_json::Value> {
    Json(json!({"name": "Architeuthis", "version": 2.0}))
}

async fn reload(State(app): State<Arc<App>>) -> impl IntoResponse {
    match app.reload().await {
        Ok(()) => {
            info!("reloaded config");
            (StatusCode::OK, "Reloaded\n".to_string())
        }
        Err(e) => {
            error!(error = %e, "reload failed");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{e}\n"))
        }
    }
}

async fn add_proxy(
    State(app): State<Arc<App>>,
    Query(params): Query<HashMap<String, String>>,
) -> StatusCode {
    let Some(name) = params.get("name").filter(|n| !n.is_empty()) else {
        return StatusCode::BAD_REQUEST;
    };
    let url = params.get("url").map(String::as_str).unwrap_or("");

    match app.store().add(name, url).await {
        Ok(_) => StatusCode::NO_CONTENT,
        Err(e) => {
            error!(name, error = %e, "add_proxy failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn stats(State(app): State<Arc<App>>) -> Html<String> {
    let alive = app.store().alive().await;
    let dead = app.store().dead().await;

    let mut total_good = 0u64;
    let mut total_bad = 0u64;
    let mut total_connections = 0i64;
    let mut total_time = 0.0f64;
    let mut total_score = 0.0f64;

    let mut rows = String::new();
    for upstream in &alive {
        let s = upstream.stats();
        total_good += s.good;
        total_bad += s.bad;
        total_connections += s.connections;
        total_time += upstream.total_latency_seconds();
        total_score += s.score;

        let _ = write!(
            rows,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td>\
             <td>{:.3}s</td><td>{}</td><td>{:.0}</td></tr>",
            s.name, s.url, s.good, s.bad, s.avg_latency, s.connections, s.score
        );
    }

    let completed = total_good + total_bad;
    #[allow(clippy::cast_precision_loss)]
    let avg_latency = if completed == 0 { 0.0 } else { total_time / completed as f64 };
    #[allow(clippy::cast_precision_loss)]
    let avg_score = if alive.is_empty() { 0.0 } else { total_score / alive.len() as f64 };

    let mut dead_rows = String::new();
    for upstream in &dead {
        let _ = write!(dead_rows, "<tr><td>{}</td><td>{}</td></tr>", upstream.name(), upstream.url_str());
    }

    Html(format!(
        "<!DOCTYPE html><html><head><title>Architeuthis</title>\
         <style>body{{font-family:monospace}}table{{border-collapse:collapse}}\
         td,th{{border:1px solid #999;padding:2px 8px}}</style></head><body>\
         <h1>Architeuthis</h1>\
         <p>good={total_good} bad={total_bad} connections={total_connections} \
         avg_latency={avg_latency:.3}s avg_score={avg_score:.0}</p>\
         <h2>Alive</h2>\
         <table><tr><th>name</th><th>url</th><th>good</th><th>bad</th>\
         <th>avg latency</th><th>conns</th><th>score</th></tr>{rows}</table>\
         <h2>Dead</h2>\
         <table><tr><th>name</th><th>url</th></tr>{dead_rows}</table>\
         </body></html>"
    ))
}
