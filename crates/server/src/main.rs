//! Architeuthis: an intercepting HTTP forward proxy that multiplexes
//! requests across a scored pool of upstream proxies.

mod admin;
mod app;
mod proxy;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use architeuthis_core::config::Config;
use architeuthis_core::limiter::LimiterGc;
use architeuthis_core::metrics::{MetricsEmitter, TracingSink};
use architeuthis_core::upstream::{MemoryStore, Prober, ProxyStore, RedisStore};
use architeuthis_core::RequestPipeline;

use app::App;
use proxy::{PassthroughTunnel, ProxyServer};

/// Initializes tracing from the logging section, `RUST_LOG` winning when
/// set.
fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    if config.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn config_path() -> PathBuf {
    std::env::var("ARCHITEUTHIS_CONFIG")
        .map_or_else(|_| PathBuf::from("config.json"), PathBuf::from)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = config_path();
    let config = Config::from_file(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    init_logging(&config);

    let shared_config = config.into_shared();
    let (metrics, _metrics_task) = MetricsEmitter::spawn(Arc::new(TracingSink));

    let store: Arc<dyn ProxyStore> = {
        let snapshot = shared_config.load_full();
        if let Some(redis_url) = snapshot.redis_url.clone() {
            info!(redis = %redis_url, "using shared redis store");
            Arc::new(
                RedisStore::connect(&redis_url, Arc::clone(&shared_config), Arc::clone(&metrics))
                    .await
                    .context("connecting to redis")?,
            )
        } else {
            Arc::new(
                MemoryStore::new(Arc::clone(&shared_config), Arc::clone(&metrics))
                    .await
                    .context("building upstream pool")?,
            )
        }
    };

    let (shutdown_tx, _) = broadcast::channel(1);

    let gc = LimiterGc::new(Arc::clone(&store));
    let _gc_task = gc.start_with_shutdown(shutdown_tx.subscribe());
    info!(every = "5m", "started limiter cleanup task");

    let prober = Arc::new(Prober::new(Arc::clone(&store), Arc::clone(&shared_config)));
    let _prober_task = prober.start_with_shutdown(shutdown_tx.subscribe());
    info!(every = "10m", "started proxy revive task");

    let pipeline =
        RequestPipeline::new(Arc::clone(&shared_config), Arc::clone(&store), metrics);
    let app = Arc::new(App::new(Arc::clone(&shared_config), path, pipeline, store));

    let admin = admin::router(Arc::clone(&app));
    let server = Arc::new(ProxyServer::new(app, admin, Arc::new(PassthroughTunnel)));

    let addr = shared_config.load().addr.clone();
    let server_task = tokio::spawn(server.run(addr, shutdown_tx.subscribe()));

    signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(());

    match server_task.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(error = %e, "listener failed");
            Err(e)
        }
        Err(e) => Err(anyhow::anyhow!("listener task panicked: {e}")),
    }
}
