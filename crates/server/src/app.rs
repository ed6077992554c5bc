//! Shared application state for the listener and the admin mux.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use architeuthis_core::config::{Config, SharedConfig};
use architeuthis_core::upstream::ProxyStore;
use architeuthis_core::RequestPipeline;

/// Everything a connection handler needs.
pub struct App {
    config: SharedConfig,
    config_path: PathBuf,
    pipeline: RequestPipeline,
    store: Arc<dyn ProxyStore>,
}

impl App {
    #[must_use]
    pub fn new(
        config: SharedConfig,
        config_path: PathBuf,
        pipeline: RequestPipeline,
        store: Arc<dyn ProxyStore>,
    ) -> Self {
        Self { config, config_path, pipeline, store }
    }

    #[must_use]
    pub fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn ProxyStore> {
        &self.store
    }

    /// Re-parses the config file, swaps the snapshot, and rebuilds the
    /// upstream pool and its seeded limiters.
    ///
    /// # Errors
    ///
    /// Returns an error when the file does not load or the store cannot be
    /// rebuilt; the previous snapshot stays live in that case.
    pub async fn reload(&self) -> anyhow::Result<()> {
        let fresh = Config::from_file(&self.config_path)
            .with_context(|| format!("reloading {}", self.config_path.display()))?;
        self.config.store(Arc::new(fresh));
        self.store.rebuild().await.context("rebuilding upstream pool")?;
        Ok(())
    }
}
