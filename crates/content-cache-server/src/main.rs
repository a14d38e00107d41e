//! Content cache server
//!
//! Serves content from a durable directory store through a quota-managed
//! on-disk cache tier, with manual eviction, owning records and secure deletion endpoints.

mod error;
mod server;
mod types;

use crate::error::{CacheServerError, Result};
use crate::server::{start_server, ServerState, SharedState};
use crate::types::ServerConfig;
use content_blob_cache::{
    CacheConfig, CachingContentStore, ContentCache, DestructionCoordinator, FileContentStore,
    MemoryRecordStore, OverwriteCleanser,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::from_default_env()
        .add_directive("content_cache_server=info".parse()?)
        .add_directive("content_blob_cache=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting content cache server...");

    let config = load_config();
    config.cache.validate()?;
    info!("Port: {}", config.port);
    info!("Backing dir: {:?}", config.backing_dir);
    info!("Cache dir: {:?}", config.cache.cache_dir);
    if config.cache.is_bounded() {
        info!(
            "Max cache usage: {} MB",
            config.cache.max_usage_bytes / (1024 * 1024)
        );
    } else {
        info!("Cache usage is unbounded");
    }
    info!("Cleansing enabled: {}", config.cache.cleansing_enabled);

    let coordinator = DestructionCoordinator::new(Some(Arc::new(OverwriteCleanser::default())));
    let cache = ContentCache::open(&config.cache, coordinator.clone()).await?;

    let backing = Arc::new(FileContentStore::new(config.backing_dir.clone()));
    backing.init().await?;

    let store = CachingContentStore::new(Arc::new(cache), backing.clone());
    let state: SharedState = Arc::new(ServerState::new(
        store,
        backing,
        coordinator,
        Arc::new(MemoryRecordStore::new()),
        config.cache.cleansing_enabled,
        config.cache.thresholds.target_pct,
    ));

    // Start HTTP server (blocking until shutdown)
    start_server(state, config.port)
        .await
        .map_err(|e| CacheServerError::Config(format!("Server error: {}", e)))?;

    Ok(())
}

fn load_config() -> ServerConfig {
    let defaults = ServerConfig::default();

    let port = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(defaults.port);

    let backing_dir = std::env::var("BACKING_DIR")
        .map(PathBuf::from)
        .unwrap_or(defaults.backing_dir);

    ServerConfig {
        port,
        backing_dir,
        cache: CacheConfig::from_env(),
    }
}
