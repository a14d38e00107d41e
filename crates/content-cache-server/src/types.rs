//! Request, response and configuration types for the content cache server

use content_blob_cache::{
    AttributeValue, CacheConfig, CacheStats, ContentAddress, DestroyOutcome, DestructionReport,
    EvictionMode, EvictionReport, RecordId, WriteOutcome,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Configuration for the server process
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Directory of the durable store the cache sits in front of
    pub backing_dir: PathBuf,
    pub cache: CacheConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3002,
            backing_dir: PathBuf::from("./data/content"),
            cache: CacheConfig::default(),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache: CacheStats,
    pub eviction_running: bool,
    pub last_eviction: Option<EvictionReport>,
}

/// Response to a content upload
#[derive(Debug, Serialize)]
pub struct PutResponse {
    pub address: ContentAddress,
    pub size: u64,
    pub cache: WriteOutcome,
}

#[derive(Debug, Deserialize)]
pub struct DeleteParams {
    /// Overwrite the bytes before deleting them; the server default applies when absent.
    pub cleanse: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    /// Another record still references the address, so nothing was deleted.
    pub shared: bool,
    pub report: DestructionReport,
}

/// Body of a record upsert
#[derive(Debug, Deserialize)]
pub struct RecordBody {
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
    #[serde(default)]
    pub derived: Vec<RecordId>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RecordDeleteParams {
    /// Also destroy the record's derived artifacts.
    #[serde(default)]
    pub cascade_derived: bool,
}

#[derive(Debug, Serialize)]
pub struct RecordDeleteResponse {
    pub outcome: DestroyOutcome,
    pub report: DestructionReport,
}

/// Manual eviction request
#[derive(Debug, Deserialize)]
pub struct EvictRequest {
    pub mode: EvictionMode,
    /// Bytes to free in aggressive mode; defaults to the amount above the target usage.
    pub target_bytes: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct EvictResponse {
    pub mode: EvictionMode,
    pub started: bool,
}
