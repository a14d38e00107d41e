//! Cache types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;

/// Opaque identifier of a blob in a content store.
///
/// Addresses are not owned by any single record: deduplicated content can be
/// referenced by many owners at once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentAddress(String);

impl ContentAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable file-system key for this address (hex SHA-256)
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentAddress {
    fn from(address: &str) -> Self {
        Self(address.to_string())
    }
}

impl From<String> for ContentAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}

impl AsRef<str> for ContentAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Metadata for a cached blob entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

/// Statistics about the cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub usage_bytes: u64,
    pub max_usage_bytes: u64,
    pub usage_percent: f64,
    pub hits: u64,
    pub misses: u64,
    pub rejected_writes: u64,
}

/// Verdict of the quota check made before any bytes are written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDecision {
    Allow,
    Deny,
}

/// Verdict of the quota check made after a cache file was written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainDecision {
    Keep,
    Discard,
}

/// What happened to a write offered to the cache tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Cached,
    /// The quota policy refused the write; nothing is counted against usage.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionMode {
    Normal,
    Aggressive,
}

/// Result summary from an eviction pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionReport {
    pub reason: String,
    pub mode: EvictionMode,
    pub target_bytes: Option<u64>,
    pub scanned: usize,
    pub deleted: usize,
    pub freed_bytes: u64,
    pub failures: usize,
    pub usage_before: u64,
    pub usage_after: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_generation() {
        let key1 = ContentAddress::from("store://2024/05/01/abc.bin").cache_key();
        let key2 = ContentAddress::from("store://2024/05/01/abc.bin").cache_key();
        let key3 = ContentAddress::from("store://2024/05/01/xyz.bin").cache_key();

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);

        // Keys are hex strings (64 chars for SHA256)
        assert_eq!(key1.len(), 64);
        assert!(key1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_content_address_serializes_as_plain_string() {
        let address = ContentAddress::new("store://a/b.bin");
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(json, "\"store://a/b.bin\"");

        let back: ContentAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, address);
        assert_eq!(back.to_string(), "store://a/b.bin");
    }

    #[test]
    fn test_cache_stats_default() {
        let stats = CacheStats::default();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.usage_bytes, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.rejected_writes, 0);
    }

    #[test]
    fn test_eviction_report_serialization() {
        let now = Utc::now();
        let report = EvictionReport {
            reason: "limit reached".to_string(),
            mode: EvictionMode::Aggressive,
            target_bytes: Some(700),
            scanned: 4,
            deleted: 3,
            freed_bytes: 720,
            failures: 0,
            usage_before: 1000,
            usage_after: 280,
            started_at: now,
            finished_at: now,
        };

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"aggressive\""));
        assert!(json.contains("limit reached"));
        assert!(json.contains("720"));
    }
}
