//! Quota-managed, file-based cache tier

use crate::config::CacheConfig;
use crate::destroy::DestructionCoordinator;
use crate::error::Result;
use crate::evictor::{EntryIndex, EvictionPolicy, Evictor, EvictorHandle};
use crate::quota::{build_quota_strategy, QuotaStrategy};
use crate::store::{BackingStore, FileContentStore};
use crate::types::{
    CacheEntry, CacheStats, ContentAddress, RetainDecision, WriteDecision, WriteOutcome,
};
use crate::usage::{UsageLedger, CACHE_USAGE_FILENAME};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A blob cache with on-disk files, in-memory access metadata and a quota
pub struct ContentCache {
    files: Arc<FileContentStore>,
    index: EntryIndex,
    ledger: Arc<UsageLedger>,
    quota: Arc<dyn QuotaStrategy>,
    evictor: EvictorHandle,
    usage_file: PathBuf,
    write_gate: Arc<RwLock<()>>,
    hits: AtomicU64,
    misses: AtomicU64,
    rejected: AtomicU64,
}

impl ContentCache {
    /// Open the cache under `config.cache_dir`, restoring the persisted usage hint.
    ///
    /// Must be called from within a tokio runtime; eviction passes are spawned onto it.
    pub async fn open(config: &CacheConfig, coordinator: DestructionCoordinator) -> Result<Self> {
        config.validate()?;

        let files = Arc::new(FileContentStore::new(config.cache_dir.clone()));
        files.init().await?;

        let ledger = Arc::new(UsageLedger::new(
            config.max_usage_bytes,
            config.max_file_size_bytes,
        ));
        let usage_file = config.cache_dir.join(CACHE_USAGE_FILENAME);
        ledger.load(&usage_file).await;

        let index: EntryIndex = Arc::new(RwLock::new(HashMap::new()));
        let evictor = Arc::new(Evictor::new(
            Arc::clone(&files),
            Arc::clone(&ledger),
            Arc::clone(&index),
            coordinator,
            EvictionPolicy {
                min_file_age: config.min_file_age,
                eviction_idle: config.eviction_idle,
            },
        ));
        let write_gate = evictor.write_gate();
        let evictor = EvictorHandle::new(evictor)?;
        let quota = build_quota_strategy(config, Arc::clone(&ledger), Arc::new(evictor.clone()))?;

        info!(
            cache_dir = ?config.cache_dir,
            max_usage_bytes = config.max_usage_bytes,
            usage_bytes = ledger.snapshot(),
            "Content cache opened"
        );

        Ok(Self {
            files,
            index,
            ledger,
            quota,
            evictor,
            usage_file,
            write_gate,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Get a cached blob
    pub async fn get(&self, address: &ContentAddress) -> Option<Vec<u8>> {
        match self.files.read(address).await {
            Ok(Some(data)) => {
                self.touch(address, data.len() as u64).await;
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(address = %address, "Cache hit");
                Some(data)
            }
            Ok(None) => {
                self.index.write().await.remove(address);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                warn!(address = %address, error = %e, "Failed to read cached file");
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Read a cached copy without counting a hit or refreshing its access time
    pub async fn peek(&self, address: &ContentAddress) -> Result<Option<Vec<u8>>> {
        self.files.read(address).await
    }

    async fn touch(&self, address: &ContentAddress, size: u64) {
        let now = Utc::now();
        let mut index = self.index.write().await;
        index
            .entry(address.clone())
            .and_modify(|entry| entry.last_accessed = now)
            .or_insert_with(|| CacheEntry {
                path: self.files.blob_path(address),
                size,
                created_at: now,
                last_accessed: now,
            });
    }

    /// Offer a blob to the cache; the quota decides whether it stays.
    pub async fn put(&self, address: &ContentAddress, data: &[u8]) -> Result<WriteOutcome> {
        let size = data.len() as u64;

        if self.quota.before_write(size) == WriteDecision::Deny {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(address = %address, size, "Cache write refused by quota");
            return Ok(WriteOutcome::Rejected);
        }

        // File and ledger change together with respect to eviction scans
        let _writing = self.write_gate.read().await;
        let previous = self.files.size(address).await.unwrap_or(None);
        self.files.write(address, data).await?;
        if let Some(previous) = previous {
            // The old copy was replaced in place
            self.ledger.add(-i64::try_from(previous).unwrap_or(i64::MAX));
        }

        match self.quota.after_write(size) {
            RetainDecision::Keep => {
                let now = Utc::now();
                self.index.write().await.insert(
                    address.clone(),
                    CacheEntry {
                        path: self.files.blob_path(address),
                        size,
                        created_at: now,
                        last_accessed: now,
                    },
                );
                debug!(address = %address, size, "Cached blob");
                Ok(WriteOutcome::Cached)
            }
            RetainDecision::Discard => {
                if let Err(e) = self.files.delete(address).await {
                    warn!(address = %address, error = %e, "Failed to discard rejected cache file");
                }
                self.index.write().await.remove(address);
                self.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(address = %address, size, "Discarded cache file after write");
                Ok(WriteOutcome::Rejected)
            }
        }
    }

    /// Remove a cached copy. Returns whether one existed.
    pub async fn remove(&self, address: &ContentAddress) -> Result<bool> {
        let _writing = self.write_gate.read().await;
        let size = self.files.size(address).await?;
        let removed = self.files.delete(address).await?;
        self.index.write().await.remove(address);

        if removed {
            if let Some(size) = size {
                self.ledger.add(-i64::try_from(size).unwrap_or(i64::MAX));
            }
            debug!(address = %address, "Removed cached blob");
        }
        Ok(removed)
    }

    /// Overwrite a cached copy in place, if there is one
    pub async fn overwrite_cached(&self, address: &ContentAddress, data: &[u8]) -> Result<bool> {
        if !self.files.exists(address).await {
            return Ok(false);
        }
        self.files.overwrite(address, data).await?;
        Ok(true)
    }

    pub async fn contains(&self, address: &ContentAddress) -> bool {
        self.files.exists(address).await
    }

    pub fn ledger(&self) -> &Arc<UsageLedger> {
        &self.ledger
    }

    pub fn evictor(&self) -> &EvictorHandle {
        &self.evictor
    }

    /// Get current cache statistics
    pub async fn stats(&self) -> CacheStats {
        let entries = self.index.read().await.len();
        CacheStats {
            entries,
            usage_bytes: self.ledger.snapshot(),
            max_usage_bytes: self.ledger.max_bytes(),
            usage_percent: self.ledger.usage_percent(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            rejected_writes: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Persist the usage hint for the next start
    pub async fn shutdown(&self) {
        self.ledger.save(&self.usage_file).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Thresholds;
    use crate::quota::EvictionTrigger;
    use crate::types::EvictionMode;
    use std::time::Duration;
    use tempfile::tempdir;

    fn config(dir: PathBuf, max_usage_bytes: u64, max_file_size_bytes: u64) -> CacheConfig {
        CacheConfig {
            cache_dir: dir,
            max_usage_bytes,
            max_file_size_bytes,
            thresholds: Thresholds::default(),
            normal_clean_min_interval: Duration::from_secs(3600),
            cleansing_enabled: false,
            min_file_age: Duration::ZERO,
            eviction_idle: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn test_cache_put_and_get() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::open(
            &config(dir.path().to_path_buf(), 1024 * 1024, 0),
            DestructionCoordinator::default(),
        )
        .await
        .unwrap();

        let address = ContentAddress::from("store://2024/05/01/hello.bin");
        assert_eq!(
            cache.put(&address, b"Hello, world!").await.unwrap(),
            WriteOutcome::Cached
        );
        assert_eq!(cache.get(&address).await.unwrap(), b"Hello, world!");

        let stats = cache.stats().await;
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.usage_bytes, 13);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_cache_miss() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::open(
            &config(dir.path().to_path_buf(), 1024, 0),
            DestructionCoordinator::default(),
        )
        .await
        .unwrap();

        assert!(cache.get(&ContentAddress::from("store://nope")).await.is_none());
        assert_eq!(cache.stats().await.misses, 1);
    }

    #[tokio::test]
    async fn test_oversized_write_rejected_and_uncounted() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::open(
            &config(dir.path().to_path_buf(), 1000, 100),
            DestructionCoordinator::default(),
        )
        .await
        .unwrap();

        let address = ContentAddress::from("store://big");
        assert_eq!(
            cache.put(&address, &[0u8; 150]).await.unwrap(),
            WriteOutcome::Rejected
        );
        assert_eq!(cache.ledger().snapshot(), 0);
        assert!(!cache.contains(&address).await);
        assert_eq!(cache.stats().await.rejected_writes, 1);
        assert_eq!(cache.evictor().passes_started(), 0);
    }

    #[tokio::test]
    async fn test_panic_threshold_rejects_and_evicts() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::open(
            &config(dir.path().to_path_buf(), 1000, 0),
            DestructionCoordinator::default(),
        )
        .await
        .unwrap();

        cache
            .put(&ContentAddress::from("store://a"), &[1u8; 500])
            .await
            .unwrap();
        cache.evictor().wait_idle().await;

        let outcome = cache
            .put(&ContentAddress::from("store://b"), &[2u8; 450])
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Rejected);

        cache.evictor().wait_idle().await;
        let report = cache.evictor().last_report().unwrap();
        assert_eq!(report.mode, EvictionMode::Aggressive);
        assert_eq!(report.reason, "panic");
        assert_eq!(report.target_bytes, Some(700));
        assert_eq!(cache.ledger().snapshot(), 0);
    }

    #[tokio::test]
    async fn test_replacing_entry_does_not_double_count() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::open(
            &config(dir.path().to_path_buf(), 1024 * 1024, 0),
            DestructionCoordinator::default(),
        )
        .await
        .unwrap();

        let address = ContentAddress::from("store://same");
        cache.put(&address, &[1u8; 100]).await.unwrap();
        cache.put(&address, &[2u8; 40]).await.unwrap();

        assert_eq!(cache.ledger().snapshot(), 40);
        assert_eq!(cache.get(&address).await.unwrap(), vec![2u8; 40]);
    }

    #[tokio::test]
    async fn test_remove_releases_usage() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::open(
            &config(dir.path().to_path_buf(), 1024 * 1024, 0),
            DestructionCoordinator::default(),
        )
        .await
        .unwrap();

        let address = ContentAddress::from("store://gone-soon");
        cache.put(&address, b"bytes").await.unwrap();
        assert!(cache.remove(&address).await.unwrap());
        assert!(!cache.remove(&address).await.unwrap());
        assert_eq!(cache.ledger().snapshot(), 0);
    }

    #[tokio::test]
    async fn test_usage_survives_restart() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path().to_path_buf(), 1024 * 1024, 0);

        let cache = ContentCache::open(&cfg, DestructionCoordinator::default())
            .await
            .unwrap();
        cache
            .put(&ContentAddress::from("store://persist"), &[9u8; 321])
            .await
            .unwrap();
        cache.shutdown().await;
        drop(cache);

        let reopened = ContentCache::open(&cfg, DestructionCoordinator::default())
            .await
            .unwrap();
        assert_eq!(reopened.ledger().snapshot(), 321);
    }

    fn bytes_on_disk(dir: &std::path::Path) -> u64 {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().and_then(|e| e.to_str()) == Some("bin"))
            .map(|entry| entry.metadata().unwrap().len())
            .sum()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_write_during_eviction_pass_stays_counted() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::open(
            &config(dir.path().to_path_buf(), 1024 * 1024, 0),
            DestructionCoordinator::default(),
        )
        .await
        .unwrap();

        for i in 0..400 {
            let address = ContentAddress::new(format!("store://small/{}", i));
            cache.put(&address, &[3u8; 10]).await.unwrap();
        }
        assert_eq!(cache.ledger().snapshot(), 4000);

        // Entries are fresh, so the pass scans everything and evicts nothing
        assert!(cache.evictor().trigger_normal("manual"));
        assert!(cache.evictor().is_running());
        cache
            .put(&ContentAddress::from("store://late"), &[4u8; 1000])
            .await
            .unwrap();
        cache.evictor().wait_idle().await;

        assert_eq!(cache.evictor().last_report().unwrap().deleted, 0);
        assert_eq!(bytes_on_disk(dir.path()), 5000);
        assert_eq!(cache.ledger().snapshot(), 5000);
    }

    #[tokio::test]
    async fn test_eviction_scan_corrects_drift_but_keeps_later_writes() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::open(
            &config(dir.path().to_path_buf(), 1024 * 1024, 0),
            DestructionCoordinator::default(),
        )
        .await
        .unwrap();

        cache
            .put(&ContentAddress::from("store://a"), &[1u8; 100])
            .await
            .unwrap();
        cache.ledger().add(900);

        cache.evictor().trigger_normal("manual");
        cache.evictor().wait_idle().await;
        assert_eq!(cache.ledger().snapshot(), 100);

        cache
            .put(&ContentAddress::from("store://b"), &[1u8; 50])
            .await
            .unwrap();
        assert_eq!(cache.ledger().snapshot(), 150);
    }

    #[tokio::test]
    async fn test_unlimited_cache_counts_without_evicting() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::open(
            &config(dir.path().to_path_buf(), 0, 0),
            DestructionCoordinator::default(),
        )
        .await
        .unwrap();

        for i in 0..5 {
            let address = ContentAddress::new(format!("store://{}", i));
            assert_eq!(
                cache.put(&address, &[0u8; 1000]).await.unwrap(),
                WriteOutcome::Cached
            );
        }
        assert_eq!(cache.ledger().snapshot(), 5000);
        assert_eq!(cache.evictor().passes_started(), 0);
    }
}
