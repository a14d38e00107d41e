//! Read-through cache tier in front of a durable backing store

use crate::cache::ContentCache;
use crate::error::Result;
use crate::store::BackingStore;
use crate::types::ContentAddress;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Serves reads from the cache tier, falling back to the backing store.
///
/// Only [`CachingContentStore::read_through`] populates the cache. The
/// [`BackingStore`] methods are what destruction uses, so they never pull
/// content into the cache tier. Deletes go to the backing store and also drop
/// the cached copy, so usage accounting follows destruction of orphaned content.
pub struct CachingContentStore {
    cache: Arc<ContentCache>,
    backing: Arc<dyn BackingStore>,
}

impl CachingContentStore {
    pub fn new(cache: Arc<ContentCache>, backing: Arc<dyn BackingStore>) -> Self {
        Self { cache, backing }
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    /// Read a blob, reporting whether it was served from the cache
    pub async fn read_through(&self, address: &ContentAddress) -> Result<Option<(Vec<u8>, bool)>> {
        if let Some(data) = self.cache.get(address).await {
            return Ok(Some((data, true)));
        }

        let Some(data) = self.backing.read(address).await? else {
            return Ok(None);
        };

        // Continue even if caching fails
        if let Err(e) = self.cache.put(address, &data).await {
            warn!(address = %address, error = %e, "Failed to cache blob");
        }
        Ok(Some((data, false)))
    }
}

#[async_trait]
impl BackingStore for CachingContentStore {
    async fn read(&self, address: &ContentAddress) -> Result<Option<Vec<u8>>> {
        match self.cache.peek(address).await {
            Ok(Some(data)) => return Ok(Some(data)),
            Ok(None) => {}
            Err(e) => warn!(address = %address, error = %e, "Failed to read cached copy"),
        }
        self.backing.read(address).await
    }

    async fn delete(&self, address: &ContentAddress) -> Result<bool> {
        let removed = self.backing.delete(address).await?;
        if let Err(e) = self.cache.remove(address).await {
            warn!(address = %address, error = %e, "Failed to drop cached copy of deleted content");
        }
        Ok(removed)
    }

    async fn exists(&self, address: &ContentAddress) -> bool {
        self.cache.contains(address).await || self.backing.exists(address).await
    }

    async fn overwrite(&self, address: &ContentAddress, data: &[u8]) -> Result<()> {
        self.backing.overwrite(address, data).await?;
        // A cached copy left intact would still hold the original bytes
        self.cache.overwrite_cached(address, data).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanse::OverwriteCleanser;
    use crate::config::CacheConfig;
    use crate::destroy::{DestructionContext, DestructionCoordinator};
    use crate::store::MemoryContentStore;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn caching_store(dir: &std::path::Path) -> (CachingContentStore, Arc<MemoryContentStore>) {
        let config = CacheConfig {
            cache_dir: dir.to_path_buf(),
            max_usage_bytes: 1024 * 1024,
            min_file_age: Duration::ZERO,
            ..CacheConfig::default()
        };
        let cache = ContentCache::open(&config, DestructionCoordinator::default())
            .await
            .unwrap();
        let backing = Arc::new(MemoryContentStore::new());
        (
            CachingContentStore::new(Arc::new(cache), backing.clone()),
            backing,
        )
    }

    #[tokio::test]
    async fn test_read_through_populates_cache() {
        let dir = tempdir().unwrap();
        let (store, backing) = caching_store(dir.path()).await;
        let address = ContentAddress::from("store://doc");
        backing.put(address.clone(), b"durable".to_vec()).await;

        let (data, from_cache) = store.read_through(&address).await.unwrap().unwrap();
        assert_eq!(data, b"durable");
        assert!(!from_cache);

        let (_, from_cache) = store.read_through(&address).await.unwrap().unwrap();
        assert!(from_cache);
        assert_eq!(store.cache().ledger().snapshot(), 7);
    }

    #[tokio::test]
    async fn test_store_read_does_not_populate_cache() {
        let dir = tempdir().unwrap();
        let (store, backing) = caching_store(dir.path()).await;
        let address = ContentAddress::from("store://doc");
        backing.put(address.clone(), b"durable".to_vec()).await;

        assert_eq!(store.read(&address).await.unwrap().unwrap(), b"durable");
        assert!(!store.cache().contains(&address).await);
        assert_eq!(store.cache().ledger().snapshot(), 0);
        assert_eq!(store.cache().stats().await.misses, 0);
    }

    #[tokio::test]
    async fn test_read_missing_everywhere() {
        let dir = tempdir().unwrap();
        let (store, _) = caching_store(dir.path()).await;
        assert!(store
            .read(&ContentAddress::from("store://absent"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_delete_drops_cached_copy_and_usage() {
        let dir = tempdir().unwrap();
        let (store, backing) = caching_store(dir.path()).await;
        let address = ContentAddress::from("store://doc");
        backing.put(address.clone(), b"durable".to_vec()).await;
        store.read_through(&address).await.unwrap();

        assert!(store.delete(&address).await.unwrap());
        assert!(!store.exists(&address).await);
        assert!(!store.cache().contains(&address).await);
        assert_eq!(store.cache().ledger().snapshot(), 0);
    }

    #[tokio::test]
    async fn test_overwrite_reaches_cached_and_durable_copies() {
        let dir = tempdir().unwrap();
        let (store, backing) = caching_store(dir.path()).await;
        let address = ContentAddress::from("store://secret");
        backing.put(address.clone(), b"secret".to_vec()).await;
        store.read_through(&address).await.unwrap();

        store.overwrite(&address, &[0u8; 6]).await.unwrap();

        assert_eq!(backing.read(&address).await.unwrap().unwrap(), vec![0u8; 6]);
        assert_eq!(store.cache().get(&address).await.unwrap(), vec![0u8; 6]);
    }

    #[tokio::test]
    async fn test_cleansing_destroy_through_cache_tier() {
        let dir = tempdir().unwrap();
        let (store, backing) = caching_store(dir.path()).await;
        let address = ContentAddress::from("store://secret");
        backing.put(address.clone(), b"secret".to_vec()).await;
        store.read_through(&address).await.unwrap();

        let coordinator =
            DestructionCoordinator::new(Some(Arc::new(OverwriteCleanser::default())));
        let mut ctx = DestructionContext::new();
        coordinator.register(&mut ctx, &address, true);
        let report = coordinator.commit(ctx, &store).await;

        assert_eq!(report.cleansed, vec![address.clone()]);
        assert_eq!(report.deleted, vec![address.clone()]);
        assert!(!backing.exists(&address).await);
        assert!(!store.cache().contains(&address).await);
        assert_eq!(store.cache().ledger().snapshot(), 0);
    }

    #[tokio::test]
    async fn test_cleansing_uncached_content_leaves_cache_untouched() {
        let dir = tempdir().unwrap();
        let config = CacheConfig {
            cache_dir: dir.path().to_path_buf(),
            max_usage_bytes: 1000,
            min_file_age: Duration::ZERO,
            ..CacheConfig::default()
        };
        let cache = Arc::new(
            ContentCache::open(&config, DestructionCoordinator::default())
                .await
                .unwrap(),
        );
        cache
            .put(&ContentAddress::from("store://warm"), &[1u8; 700])
            .await
            .unwrap();

        let backing = Arc::new(MemoryContentStore::new());
        let secret = ContentAddress::from("store://secret");
        backing.put(secret.clone(), vec![9u8; 150]).await;
        let store = CachingContentStore::new(Arc::clone(&cache), backing.clone());

        let coordinator =
            DestructionCoordinator::new(Some(Arc::new(OverwriteCleanser::default())));
        let mut ctx = DestructionContext::new();
        coordinator.register(&mut ctx, &secret, true);
        let report = coordinator.commit(ctx, &store).await;

        assert_eq!(report.cleansed, vec![secret.clone()]);
        assert_eq!(report.deleted, vec![secret.clone()]);
        assert!(!cache.contains(&secret).await);
        assert_eq!(cache.ledger().snapshot(), 700);
        assert_eq!(cache.stats().await.misses, 0);
        assert_eq!(cache.evictor().passes_started(), 0);
    }
}
