//! Content store contract and the stores shipped with the cache

use crate::error::{CacheError, Result};
use crate::types::ContentAddress;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const BLOB_EXTENSION: &str = "bin";
const ADDRESS_EXTENSION: &str = "url";
const TEMP_MARKER: &str = ".tmp-";

/// Minimal reader/deleter contract a content store offers the cache
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Read the blob at `address`; `None` when it does not exist.
    async fn read(&self, address: &ContentAddress) -> Result<Option<Vec<u8>>>;

    /// Physically delete the blob. Returns whether anything was removed.
    async fn delete(&self, address: &ContentAddress) -> Result<bool>;

    async fn exists(&self, address: &ContentAddress) -> bool;

    /// Overwrite the blob's bytes in place. Only used for cleansing.
    async fn overwrite(&self, address: &ContentAddress, _data: &[u8]) -> Result<()> {
        Err(CacheError::Unsupported(format!(
            "store cannot overwrite {} in place",
            address
        )))
    }
}

/// A blob file found while scanning a [`FileContentStore`]
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub key: String,
    /// `None` when the address sidecar is missing or unreadable.
    pub address: Option<ContentAddress>,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Directory-backed store.
///
/// Each blob lives in `<sha256>.bin` next to a `<sha256>.url` sidecar holding
/// its content address, so a directory scan can map files back to addresses.
pub struct FileContentStore {
    root: PathBuf,
    temp_counter: AtomicU64,
}

impl FileContentStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            temp_counter: AtomicU64::new(0),
        }
    }

    /// Ensure the store directory exists
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        info!(root = ?self.root, "Content store initialized");
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_path(&self, address: &ContentAddress) -> PathBuf {
        self.key_path(&address.cache_key(), BLOB_EXTENSION)
    }

    fn key_path(&self, key: &str, extension: &str) -> PathBuf {
        self.root.join(format!("{}.{}", key, extension))
    }

    /// Write a blob, replacing any previous content. Returns the bytes written.
    pub async fn write(&self, address: &ContentAddress, data: &[u8]) -> Result<u64> {
        let key = address.cache_key();
        let temp_path = self.root.join(format!(
            "{}{}{}",
            key,
            TEMP_MARKER,
            self.temp_counter.fetch_add(1, Ordering::Relaxed)
        ));

        // Sidecar first, so a visible blob file always maps back to its address
        fs::write(self.key_path(&key, ADDRESS_EXTENSION), address.as_str()).await?;
        fs::write(&temp_path, data).await?;
        if let Err(e) = fs::rename(&temp_path, self.key_path(&key, BLOB_EXTENSION)).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        debug!(address = %address, size = data.len(), "Stored blob");
        Ok(data.len() as u64)
    }

    /// Size of the blob on disk, if present
    pub async fn size(&self, address: &ContentAddress) -> Result<Option<u64>> {
        match fs::metadata(self.blob_path(address)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a blob file and its sidecar by key. Returns whether the blob existed.
    pub async fn delete_key(&self, key: &str) -> Result<bool> {
        let removed = match fs::remove_file(self.key_path(key, BLOB_EXTENSION)).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = fs::remove_file(self.key_path(key, ADDRESS_EXTENSION)).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(key, error = %e, "Failed to remove address sidecar");
            }
        }

        Ok(removed)
    }

    /// Remove temp files left by writes that never reached their rename.
    ///
    /// Files younger than `min_age` may belong to a write in progress and are kept.
    /// Returns the number of bytes removed.
    pub async fn sweep_temp_files(&self, min_age: Duration) -> Result<u64> {
        let mut removed_bytes = 0;
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        while let Some(dir_entry) = dir.next_entry().await? {
            let is_temp = dir_entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.contains(TEMP_MARKER));
            if !is_temp {
                continue;
            }

            let Ok(meta) = dir_entry.metadata().await else {
                continue;
            };
            let age = meta
                .modified()
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .unwrap_or_default();
            if age < min_age {
                continue;
            }

            match fs::remove_file(dir_entry.path()).await {
                Ok(()) => {
                    removed_bytes += meta.len();
                    debug!(path = ?dir_entry.path(), "Removed stale temp file");
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = ?dir_entry.path(), error = %e, "Failed to remove stale temp file"),
            }
        }

        Ok(removed_bytes)
    }

    /// Enumerate blob files; unreadable entries are logged and skipped.
    pub async fn list_entries(&self) -> Result<Vec<StoredEntry>> {
        let mut entries = Vec::new();
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };

        while let Some(dir_entry) = dir.next_entry().await? {
            let path = dir_entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXTENSION) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
            else {
                continue;
            };

            let meta = match dir_entry.metadata().await {
                Ok(meta) => meta,
                Err(e) => {
                    // Entries can race with deletion; only log unexpected errors.
                    if e.kind() != ErrorKind::NotFound {
                        debug!(path = ?path, error = %e, "Failed to stat blob file");
                    }
                    continue;
                }
            };

            let modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            let address = match fs::read_to_string(self.key_path(&key, ADDRESS_EXTENSION)).await {
                Ok(text) if !text.is_empty() => Some(ContentAddress::new(text)),
                Ok(_) => None,
                Err(e) => {
                    if e.kind() != ErrorKind::NotFound {
                        debug!(key = %key, error = %e, "Failed to read address sidecar");
                    }
                    None
                }
            };

            entries.push(StoredEntry {
                key,
                address,
                size: meta.len(),
                modified,
            });
        }

        Ok(entries)
    }
}

#[async_trait]
impl BackingStore for FileContentStore {
    async fn read(&self, address: &ContentAddress) -> Result<Option<Vec<u8>>> {
        match fs::read(self.blob_path(address)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, address: &ContentAddress) -> Result<bool> {
        self.delete_key(&address.cache_key()).await
    }

    async fn exists(&self, address: &ContentAddress) -> bool {
        fs::try_exists(self.blob_path(address))
            .await
            .unwrap_or(false)
    }

    async fn overwrite(&self, address: &ContentAddress, data: &[u8]) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(self.blob_path(address))
            .await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        Ok(())
    }
}

/// In-memory store, for embedding and tests
#[derive(Default)]
pub struct MemoryContentStore {
    blobs: RwLock<HashMap<ContentAddress, Vec<u8>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, address: ContentAddress, data: Vec<u8>) {
        self.blobs.write().await.insert(address, data);
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BackingStore for MemoryContentStore {
    async fn read(&self, address: &ContentAddress) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(address).cloned())
    }

    async fn delete(&self, address: &ContentAddress) -> Result<bool> {
        Ok(self.blobs.write().await.remove(address).is_some())
    }

    async fn exists(&self, address: &ContentAddress) -> bool {
        self.blobs.read().await.contains_key(address)
    }

    async fn overwrite(&self, address: &ContentAddress, data: &[u8]) -> Result<()> {
        let mut blobs = self.blobs.write().await;
        match blobs.get_mut(address) {
            Some(blob) => {
                let len = data.len().min(blob.len());
                blob[..len].copy_from_slice(&data[..len]);
                Ok(())
            }
            None => Err(CacheError::Store(format!("{} does not exist", address))),
        }
    }
}
