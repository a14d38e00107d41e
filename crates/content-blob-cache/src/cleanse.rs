//! Secure overwrite of blob bytes before physical deletion

use crate::error::Result;
use crate::store::BackingStore;
use crate::types::ContentAddress;
use async_trait::async_trait;
use tracing::debug;

/// Overwrites a blob so its original bytes cannot be recovered from the store
#[async_trait]
pub trait ContentCleanser: Send + Sync {
    /// Cleanse the `len` bytes stored at `address`.
    async fn cleanse(
        &self,
        address: &ContentAddress,
        len: usize,
        store: &dyn BackingStore,
    ) -> Result<()>;
}

/// Fixed-pattern multi-pass overwrite
#[derive(Debug, Clone)]
pub struct OverwriteCleanser {
    patterns: Vec<u8>,
}

impl Default for OverwriteCleanser {
    fn default() -> Self {
        Self {
            patterns: vec![0x00, 0xFF, 0x55],
        }
    }
}

impl OverwriteCleanser {
    /// One overwrite pass per byte in `patterns`; an empty list falls back to a single zero pass.
    pub fn with_patterns(patterns: Vec<u8>) -> Self {
        if patterns.is_empty() {
            return Self {
                patterns: vec![0x00],
            };
        }
        Self { patterns }
    }

    pub fn passes(&self) -> usize {
        self.patterns.len()
    }
}

#[async_trait]
impl ContentCleanser for OverwriteCleanser {
    async fn cleanse(
        &self,
        address: &ContentAddress,
        len: usize,
        store: &dyn BackingStore,
    ) -> Result<()> {
        for (pass, pattern) in self.patterns.iter().enumerate() {
            store.overwrite(address, &vec![*pattern; len]).await?;
            debug!(address = %address, pass, pattern, len, "Cleanse pass complete");
        }
        Ok(())
    }
}
