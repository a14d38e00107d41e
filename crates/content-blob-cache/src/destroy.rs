//! Two-phase destruction of orphaned content, with optional cleansing

use crate::cleanse::ContentCleanser;
use crate::error::Result;
use crate::store::BackingStore;
use crate::types::ContentAddress;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Ephemeral destruction state for one unit of work.
///
/// Create one per transaction and hand it to [`DestructionCoordinator::commit`]
/// or [`DestructionCoordinator::rollback`]. Dropping it discards everything
/// registered, exactly like a rollback.
#[derive(Debug, Default)]
pub struct DestructionContext {
    pending_cleanse: HashSet<ContentAddress>,
    queue: Vec<ContentAddress>,
}

impl DestructionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending_cleanse(&self, address: &ContentAddress) -> bool {
        self.pending_cleanse.contains(address)
    }

    pub fn is_queued(&self, address: &ContentAddress) -> bool {
        self.queue.contains(address)
    }

    /// Addresses awaiting physical deletion, in registration order
    pub fn queued(&self) -> &[ContentAddress] {
        &self.queue
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// What [`DestructionCoordinator::delete_from_store`] did to one address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub removed: bool,
    pub cleansed: bool,
}

/// Summary of a committed unit of work
#[derive(Debug, Clone, Default, Serialize)]
pub struct DestructionReport {
    pub deleted: Vec<ContentAddress>,
    /// Already gone from the store at delete time.
    pub missing: Vec<ContentAddress>,
    pub cleansed: Vec<ContentAddress>,
    pub failed: Vec<DestructionFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DestructionFailure {
    pub address: ContentAddress,
    pub error: String,
}

/// Decides between cleanse-then-delete and plain delete for orphaned content
#[derive(Clone, Default)]
pub struct DestructionCoordinator {
    cleanser: Option<Arc<dyn ContentCleanser>>,
}

impl DestructionCoordinator {
    pub fn new(cleanser: Option<Arc<dyn ContentCleanser>>) -> Self {
        Self { cleanser }
    }

    pub fn has_cleanser(&self) -> bool {
        self.cleanser.is_some()
    }

    /// Queue `address` for deletion when the unit commits.
    pub fn register(&self, ctx: &mut DestructionContext, address: &ContentAddress, cleanse: bool) {
        if cleanse {
            ctx.pending_cleanse.insert(address.clone());
        }
        if !ctx.queue.contains(address) {
            ctx.queue.push(address.clone());
        }
        debug!(address = %address, cleanse, "Registered content for destruction");
    }

    /// Physically delete `address`, cleansing it first if it was registered for cleansing.
    ///
    /// Cleansing is best effort: any failure is logged and the delete still happens.
    pub async fn delete_from_store(
        &self,
        ctx: &mut DestructionContext,
        address: &ContentAddress,
        store: &dyn BackingStore,
    ) -> Result<DeleteOutcome> {
        let cleansed = if ctx.pending_cleanse.remove(address) {
            self.cleanse(address, store).await
        } else {
            false
        };

        let removed = store.delete(address).await?;
        if removed {
            debug!(address = %address, cleansed, "Deleted content");
        } else {
            debug!(address = %address, "Content already gone at delete time");
        }

        Ok(DeleteOutcome { removed, cleansed })
    }

    async fn cleanse(&self, address: &ContentAddress, store: &dyn BackingStore) -> bool {
        let Some(cleanser) = &self.cleanser else {
            warn!(address = %address, "Cleansing requested but no cleanser configured");
            return false;
        };

        let len = match store.read(address).await {
            Ok(Some(data)) => data.len(),
            Ok(None) => {
                warn!(address = %address, "Content to cleanse no longer exists");
                return false;
            }
            Err(e) => {
                warn!(address = %address, error = %e, "Failed to read content for cleansing");
                return false;
            }
        };

        match cleanser.cleanse(address, len, store).await {
            Ok(()) => {
                info!(address = %address, len, "Cleansed content before deletion");
                true
            }
            Err(e) => {
                warn!(address = %address, error = %e, "Failed to cleanse content, deleting anyway");
                false
            }
        }
    }

    /// Delete everything queued in `ctx`, in registration order.
    ///
    /// A failed delete is recorded and does not stop the rest of the unit.
    pub async fn commit(
        &self,
        mut ctx: DestructionContext,
        store: &dyn BackingStore,
    ) -> DestructionReport {
        let mut report = DestructionReport::default();
        let queue = std::mem::take(&mut ctx.queue);

        for address in queue {
            match self.delete_from_store(&mut ctx, &address, store).await {
                Ok(outcome) => {
                    if outcome.cleansed {
                        report.cleansed.push(address.clone());
                    }
                    if outcome.removed {
                        report.deleted.push(address);
                    } else {
                        report.missing.push(address);
                    }
                }
                Err(e) => {
                    error!(address = %address, error = %e, "Failed to delete content");
                    report.failed.push(DestructionFailure {
                        address,
                        error: e.to_string(),
                    });
                }
            }
        }

        if !report.deleted.is_empty() || !report.failed.is_empty() {
            info!(
                deleted = report.deleted.len(),
                cleansed = report.cleansed.len(),
                failed = report.failed.len(),
                "Committed content destruction"
            );
        }
        report
    }

    /// Discard the unit without deleting anything
    pub fn rollback(&self, ctx: DestructionContext) {
        if !ctx.is_empty() {
            debug!(discarded = ctx.queue.len(), "Rolled back content destruction");
        }
    }
}
