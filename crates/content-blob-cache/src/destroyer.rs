//! Destruction of an owning record's content, cascading into derived artifacts

use crate::destroy::{DestructionContext, DestructionCoordinator};
use crate::error::Result;
use crate::types::ContentAddress;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Identifier of a record that owns content
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Value of one record attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    /// A reference to a blob
    Content(ContentAddress),
    Value(serde_json::Value),
}

/// A record with attributes, some of which may reference blobs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OwningRecord {
    pub id: RecordId,
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Derived artifacts (renditions, thumbnails) generated from this record.
    #[serde(default)]
    pub derived: Vec<RecordId>,
}

impl OwningRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: RecordId::new(id),
            ..Self::default()
        }
    }

    pub fn with_content(mut self, name: &str, address: impl Into<ContentAddress>) -> Self {
        self.attributes
            .insert(name.to_string(), AttributeValue::Content(address.into()));
        self
    }

    pub fn with_value(mut self, name: &str, value: serde_json::Value) -> Self {
        self.attributes
            .insert(name.to_string(), AttributeValue::Value(value));
        self
    }

    pub fn with_derived(mut self, child: impl Into<String>) -> Self {
        self.derived.push(RecordId::new(child));
        self
    }

    /// Blob-valued attributes as `(name, address)` pairs
    pub fn content_attributes(&self) -> impl Iterator<Item = (&str, &ContentAddress)> {
        self.attributes.iter().filter_map(|(name, value)| match value {
            AttributeValue::Content(address) => Some((name.as_str(), address)),
            AttributeValue::Value(_) => None,
        })
    }
}

/// Answers whether content is still shared by another owner.
///
/// Implementations must read from the same transactional view as the caller:
/// a false "unreferenced" answer deletes shared content irrecoverably.
#[async_trait]
pub trait ReferenceGuard: Send + Sync {
    async fn has_other_reference(&self, address: &ContentAddress, owner: &RecordId)
        -> Result<bool>;
}

/// The record storage the destroyer mutates
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_record(&self, id: &RecordId) -> Result<Option<OwningRecord>>;

    async fn remove_attribute(&self, id: &RecordId, name: &str) -> Result<()>;

    async fn delete_record(&self, id: &RecordId) -> Result<()>;

    /// Stop secondary side effects (policies, hooks) from firing for `id`.
    fn disable_behaviours(&self, id: &RecordId);

    fn enable_behaviours(&self, id: &RecordId);
}

/// Suppresses record behaviours until dropped
pub struct BehaviourSuppression<'a> {
    records: &'a dyn RecordStore,
    id: &'a RecordId,
}

impl<'a> BehaviourSuppression<'a> {
    pub fn new(records: &'a dyn RecordStore, id: &'a RecordId) -> Self {
        records.disable_behaviours(id);
        Self { records, id }
    }
}

impl Drop for BehaviourSuppression<'_> {
    fn drop(&mut self) {
        self.records.enable_behaviours(self.id);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DestroyOptions {
    /// Remove the blob attributes from the record as they are processed.
    pub clear_attributes: bool,
    /// Also destroy derived artifacts and delete their records.
    pub cascade_derived: bool,
}

/// What a destroy call did
#[derive(Debug, Clone, Default, Serialize)]
pub struct DestroyOutcome {
    pub registered: Vec<ContentAddress>,
    /// Still referenced elsewhere; left alone.
    pub shared: Vec<ContentAddress>,
    pub derived_removed: Vec<RecordId>,
}

/// Registers a record's orphaned content for destruction
pub struct ContentDestroyer {
    guard: Arc<dyn ReferenceGuard>,
    records: Arc<dyn RecordStore>,
    coordinator: DestructionCoordinator,
    cleansing_enabled: bool,
}

impl ContentDestroyer {
    pub fn new(
        guard: Arc<dyn ReferenceGuard>,
        records: Arc<dyn RecordStore>,
        coordinator: DestructionCoordinator,
        cleansing_enabled: bool,
    ) -> Self {
        Self {
            guard,
            records,
            coordinator,
            cleansing_enabled,
        }
    }

    /// Register every unshared blob of record `id` in `ctx`.
    ///
    /// Nothing is physically deleted until the unit of work commits. A failed
    /// reference check aborts the call; the caller should roll the unit back.
    pub async fn destroy_content(
        &self,
        ctx: &mut DestructionContext,
        id: &RecordId,
        options: DestroyOptions,
    ) -> Result<DestroyOutcome> {
        let mut outcome = DestroyOutcome::default();

        let Some(record) = self.records.get_record(id).await? else {
            debug!(record = %id, "Record already gone, nothing to destroy");
            return Ok(outcome);
        };

        self.destroy_attributes(ctx, &record, options.clear_attributes, &mut outcome)
            .await?;

        if options.cascade_derived {
            for child_id in &record.derived {
                let Some(child) = self.records.get_record(child_id).await? else {
                    debug!(record = %id, derived = %child_id, "Derived record already gone");
                    continue;
                };

                self.destroy_attributes(ctx, &child, options.clear_attributes, &mut outcome)
                    .await?;
                self.records.delete_record(child_id).await?;
                outcome.derived_removed.push(child_id.clone());
            }
        }

        if !outcome.registered.is_empty() || !outcome.shared.is_empty() {
            info!(
                record = %id,
                registered = outcome.registered.len(),
                shared = outcome.shared.len(),
                derived_removed = outcome.derived_removed.len(),
                "Registered record content for destruction"
            );
        }
        Ok(outcome)
    }

    async fn destroy_attributes(
        &self,
        ctx: &mut DestructionContext,
        record: &OwningRecord,
        clear: bool,
        outcome: &mut DestroyOutcome,
    ) -> Result<()> {
        for (name, address) in record.content_attributes() {
            if self.guard.has_other_reference(address, &record.id).await? {
                debug!(record = %record.id, address = %address, "Content still shared, skipping");
                outcome.shared.push(address.clone());
            } else {
                self.coordinator
                    .register(ctx, address, self.cleansing_enabled);
                outcome.registered.push(address.clone());
            }

            if clear {
                let _suppressed = BehaviourSuppression::new(self.records.as_ref(), &record.id);
                self.records.remove_attribute(&record.id, name).await?;
            }
        }
        Ok(())
    }
}

/// In-memory record store that also answers reference checks across its records
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<RecordId, OwningRecord>>,
    suppressed: Mutex<HashSet<RecordId>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: OwningRecord) {
        self.records.write().await.insert(record.id.clone(), record);
    }

    pub async fn get(&self, id: &RecordId) -> Option<OwningRecord> {
        self.records.read().await.get(id).cloned()
    }

    pub fn is_suppressed(&self, id: &RecordId) -> bool {
        self.suppressed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get_record(&self, id: &RecordId) -> Result<Option<OwningRecord>> {
        Ok(self.get(id).await)
    }

    async fn remove_attribute(&self, id: &RecordId, name: &str) -> Result<()> {
        if let Some(record) = self.records.write().await.get_mut(id) {
            record.attributes.remove(name);
        }
        Ok(())
    }

    async fn delete_record(&self, id: &RecordId) -> Result<()> {
        self.records.write().await.remove(id);
        Ok(())
    }

    fn disable_behaviours(&self, id: &RecordId) {
        self.suppressed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone());
    }

    fn enable_behaviours(&self, id: &RecordId) {
        self.suppressed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

#[async_trait]
impl ReferenceGuard for MemoryRecordStore {
    async fn has_other_reference(
        &self,
        address: &ContentAddress,
        owner: &RecordId,
    ) -> Result<bool> {
        let records = self.records.read().await;
        Ok(records.values().any(|record| {
            &record.id != owner
                && record
                    .content_attributes()
                    .any(|(_, referenced)| referenced == address)
        }))
    }
}
