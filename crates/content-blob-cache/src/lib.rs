//! Quota-managed content blob cache with deduplication-aware secure destruction
//!
//! Caches blobs on disk under a byte quota tracked by a lock-free usage ledger.
//! Crossing the clean threshold schedules a rate-limited background eviction;
//! reaching the limit schedules an aggressive one, and writes that would pass
//! the panic threshold are refused outright.
//!
//! Content that loses its last owning record is registered for destruction in
//! a per-unit [`DestructionContext`], optionally cleansed by overwriting, and
//! deleted when the unit commits. Content still referenced elsewhere is never
//! touched.

pub mod cache;
pub mod caching;
pub mod cleanse;
pub mod config;
pub mod destroy;
pub mod destroyer;
pub mod error;
pub mod evictor;
pub mod quota;
pub mod store;
pub mod types;
pub mod usage;

pub use cache::ContentCache;
pub use caching::CachingContentStore;
pub use cleanse::{ContentCleanser, OverwriteCleanser};
pub use config::{CacheConfig, Thresholds};
pub use destroy::{
    DeleteOutcome, DestructionContext, DestructionCoordinator, DestructionFailure,
    DestructionReport,
};
pub use destroyer::{
    AttributeValue, BehaviourSuppression, ContentDestroyer, DestroyOptions, DestroyOutcome,
    MemoryRecordStore, OwningRecord, RecordId, RecordStore, ReferenceGuard,
};
pub use error::{CacheError, Result};
pub use evictor::{EvictionPolicy, Evictor, EvictorHandle};
pub use quota::{
    build_quota_strategy, BoundedQuota, EvictionTrigger, QuotaStrategy, RateLimit, UnlimitedQuota,
};
pub use store::{BackingStore, FileContentStore, MemoryContentStore, StoredEntry};
pub use types::{
    CacheEntry, CacheStats, ContentAddress, EvictionMode, EvictionReport, RetainDecision,
    WriteDecision, WriteOutcome,
};
pub use usage::{UsageLedger, CACHE_USAGE_FILENAME};
