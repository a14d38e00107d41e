//! Asynchronous reclamation of cache-tier disk space

use crate::destroy::{DestructionContext, DestructionCoordinator};
use crate::error::{CacheError, Result};
use crate::quota::EvictionTrigger;
use crate::store::{FileContentStore, StoredEntry};
use crate::types::{CacheEntry, ContentAddress, EvictionMode, EvictionReport};
use crate::usage::UsageLedger;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// In-memory access metadata for cached entries, shared with the cache tier
pub type EntryIndex = Arc<RwLock<HashMap<ContentAddress, CacheEntry>>>;

/// Ages that decide what a normal pass may reclaim
#[derive(Debug, Clone, Copy)]
pub struct EvictionPolicy {
    pub min_file_age: Duration,
    pub eviction_idle: Duration,
}

/// Performs eviction passes over the cache directory
pub struct Evictor {
    files: Arc<FileContentStore>,
    ledger: Arc<UsageLedger>,
    index: EntryIndex,
    coordinator: DestructionCoordinator,
    policy: EvictionPolicy,
    /// Held shared by cache writers and exclusively while a pass scans.
    write_gate: Arc<RwLock<()>>,
}

struct Candidate {
    entry: StoredEntry,
    last_used: DateTime<Utc>,
}

impl Evictor {
    pub fn new(
        files: Arc<FileContentStore>,
        ledger: Arc<UsageLedger>,
        index: EntryIndex,
        coordinator: DestructionCoordinator,
        policy: EvictionPolicy,
    ) -> Self {
        Self {
            files,
            ledger,
            index,
            coordinator,
            policy,
            write_gate: Arc::new(RwLock::new(())),
        }
    }

    /// Gate that cache-tier mutations hold so the scan sees a stable directory
    pub fn write_gate(&self) -> Arc<RwLock<()>> {
        Arc::clone(&self.write_gate)
    }

    /// Opportunistic pass: reclaims orphaned and idle entries.
    pub async fn run(&self, reason: &str) -> EvictionReport {
        self.pass(reason, EvictionMode::Normal, None).await
    }

    /// Reclaim least-recently-used entries until `target_bytes` are freed.
    pub async fn run_aggressive(&self, reason: &str, target_bytes: u64) -> EvictionReport {
        self.pass(reason, EvictionMode::Aggressive, Some(target_bytes))
            .await
    }

    async fn pass(
        &self,
        reason: &str,
        mode: EvictionMode,
        target_bytes: Option<u64>,
    ) -> EvictionReport {
        let started_at = Utc::now();
        let usage_before = self.ledger.snapshot();
        let mut report = EvictionReport {
            reason: reason.to_string(),
            mode,
            target_bytes,
            scanned: 0,
            deleted: 0,
            freed_bytes: 0,
            failures: 0,
            usage_before,
            usage_after: usage_before,
            started_at,
            finished_at: started_at,
        };

        // No cache write is mid-flight while the gate is held exclusively
        let scan_guard = self.write_gate.write().await;
        match self.files.sweep_temp_files(self.policy.min_file_age).await {
            Ok(0) => {}
            Ok(bytes) => info!(reason, bytes, "Removed abandoned temp files from cache"),
            Err(e) => warn!(reason, error = %e, "Failed to sweep cache temp files"),
        }

        let candidates = match self.candidates().await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(reason, error = %e, "Failed to scan cache directory for eviction");
                report.failures += 1;
                report.finished_at = Utc::now();
                return report;
            }
        };
        report.scanned = candidates.len();

        // Correct drift against what is on disk now, before this pass's own
        // decrements. Writes landing after the scan keep their ledger adds.
        let scanned_bytes: u64 = candidates.iter().map(|c| c.entry.size).sum();
        self.ledger.reconcile(scanned_bytes);
        drop(scan_guard);

        let now = Utc::now();
        let mut ctx = DestructionContext::new();

        for candidate in candidates {
            let size = candidate.entry.size;
            let reclaim = match mode {
                EvictionMode::Aggressive => {
                    report.freed_bytes < target_bytes.unwrap_or(u64::MAX)
                }
                EvictionMode::Normal => self.is_reclaimable(&candidate, now),
            };

            if !reclaim {
                continue;
            }

            match self.reclaim(&mut ctx, &candidate.entry).await {
                Ok(true) => {
                    report.deleted += 1;
                    report.freed_bytes += size;
                    self.ledger.add(-i64::try_from(size).unwrap_or(i64::MAX));
                }
                Ok(false) => {
                    // Raced with another delete; nothing left on disk
                }
                Err(e) => {
                    warn!(key = %candidate.entry.key, error = %e, "Failed to evict cache entry");
                    report.failures += 1;
                }
            }
        }

        report.usage_after = self.ledger.snapshot();
        report.finished_at = Utc::now();

        info!(
            reason,
            mode = ?mode,
            target_bytes,
            scanned = report.scanned,
            deleted = report.deleted,
            freed_bytes = report.freed_bytes,
            failures = report.failures,
            usage_after = report.usage_after,
            "Cache eviction pass complete"
        );
        report
    }

    /// Every blob file, orphans first, then least recently used first
    async fn candidates(&self) -> Result<Vec<Candidate>> {
        let entries = self.files.list_entries().await?;
        let index = self.index.read().await;

        let mut candidates: Vec<Candidate> = entries
            .into_iter()
            .map(|entry| {
                let last_used = entry
                    .address
                    .as_ref()
                    .and_then(|address| index.get(address))
                    .map(|cached| cached.last_accessed)
                    .unwrap_or(entry.modified);
                Candidate { entry, last_used }
            })
            .collect();
        drop(index);

        candidates.sort_by(|a, b| {
            a.entry
                .address
                .is_some()
                .cmp(&b.entry.address.is_some())
                .then(a.last_used.cmp(&b.last_used))
        });
        Ok(candidates)
    }

    fn is_reclaimable(&self, candidate: &Candidate, now: DateTime<Utc>) -> bool {
        let age = (now - candidate.entry.modified).to_std().unwrap_or_default();
        if age < self.policy.min_file_age {
            return false;
        }
        if candidate.entry.address.is_none() {
            return true;
        }
        let idle = (now - candidate.last_used).to_std().unwrap_or_default();
        idle >= self.policy.eviction_idle
    }

    async fn reclaim(&self, ctx: &mut DestructionContext, entry: &StoredEntry) -> Result<bool> {
        match &entry.address {
            Some(address) => {
                let outcome = self
                    .coordinator
                    .delete_from_store(ctx, address, self.files.as_ref())
                    .await?;
                self.index.write().await.remove(address);
                debug!(address = %address, size = entry.size, "Evicted cache entry");
                Ok(outcome.removed)
            }
            None => {
                let removed = self.files.delete_key(&entry.key).await?;
                debug!(key = %entry.key, size = entry.size, "Evicted orphaned cache file");
                Ok(removed)
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Pass {
    Normal { reason: String },
    Aggressive { reason: String, target_bytes: u64 },
}

#[derive(Default)]
struct PassState {
    in_flight: AtomicBool,
    pending_aggressive: Mutex<Option<Pass>>,
    passes_started: AtomicU64,
    last_report: Mutex<Option<EvictionReport>>,
}

impl PassState {
    fn try_claim(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Remember an aggressive request, keeping the larger target
    fn park(&self, reason: &str, target_bytes: u64) {
        let mut pending = self
            .pending_aggressive
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let keep_existing = matches!(
            &*pending,
            Some(Pass::Aggressive { target_bytes: existing, .. }) if *existing >= target_bytes
        );
        if !keep_existing {
            *pending = Some(Pass::Aggressive {
                reason: reason.to_string(),
                target_bytes,
            });
        }
    }

    fn take_parked(&self) -> Option<Pass> {
        self.pending_aggressive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Clears the in-flight flag if a pass task unwinds
struct InFlightGuard {
    state: Arc<PassState>,
    armed: bool,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.armed {
            self.state.in_flight.store(false, Ordering::SeqCst);
        }
    }
}

/// Fire-and-forget front end to an [`Evictor`].
///
/// At most one pass runs at a time. Normal requests arriving while a pass is
/// in flight are dropped; aggressive requests are parked and run as soon as
/// the current pass finishes.
#[derive(Clone)]
pub struct EvictorHandle {
    evictor: Arc<Evictor>,
    state: Arc<PassState>,
    runtime: Handle,
}

impl EvictorHandle {
    /// Bind to the current tokio runtime
    pub fn new(evictor: Arc<Evictor>) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            CacheError::Config(format!("eviction needs a tokio runtime: {}", e))
        })?;
        Ok(Self::with_runtime(evictor, runtime))
    }

    pub fn with_runtime(evictor: Arc<Evictor>, runtime: Handle) -> Self {
        Self {
            evictor,
            state: Arc::new(PassState::default()),
            runtime,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Number of passes that have started since creation
    pub fn passes_started(&self) -> u64 {
        self.state.passes_started.load(Ordering::SeqCst)
    }

    pub fn last_report(&self) -> Option<EvictionReport> {
        self.state
            .last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until no pass is in flight
    pub async fn wait_idle(&self) {
        while self.is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn spawn(&self, first: Pass) {
        let evictor = Arc::clone(&self.evictor);
        let state = Arc::clone(&self.state);
        self.runtime.spawn(run_passes(evictor, state, first));
    }
}

async fn run_passes(evictor: Arc<Evictor>, state: Arc<PassState>, first: Pass) {
    let mut guard = InFlightGuard {
        state: Arc::clone(&state),
        armed: true,
    };
    let mut next = Some(first);

    while let Some(pass) = next.take() {
        state.passes_started.fetch_add(1, Ordering::SeqCst);
        let report = match pass {
            Pass::Normal { reason } => evictor.run(&reason).await,
            Pass::Aggressive {
                reason,
                target_bytes,
            } => evictor.run_aggressive(&reason, target_bytes).await,
        };
        *state
            .last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(report);

        next = state.take_parked();
        if next.is_some() {
            continue;
        }

        state.in_flight.store(false, Ordering::SeqCst);
        guard.armed = false;

        // A request may have been parked between the take and the release
        if let Some(parked) = state.take_parked() {
            if state.try_claim() {
                guard.armed = true;
                next = Some(parked);
            } else if let Pass::Aggressive {
                reason,
                target_bytes,
            } = parked
            {
                // Whoever claimed the flag runs it when their pass ends
                state.park(&reason, target_bytes);
            }
        }
    }
}

impl EvictionTrigger for EvictorHandle {
    fn trigger_normal(&self, reason: &str) -> bool {
        if !self.state.try_claim() {
            debug!(reason, "Eviction already in progress, skipping");
            return false;
        }
        self.spawn(Pass::Normal {
            reason: reason.to_string(),
        });
        true
    }

    fn trigger_aggressive(&self, reason: &str, target_bytes: u64) -> bool {
        if self.state.try_claim() {
            self.spawn(Pass::Aggressive {
                reason: reason.to_string(),
                target_bytes,
            });
            return true;
        }

        info!(
            reason,
            target_bytes, "Eviction in progress, aggressive pass queued behind it"
        );
        self.state.park(reason, target_bytes);

        // The running pass may have finished before the request was parked
        if self.state.try_claim() {
            match self.state.take_parked() {
                Some(pass) => {
                    self.spawn(pass);
                    return true;
                }
                None => self.state.in_flight.store(false, Ordering::SeqCst),
            }
        }
        false
    }
}
