//! Per-write quota policies for the cache tier

use crate::config::{CacheConfig, Thresholds};
use crate::error::Result;
use crate::types::{RetainDecision, WriteDecision};
use crate::usage::{percent_of, UsageLedger};
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Something that can start eviction passes without blocking the caller
pub trait EvictionTrigger: Send + Sync {
    /// Request an opportunistic pass. Returns whether a pass was started.
    fn trigger_normal(&self, reason: &str) -> bool;

    /// Request a pass that frees at least `target_bytes`. Returns whether a
    /// pass was started immediately (it may instead run after the current one).
    fn trigger_aggressive(&self, reason: &str, target_bytes: u64) -> bool;
}

/// Decides whether writes may enter the cache and when to reclaim space
pub trait QuotaStrategy: Send + Sync {
    fn before_write(&self, size: u64) -> WriteDecision;

    fn after_write(&self, size: u64) -> RetainDecision;
}

/// No quota: every write is accepted and nothing triggers eviction
#[derive(Debug, Default)]
pub struct UnlimitedQuota {
    ledger: Option<Arc<UsageLedger>>,
}

impl UnlimitedQuota {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep counting usage into `ledger` without ever enforcing a limit
    pub fn with_ledger(ledger: Arc<UsageLedger>) -> Self {
        Self {
            ledger: Some(ledger),
        }
    }
}

impl QuotaStrategy for UnlimitedQuota {
    fn before_write(&self, _size: u64) -> WriteDecision {
        WriteDecision::Allow
    }

    fn after_write(&self, size: u64) -> RetainDecision {
        if let Some(ledger) = &self.ledger {
            ledger.add(i64::try_from(size).unwrap_or(i64::MAX));
        }
        RetainDecision::Keep
    }
}

/// Minimum spacing between normal eviction triggers
#[derive(Debug)]
pub struct RateLimit {
    min_interval: Duration,
    /// Unix millis of the last permitted run; zero means never.
    last_run: AtomicI64,
}

impl RateLimit {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_run: AtomicI64::new(0),
        }
    }

    /// Claim the slot at the current time
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Utc::now().timestamp_millis())
    }

    /// Claim the slot at `now_millis` if `min_interval` has elapsed since the last claim.
    ///
    /// Two racing callers may both read the old timestamp; only the one whose
    /// exchange lands wins.
    pub fn try_acquire_at(&self, now_millis: i64) -> bool {
        let last = self.last_run.load(Ordering::Acquire);
        let interval = i64::try_from(self.min_interval.as_millis()).unwrap_or(i64::MAX);
        if last != 0 && now_millis.saturating_sub(last) < interval {
            return false;
        }
        self.last_run
            .compare_exchange(last, now_millis, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Threshold-driven quota over a shared usage ledger
pub struct BoundedQuota {
    thresholds: Thresholds,
    ledger: Arc<UsageLedger>,
    rate_limit: RateLimit,
    evictor: Arc<dyn EvictionTrigger>,
}

impl BoundedQuota {
    pub fn new(
        thresholds: Thresholds,
        ledger: Arc<UsageLedger>,
        min_interval: Duration,
        evictor: Arc<dyn EvictionTrigger>,
    ) -> Result<Self> {
        thresholds.validate()?;
        Ok(Self {
            thresholds,
            ledger,
            rate_limit: RateLimit::new(min_interval),
            evictor,
        })
    }

    /// Bytes an aggressive pass is asked to free
    pub fn aggressive_target_bytes(&self) -> u64 {
        (self.ledger.max_bytes() as f64 * self.thresholds.target_pct / 100.0) as u64
    }

    fn signal_aggressive(&self, reason: &str) {
        let target_bytes = self.aggressive_target_bytes();
        info!(
            reason,
            target_bytes,
            usage_bytes = self.ledger.snapshot(),
            "Requesting aggressive cache eviction"
        );
        self.evictor.trigger_aggressive(reason, target_bytes);
    }

    fn signal_normal(&self, reason: &str) {
        if !self.rate_limit.try_acquire() {
            debug!(reason, "Normal cache eviction rate limited, skipping");
            return;
        }
        debug!(
            reason,
            usage_bytes = self.ledger.snapshot(),
            "Requesting normal cache eviction"
        );
        self.evictor.trigger_normal(reason);
    }
}

impl QuotaStrategy for BoundedQuota {
    fn before_write(&self, size: u64) -> WriteDecision {
        if self.ledger.is_oversized(size) {
            debug!(
                size,
                max_file_bytes = self.ledger.max_file_bytes(),
                "Refusing oversized cache write"
            );
            return WriteDecision::Deny;
        }

        let projected = self.ledger.snapshot().saturating_add(size);
        if percent_of(projected, self.ledger.max_bytes()) >= self.thresholds.panic_pct {
            warn!(
                size,
                projected,
                panic_pct = self.thresholds.panic_pct,
                "Cache usage at panic threshold, refusing write"
            );
            self.signal_aggressive("panic");
            return WriteDecision::Deny;
        }

        WriteDecision::Allow
    }

    fn after_write(&self, size: u64) -> RetainDecision {
        if self.ledger.is_oversized(size) {
            return RetainDecision::Discard;
        }

        let usage = self.ledger.add(i64::try_from(size).unwrap_or(i64::MAX));

        if usage >= self.ledger.max_bytes() {
            self.signal_aggressive("limit reached");
        } else if percent_of(usage, self.ledger.max_bytes()) >= self.thresholds.clean_pct {
            self.signal_normal("clean threshold");
        }

        RetainDecision::Keep
    }
}

/// Select the quota strategy the configuration asks for
pub fn build_quota_strategy(
    config: &CacheConfig,
    ledger: Arc<UsageLedger>,
    evictor: Arc<dyn EvictionTrigger>,
) -> Result<Arc<dyn QuotaStrategy>> {
    if !config.is_bounded() {
        info!("Cache quota disabled");
        return Ok(Arc::new(UnlimitedQuota::with_ledger(ledger)));
    }

    Ok(Arc::new(BoundedQuota::new(
        config.thresholds,
        ledger,
        config.normal_clean_min_interval,
        evictor,
    )?))
}
