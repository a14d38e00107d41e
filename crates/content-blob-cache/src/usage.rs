//! Lock-free accounting of cache-tier disk usage

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tracing::{debug, error, info, warn};

/// Name of the file, under the cache root, holding the usage restart hint
pub const CACHE_USAGE_FILENAME: &str = "cache-usage";

/// Running total of bytes held by the cache tier.
///
/// The total only approximates what is on disk; eviction passes reconcile it
/// against a directory scan.
#[derive(Debug)]
pub struct UsageLedger {
    current_bytes: AtomicU64,
    max_bytes: u64,
    max_file_bytes: u64,
}

impl UsageLedger {
    pub fn new(max_bytes: u64, max_file_bytes: u64) -> Self {
        Self {
            current_bytes: AtomicU64::new(0),
            max_bytes,
            max_file_bytes,
        }
    }

    /// Atomically apply `delta` and return the new total.
    ///
    /// Subtracting more than is recorded clamps the total at zero and logs an
    /// error: some caller released bytes it never accounted for.
    pub fn add(&self, delta: i64) -> u64 {
        let mut current = self.current_bytes.load(Ordering::Acquire);
        loop {
            let next = if delta >= 0 {
                current.saturating_add(delta.unsigned_abs())
            } else {
                current.saturating_sub(delta.unsigned_abs())
            };

            match self.current_bytes.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if delta < 0 && delta.unsigned_abs() > current {
                        error!(
                            delta,
                            previous = current,
                            "Cache usage over-subtracted, clamped to zero"
                        );
                    }
                    return next;
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn snapshot(&self) -> u64 {
        self.current_bytes.load(Ordering::Acquire)
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_bytes
    }

    /// Whether a single write of `size` bytes exceeds the per-file limit
    pub fn is_oversized(&self, size: u64) -> bool {
        self.max_file_bytes > 0 && size > self.max_file_bytes
    }

    /// Current usage as a percentage of `max_bytes` (0 when unbounded)
    pub fn usage_percent(&self) -> f64 {
        percent_of(self.snapshot(), self.max_bytes)
    }

    /// Move the total to `actual_bytes` with a single atomic delta.
    pub fn reconcile(&self, actual_bytes: u64) -> u64 {
        let recorded = self.snapshot();
        let delta = signed_delta(actual_bytes, recorded);
        if delta != 0 {
            debug!(recorded, actual_bytes, delta, "Reconciling cache usage");
        }
        self.add(delta)
    }

    /// Load the persisted usage hint.
    ///
    /// Absent or corrupt files leave the in-memory total (zero on startup) as the estimate.
    pub async fn load(&self, path: &Path) -> u64 {
        let loaded = match fs::read_to_string(path).await {
            Ok(text) => match text.trim().parse::<u64>() {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(path = ?path, error = %e, "Corrupt cache usage file, keeping estimate");
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = ?path, "No persisted cache usage, keeping estimate");
                None
            }
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to read cache usage file, keeping estimate");
                None
            }
        };

        match loaded {
            Some(bytes) => {
                info!(path = ?path, bytes, "Loaded persisted cache usage");
                self.reconcile(bytes)
            }
            None => self.snapshot(),
        }
    }

    /// Persist the current total; failures are logged and otherwise ignored.
    pub async fn save(&self, path: &Path) {
        let bytes = self.snapshot();
        match fs::write(path, bytes.to_string()).await {
            Ok(()) => info!(path = ?path, bytes, "Saved cache usage"),
            Err(e) => warn!(path = ?path, error = %e, "Failed to save cache usage"),
        }
    }
}

pub(crate) fn percent_of(bytes: u64, max_bytes: u64) -> f64 {
    if max_bytes == 0 {
        return 0.0;
    }
    bytes as f64 * 100.0 / max_bytes as f64
}

fn signed_delta(to: u64, from: u64) -> i64 {
    if to >= from {
        i64::try_from(to - from).unwrap_or(i64::MAX)
    } else {
        i64::try_from(from - to).map(|d| -d).unwrap_or(i64::MIN)
    }
}
