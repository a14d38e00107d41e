//! Cache configuration parsed from environment variables

use crate::error::{CacheError, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Usage thresholds, each a percentage of the maximum cache usage
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    /// Writes are refused and an aggressive eviction is started at or above this.
    pub panic_pct: f64,
    /// A rate-limited normal eviction is started at or above this.
    pub clean_pct: f64,
    /// Sizes the reduction requested from aggressive evictions.
    pub target_pct: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            panic_pct: 90.0,
            clean_pct: 80.0,
            target_pct: 70.0,
        }
    }
}

impl Thresholds {
    /// Checks `target_pct < clean_pct < panic_pct <= 100`
    pub fn validate(&self) -> Result<()> {
        let Thresholds {
            panic_pct,
            clean_pct,
            target_pct,
        } = *self;

        if !(panic_pct.is_finite() && clean_pct.is_finite() && target_pct.is_finite()) {
            return Err(CacheError::Config(format!(
                "thresholds must be finite, got target={} clean={} panic={}",
                target_pct, clean_pct, panic_pct
            )));
        }
        if !(0.0..=100.0).contains(&panic_pct) || panic_pct == 0.0 {
            return Err(CacheError::Config(format!(
                "panic threshold must be in (0, 100], got {}",
                panic_pct
            )));
        }
        if target_pct < 0.0 || target_pct >= clean_pct || clean_pct >= panic_pct {
            return Err(CacheError::Config(format!(
                "thresholds must satisfy target < clean < panic, got target={} clean={} panic={}",
                target_pct, clean_pct, panic_pct
            )));
        }
        Ok(())
    }
}

/// Configuration for the cache tier
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    /// Zero disables the quota entirely.
    pub max_usage_bytes: u64,
    /// Zero means no per-file limit.
    pub max_file_size_bytes: u64,
    pub thresholds: Thresholds,
    pub normal_clean_min_interval: Duration,
    pub cleansing_enabled: bool,
    /// Normal passes never touch files younger than this.
    pub min_file_age: Duration,
    /// Tracked entries idle for this long are reclaimed by normal passes.
    pub eviction_idle: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache/content"),
            max_usage_bytes: 4 * 1024 * 1024 * 1024, // 4GB
            max_file_size_bytes: 0,
            thresholds: Thresholds::default(),
            normal_clean_min_interval: Duration::from_secs(60),
            cleansing_enabled: false,
            min_file_age: Duration::from_secs(30),
            eviction_idle: Duration::from_secs(60 * 60), // 1 hour
        }
    }
}

impl CacheConfig {
    /// Parse configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Parse configuration from an arbitrary variable lookup.
    ///
    /// Unparseable values fall back to their defaults.
    pub fn from_vars<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let parse_u64 = |name: &str, default: u64| {
            lookup(name)
                .and_then(|s| s.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };
        let parse_pct = |name: &str, default: f64| {
            lookup(name)
                .and_then(|s| s.trim().parse::<f64>().ok())
                .filter(|pct| pct.is_finite())
                .unwrap_or(default)
        };
        let parse_secs = |name: &str, default: Duration| {
            lookup(name)
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        let cache_dir = lookup("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);

        let thresholds = Thresholds {
            panic_pct: parse_pct("PANIC_THRESHOLD_PCT", defaults.thresholds.panic_pct),
            clean_pct: parse_pct("CLEAN_THRESHOLD_PCT", defaults.thresholds.clean_pct),
            target_pct: parse_pct("TARGET_USAGE_PCT", defaults.thresholds.target_pct),
        };

        let cleansing_enabled = lookup("CLEANSING_ENABLED")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(defaults.cleansing_enabled);

        Self {
            cache_dir,
            max_usage_bytes: parse_u64("MAX_USAGE_BYTES", defaults.max_usage_bytes),
            max_file_size_bytes: parse_u64("MAX_FILE_SIZE_BYTES", defaults.max_file_size_bytes),
            thresholds,
            normal_clean_min_interval: parse_secs(
                "NORMAL_CLEAN_MIN_INTERVAL_SECS",
                defaults.normal_clean_min_interval,
            ),
            cleansing_enabled,
            min_file_age: parse_secs("MIN_FILE_AGE_SECS", defaults.min_file_age),
            eviction_idle: parse_secs("EVICTION_IDLE_SECS", defaults.eviction_idle),
        }
    }

    /// Whether a bounded quota applies
    pub fn is_bounded(&self) -> bool {
        self.max_usage_bytes > 0
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_bounded() {
            self.thresholds.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.cache_dir, PathBuf::from("./cache/content"));
        assert_eq!(config.thresholds.panic_pct, 90.0);
        assert_eq!(config.thresholds.clean_pct, 80.0);
        assert_eq!(config.thresholds.target_pct, 70.0);
        assert_eq!(config.max_file_size_bytes, 0);
        assert!(!config.cleansing_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_vars_overrides() {
        let config = CacheConfig::from_vars(vars(&[
            ("CACHE_DIR", "/tmp/cc"),
            ("MAX_USAGE_BYTES", "1000"),
            ("PANIC_THRESHOLD_PCT", "95"),
            ("CLEAN_THRESHOLD_PCT", "85"),
            ("TARGET_USAGE_PCT", "60"),
            ("NORMAL_CLEAN_MIN_INTERVAL_SECS", "5"),
            ("MAX_FILE_SIZE_BYTES", "100"),
            ("CLEANSING_ENABLED", "true"),
        ]));

        assert_eq!(config.cache_dir, PathBuf::from("/tmp/cc"));
        assert_eq!(config.max_usage_bytes, 1000);
        assert_eq!(config.max_file_size_bytes, 100);
        assert_eq!(config.thresholds.panic_pct, 95.0);
        assert_eq!(config.thresholds.clean_pct, 85.0);
        assert_eq!(config.thresholds.target_pct, 60.0);
        assert_eq!(config.normal_clean_min_interval, Duration::from_secs(5));
        assert!(config.cleansing_enabled);
    }

    #[test]
    fn test_from_vars_malformed_values_fall_back() {
        let config = CacheConfig::from_vars(vars(&[
            ("MAX_USAGE_BYTES", "lots"),
            ("CLEAN_THRESHOLD_PCT", "eighty"),
            ("CLEANSING_ENABLED", "maybe"),
        ]));
        let defaults = CacheConfig::default();

        assert_eq!(config.max_usage_bytes, defaults.max_usage_bytes);
        assert_eq!(config.thresholds.clean_pct, 80.0);
        assert!(!config.cleansing_enabled);
    }

    #[test]
    fn test_threshold_ordering_is_enforced() {
        let bad = Thresholds {
            panic_pct: 80.0,
            clean_pct: 85.0,
            target_pct: 70.0,
        };
        assert!(bad.validate().is_err());

        let over = Thresholds {
            panic_pct: 120.0,
            clean_pct: 80.0,
            target_pct: 70.0,
        };
        assert!(over.validate().is_err());

        let equal = Thresholds {
            panic_pct: 90.0,
            clean_pct: 70.0,
            target_pct: 70.0,
        };
        assert!(equal.validate().is_err());
    }

    #[test]
    fn test_unbounded_config_skips_threshold_checks() {
        let config = CacheConfig {
            max_usage_bytes: 0,
            thresholds: Thresholds {
                panic_pct: 10.0,
                clean_pct: 50.0,
                target_pct: 90.0,
            },
            ..CacheConfig::default()
        };
        assert!(!config.is_bounded());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_non_finite_thresholds_rejected() {
        for (panic_pct, clean_pct, target_pct) in [
            (90.0, f64::NAN, 70.0),
            (90.0, 80.0, f64::NAN),
            (f64::NAN, 80.0, 70.0),
            (90.0, f64::INFINITY, 70.0),
            (90.0, 80.0, f64::NEG_INFINITY),
        ] {
            let thresholds = Thresholds {
                panic_pct,
                clean_pct,
                target_pct,
            };
            assert!(thresholds.validate().is_err(), "{:?}", thresholds);
        }
    }

    #[test]
    fn test_non_finite_env_values_fall_back_to_defaults() {
        let config = CacheConfig::from_vars(vars(&[
            ("MAX_USAGE_BYTES", "1000"),
            ("CLEAN_THRESHOLD_PCT", "nan"),
            ("TARGET_USAGE_PCT", "NaN"),
            ("PANIC_THRESHOLD_PCT", "inf"),
        ]));

        assert_eq!(config.thresholds, Thresholds::default());
        assert!(config.validate().is_ok());
    }
}
