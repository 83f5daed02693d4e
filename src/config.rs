//! # Cache Configuration
//!
//! Tuning knobs for the secondary store's eviction step and the background
//! flush worker. Every field has a documented default; embedders either build
//! a [`CacheConfig`] directly or call [`CacheConfig::from_env`] to override
//! the defaults with `ATTRCACHE_*` environment variables.
//!
//! | Variable | Field | Unit |
//! |----------|-------|------|
//! | `ATTRCACHE_CACHE_LIFESPAN_SECS` | `cache_lifespan` | seconds |
//! | `ATTRCACHE_CACHE_MAX_FILE_COUNT` | `cache_max_file_count` | rows |
//! | `ATTRCACHE_FLUSH_INTERVAL_MS` | `flush_interval` | milliseconds |
//! | `ATTRCACHE_FLUSH_WRITE_THRESHOLD` | `flush_write_threshold` | writes |
//! | `ATTRCACHE_LOAD_QUIESCENCE_MS` | `load_quiescence` | milliseconds |
//! | `ATTRCACHE_EVICTION_LOCK_TIMEOUT_MS` | `eviction_lock_timeout` | milliseconds |

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

// =============================================================================
// Defaults
// =============================================================================

/// Default maximum age of a cached record since its last access (30 days).
pub const DEFAULT_CACHE_LIFESPAN_SECS: u64 = 30 * 24 * 60 * 60;

/// Default soft cap on the number of cached files.
pub const DEFAULT_CACHE_MAX_FILE_COUNT: usize = 100_000;

/// Default time between background flushes.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 4_000;

/// Default number of writes that wakes the flush worker early.
pub const DEFAULT_FLUSH_WRITE_THRESHOLD: usize = 1_000;

/// A flush is skipped if an entity was loaded within this window.
pub const DEFAULT_LOAD_QUIESCENCE_MS: u64 = 500;

/// Upper bound on how long eviction waits for readers to finish.
pub const DEFAULT_EVICTION_LOCK_TIMEOUT_MS: u64 = 50;

const ENV_PREFIX: &str = "ATTRCACHE_";

// =============================================================================
// CacheConfig
// =============================================================================

/// Configuration for the secondary store and the flush worker.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Records not accessed for longer than this are evicted.
    pub cache_lifespan: Duration,

    /// Soft cap on cached files; the least recently accessed surplus is
    /// evicted after each flush.
    pub cache_max_file_count: usize,

    /// Maximum time between two background flushes.
    pub flush_interval: Duration,

    /// The flush worker is signalled every this many writes.
    pub flush_write_threshold: usize,

    /// A scheduled flush is skipped if a load happened within this window.
    pub load_quiescence: Duration,

    /// Bounded wait for the eviction gate; eviction is skipped on timeout.
    pub eviction_lock_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_lifespan: Duration::from_secs(DEFAULT_CACHE_LIFESPAN_SECS),
            cache_max_file_count: DEFAULT_CACHE_MAX_FILE_COUNT,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            flush_write_threshold: DEFAULT_FLUSH_WRITE_THRESHOLD,
            load_quiescence: Duration::from_millis(DEFAULT_LOAD_QUIESCENCE_MS),
            eviction_lock_timeout: Duration::from_millis(DEFAULT_EVICTION_LOCK_TIMEOUT_MS),
        }
    }
}

impl CacheConfig {
    /// Builds a configuration from defaults overridden by `ATTRCACHE_*`
    /// environment variables.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a variable is set but cannot be parsed, or if
    /// the resulting configuration fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads variables through
    /// `lookup`, so callers can feed values from another source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(secs) = parse_var::<u64>(&lookup, "CACHE_LIFESPAN_SECS")? {
            config.cache_lifespan = Duration::from_secs(secs);
        }
        if let Some(count) = parse_var::<usize>(&lookup, "CACHE_MAX_FILE_COUNT")? {
            config.cache_max_file_count = count;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "FLUSH_INTERVAL_MS")? {
            config.flush_interval = Duration::from_millis(ms);
        }
        if let Some(count) = parse_var::<usize>(&lookup, "FLUSH_WRITE_THRESHOLD")? {
            config.flush_write_threshold = count;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "LOAD_QUIESCENCE_MS")? {
            config.load_quiescence = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "EVICTION_LOCK_TIMEOUT_MS")? {
            config.eviction_lock_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks that the configuration can drive the flush worker.
    pub fn validate(&self) -> Result<()> {
        if self.flush_write_threshold == 0 {
            return Err(Error::Config(
                "flush_write_threshold must be greater than zero".to_string(),
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(Error::Config(
                "flush_interval must be greater than zero".to_string(),
            ));
        }
        if self.cache_max_file_count == 0 {
            return Err(Error::Config(
                "cache_max_file_count must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    suffix: &str,
) -> Result<Option<T>> {
    let name = format!("{ENV_PREFIX}{suffix}");
    match lookup(&name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name} has invalid value '{raw}'"))),
    }
}
