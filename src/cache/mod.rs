//! Query cache for realtime-cache
//!
//! Holds the session's read cache of server entities, keyed by structured
//! query keys. Entries are created by completed fetches, patched in place by
//! the patch engine, and marked stale by invalidation. Each invalidated key is
//! broadcast so the fetch layer can re-run the query.

pub mod keys;
pub mod seed;
pub mod store;

pub use keys::{CacheLocation, QueryKey};
pub use seed::{load_seed_file, prime, SeedEntry};
pub use store::{spawn_cleanup_task, CacheEntry, CacheStats, CacheStore, QueryCache};

use std::time::Duration;

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries in the cache
    pub max_entries: usize,
    /// TTL applied to fetched query results
    pub ttl: Duration,
    /// Cleanup interval
    pub cleanup_interval: Duration,
    /// Capacity of the refetch broadcast channel
    pub refetch_buffer: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 5_000,
            ttl: Duration::from_secs(900),             // 15 minutes
            cleanup_interval: Duration::from_secs(60), // Run cleanup every minute
            refetch_buffer: 1024,
        }
    }
}

impl CacheConfig {
    /// Create config from environment or defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let max_entries = std::env::var("CACHE_MAX_ENTRIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_entries);

        let ttl_secs = std::env::var("CACHE_TTL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.ttl.as_secs());

        let cleanup_secs = std::env::var("CACHE_CLEANUP_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.cleanup_interval.as_secs());

        Self {
            max_entries,
            ttl: Duration::from_secs(ttl_secs),
            cleanup_interval: Duration::from_secs(cleanup_secs),
            refetch_buffer: defaults.refetch_buffer,
        }
    }
}
