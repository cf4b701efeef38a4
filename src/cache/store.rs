//! Cache store implementation
//!
//! In-memory query cache with TTL, ETags, stale marking and refetch
//! broadcast on invalidation.

use super::keys::{CacheLocation, QueryKey};
use super::CacheConfig;
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Storage seam used by the patch engine and the invalidator.
///
/// Keys are structural: two equal [`QueryKey`]s address the same entry.
pub trait CacheStore: Send + Sync {
    /// Current data for a live (fresh, not stale) entry
    fn get(&self, key: &QueryKey) -> Option<JsonValue>;

    /// Replace the data of an entry
    fn set(&self, key: &QueryKey, value: JsonValue);

    /// Drop an entry entirely
    fn remove(&self, key: &QueryKey) -> Option<JsonValue>;

    /// Mark every entry inside `location` for refetch, returning how many matched
    fn invalidate(&self, location: &CacheLocation) -> usize;
}

/// A cached query result with metadata
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub data: JsonValue,
    /// ETag (SHA256 of the serialized data)
    pub etag: String,
    /// When the data was last fetched from the server
    pub fetched_at: Instant,
    pub expires_at: Instant,
    /// Set by invalidation, cleared by the next completed fetch
    pub stale: bool,
}

impl CacheEntry {
    /// Create a new cache entry
    pub fn new(data: JsonValue, ttl: Duration) -> Self {
        let etag = Self::compute_etag(&data);
        let now = Instant::now();
        Self {
            data,
            etag,
            fetched_at: now,
            expires_at: now + ttl,
            stale: false,
        }
    }

    /// Compute ETag from data using SHA256
    fn compute_etag(data: &JsonValue) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data.to_string().as_bytes());
        let hash = hasher.finalize();
        format!("\"{}\"", hex::encode(&hash[..16]))
    }

    /// Check if this entry has expired
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Whether reads may be served from this entry
    pub fn is_live(&self) -> bool {
        !self.stale && !self.is_expired()
    }

    fn replace_data(&mut self, data: JsonValue) {
        self.etag = Self::compute_etag(&data);
        self.data = data;
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub stale: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

impl CacheStats {
    /// Calculate hit rate as percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// In-memory query cache
pub struct QueryCache {
    entries: DashMap<QueryKey, CacheEntry>,
    config: CacheConfig,
    /// Keys that need a refetch after invalidation
    refetch_tx: broadcast::Sender<QueryKey>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

impl QueryCache {
    /// Create a new query cache with configuration
    pub fn new(config: CacheConfig) -> Self {
        let (refetch_tx, _) = broadcast::channel(config.refetch_buffer.max(1));
        Self {
            entries: DashMap::new(),
            config,
            refetch_tx,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default())
    }

    /// Receiver of keys invalidated since subscribing
    pub fn subscribe_refetch(&self) -> broadcast::Receiver<QueryKey> {
        self.refetch_tx.subscribe()
    }

    /// Record a completed fetch, replacing any previous entry wholesale
    pub fn store_fetched(&self, key: QueryKey, data: JsonValue) {
        debug!(key = %key, ttl_secs = self.config.ttl.as_secs(), "Cache fetch stored");
        self.entries.insert(key, CacheEntry::new(data, self.config.ttl));
        self.maybe_evict();
    }

    /// Get an entry with its metadata, stale or not
    pub fn entry(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.clone())
    }

    pub fn is_stale(&self, key: &QueryKey) -> Option<bool> {
        self.entries.get(key).map(|e| e.stale)
    }

    /// Keys currently held, in sorted order
    pub fn keys(&self) -> Vec<QueryKey> {
        let mut keys: Vec<QueryKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear all entries
    pub fn clear(&self) {
        self.entries.clear();
        info!("Cache cleared");
    }

    /// Remove expired entries
    pub fn cleanup(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let count = before.saturating_sub(self.entries.len());

        if count > 0 {
            debug!(count = count, "Cleaned up expired cache entries");
        }
        count
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            stale: self.entries.iter().filter(|e| e.stale).count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }

    /// Get configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Evict entries if over capacity (oldest fetch first)
    fn maybe_evict(&self) {
        if self.entries.len() <= self.config.max_entries {
            return;
        }

        let to_evict = self.entries.len() - self.config.max_entries;

        let mut entries: Vec<(QueryKey, Instant)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.fetched_at))
            .collect();

        entries.sort_by_key(|(_, fetched)| *fetched);

        for (key, _) in entries.into_iter().take(to_evict) {
            self.entries.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        debug!(evicted = to_evict, "Evicted cache entries");
    }
}

impl CacheStore for QueryCache {
    fn get(&self, key: &QueryKey) -> Option<JsonValue> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_live() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.data.clone());
            }
            let expired = entry.is_expired();
            drop(entry); // Release the reference before removing
            if expired {
                self.entries.remove(key);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn set(&self, key: &QueryKey, value: JsonValue) {
        // A patch keeps the fetch timestamps of the entry it rewrites
        match self.entries.get_mut(key) {
            Some(mut entry) => entry.replace_data(value),
            None => {
                self.entries
                    .insert(key.clone(), CacheEntry::new(value, self.config.ttl));
                self.maybe_evict();
            }
        }
    }

    fn remove(&self, key: &QueryKey) -> Option<JsonValue> {
        self.entries.remove(key).map(|(_, entry)| entry.data)
    }

    fn invalidate(&self, location: &CacheLocation) -> usize {
        let mut matched = Vec::new();
        for mut entry in self.entries.iter_mut() {
            if location.matches(entry.key()) {
                entry.stale = true;
                matched.push(entry.key().clone());
            }
        }

        self.invalidations.fetch_add(1, Ordering::Relaxed);
        let count = matched.len();
        for key in matched {
            // No receivers means nobody is fetching right now
            let _ = self.refetch_tx.send(key);
        }

        if count > 0 {
            debug!(location = %location, count = count, "Invalidated cache entries");
        }
        count
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Spawn a background task to periodically cleanup expired entries
pub fn spawn_cleanup_task(cache: Arc<QueryCache>) -> tokio::task::JoinHandle<()> {
    let interval = cache.config.cleanup_interval;

    let handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let removed = cache.cleanup();
            let stats = cache.stats();
            debug!(
                removed = removed,
                entries = stats.entries,
                stale = stats.stale,
                hit_rate = %format!("{:.1}%", stats.hit_rate()),
                "Cache cleanup completed"
            );
        }
    });

    info!("Cache cleanup task started");
    handle
}
