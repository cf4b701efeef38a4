//! Seed file loading
//!
//! A seed file is a JSON array of `{ "key": [...], "data": ... }` objects
//! used to prime the cache before the push channel connects.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;

use super::keys::QueryKey;
use super::store::QueryCache;
use crate::types::{Result, SyncError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedEntry {
    pub key: QueryKey,
    pub data: JsonValue,
}

/// Read and parse a seed file
pub fn load_seed_file(path: &Path) -> Result<Vec<SeedEntry>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| SyncError::Seed(format!("{}: {}", path.display(), e)))?;
    let entries: Vec<SeedEntry> = serde_json::from_str(&raw)
        .map_err(|e| SyncError::Seed(format!("{}: {}", path.display(), e)))?;

    if let Some(empty) = entries.iter().find(|e| e.key.segments().is_empty()) {
        return Err(SyncError::Seed(format!(
            "{}: entry with empty key (data: {})",
            path.display(),
            empty.data
        )));
    }
    Ok(entries)
}

/// Store every seed entry as if it had just been fetched
pub fn prime(cache: &QueryCache, entries: Vec<SeedEntry>) -> usize {
    let count = entries.len();
    for entry in entries {
        cache.store_fetched(entry.key, entry.data);
    }
    info!(count = count, "Cache primed from seed");
    count
}
