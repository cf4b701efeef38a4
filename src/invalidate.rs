//! Invalidation dispatcher
//!
//! Resolves canonical keys through the [`CanonicalRegistry`] and marks the
//! matching cache entries for refetch.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::cache::{CacheLocation, CacheStore};
use crate::canonical::CanonicalRegistry;

pub struct Invalidator {
    registry: Arc<CanonicalRegistry>,
    store: Arc<dyn CacheStore>,
}

impl Invalidator {
    pub fn new(registry: Arc<CanonicalRegistry>, store: Arc<dyn CacheStore>) -> Self {
        Self { registry, store }
    }

    pub fn registry(&self) -> &CanonicalRegistry {
        &self.registry
    }

    /// Invalidate everything one key resolves to, returning entries touched
    pub fn invalidate_one(&self, key: &str) -> usize {
        let locations = self.registry.resolve(key);
        let touched = self.invalidate_locations(&locations);
        debug!(key = key, locations = locations.len(), touched = touched, "Invalidated canonical key");
        touched
    }

    /// Invalidate a batch; a key repeated in the batch is dispatched once
    pub fn invalidate_batch<I, S>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut touched = 0;
        for key in keys {
            let key = key.as_ref();
            if seen.insert(key.to_string()) {
                touched += self.invalidate_one(key);
            }
        }
        touched
    }

    /// Invalidate already-resolved locations
    pub fn invalidate_locations(&self, locations: &[CacheLocation]) -> usize {
        locations
            .iter()
            .map(|location| self.store.invalidate(location))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::QueryKey;
    use serde_json::Value as JsonValue;
    use std::sync::Mutex;

    /// Records invalidation calls instead of touching entries
    #[derive(Default)]
    struct RecordingStore {
        calls: Mutex<Vec<CacheLocation>>,
    }

    impl CacheStore for RecordingStore {
        fn get(&self, _key: &QueryKey) -> Option<JsonValue> {
            None
        }

        fn set(&self, _key: &QueryKey, _value: JsonValue) {}

        fn remove(&self, _key: &QueryKey) -> Option<JsonValue> {
            None
        }

        fn invalidate(&self, location: &CacheLocation) -> usize {
            self.calls.lock().unwrap().push(location.clone());
            1
        }
    }

    fn registry() -> Arc<CanonicalRegistry> {
        Arc::new(
            CanonicalRegistry::builder()
                .exact("a", vec![CacheLocation::prefix(["a"])])
                .exact("b", vec![CacheLocation::prefix(["b"])])
                .exact(
                    "both",
                    vec![CacheLocation::prefix(["a"]), CacheLocation::prefix(["b"])],
                )
                .build(),
        )
    }

    #[test]
    fn test_batch_dedup() {
        let store = Arc::new(RecordingStore::default());
        let invalidator = Invalidator::new(registry(), store.clone());

        invalidator.invalidate_batch(["a", "a", "b"]);

        let calls = store.calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![CacheLocation::prefix(["a"]), CacheLocation::prefix(["b"])]
        );
    }

    #[test]
    fn test_one_key_many_locations() {
        let store = Arc::new(RecordingStore::default());
        let invalidator = Invalidator::new(registry(), store.clone());

        assert_eq!(invalidator.invalidate_one("both"), 2);
        assert_eq!(store.calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_key_goes_global() {
        let store = Arc::new(RecordingStore::default());
        let invalidator = Invalidator::new(registry(), store.clone());

        invalidator.invalidate_batch(vec!["nope".to_string()]);

        assert_eq!(*store.calls.lock().unwrap(), vec![CacheLocation::All]);
        assert_eq!(invalidator.registry().global_fallbacks(), 1);
    }

    #[test]
    fn test_empty_batch() {
        let store = Arc::new(RecordingStore::default());
        let invalidator = Invalidator::new(registry(), store.clone());
        assert_eq!(invalidator.invalidate_batch(Vec::<String>::new()), 0);
        assert!(store.calls.lock().unwrap().is_empty());
    }
}
