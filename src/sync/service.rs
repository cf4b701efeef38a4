//! Sync service - the single consumer of change notifications
//!
//! Validates each notification, runs it through the patch engine and
//! dispatches whatever invalidation the outcome calls for.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheLocation, CacheStore};
use crate::invalidate::Invalidator;
use crate::notification::{ChangeNotification, RawNotification};
use crate::patch::{PatchEngine, PatchOutcome};
use crate::types::Result;

/// Point-in-time counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub received: u64,
    pub malformed: u64,
    pub applied: u64,
    pub invalidated: u64,
}

pub struct SyncService {
    engine: Arc<PatchEngine>,
    invalidator: Invalidator,
    store: Arc<dyn CacheStore>,
    shutdown_tx: broadcast::Sender<()>,
    received: AtomicU64,
    malformed: AtomicU64,
    applied: AtomicU64,
    invalidated: AtomicU64,
}

impl SyncService {
    pub fn new(engine: Arc<PatchEngine>, invalidator: Invalidator, store: Arc<dyn CacheStore>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            engine,
            invalidator,
            store,
            shutdown_tx,
            received: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            applied: AtomicU64::new(0),
            invalidated: AtomicU64::new(0),
        }
    }

    /// Get a shutdown receiver for graceful termination
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal shutdown to the service
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn engine(&self) -> &PatchEngine {
        &self.engine
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            received: self.received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            invalidated: self.invalidated.load(Ordering::Relaxed),
        }
    }

    /// Validate and handle a wire notification.
    ///
    /// A malformed notification is rejected whole and the cache is not touched.
    pub fn process(&self, raw: RawNotification) -> Result<PatchOutcome> {
        self.received.fetch_add(1, Ordering::Relaxed);
        let notification = ChangeNotification::try_from(raw).inspect_err(|_| {
            self.malformed.fetch_add(1, Ordering::Relaxed);
        })?;
        Ok(self.handle(&notification))
    }

    /// Patch, or invalidate when the patch could not be applied
    pub fn handle(&self, notification: &ChangeNotification) -> PatchOutcome {
        let outcome = self.engine.apply(Some(self.store.as_ref()), notification);

        if outcome.applied {
            self.applied.fetch_add(1, Ordering::Relaxed);
            return outcome;
        }

        let touched = if !outcome.invalidate_keys.is_empty() {
            self.invalidator.invalidate_batch(&outcome.invalidate_keys)
        } else if let Some(handler) = self.engine.registry().lookup(&notification.entity_type) {
            // No hints: refetch this entity's own queries rather than keep them stale
            self.invalidator.invalidate_locations(&[
                CacheLocation::Exact(handler.list_key.clone()),
                CacheLocation::Exact(handler.detail_key(&notification.entity_id)),
            ])
        } else {
            warn!(
                entity_type = %notification.entity_type,
                entity_id = %notification.entity_id,
                "Unpatched notification without hints or handler, nothing to invalidate"
            );
            0
        };

        self.invalidated.fetch_add(touched as u64, Ordering::Relaxed);
        debug!(
            entity_type = %notification.entity_type,
            entity_id = %notification.entity_id,
            touched = touched,
            "Fallback invalidation dispatched"
        );
        outcome
    }
}

/// Start the sync service with a notification receiver
///
/// This spawns the one task that mutates the cache.
pub fn spawn_sync_task(
    service: Arc<SyncService>,
    mut notification_rx: broadcast::Receiver<RawNotification>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown_rx = service.shutdown_receiver();

        info!("Sync service started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Sync service shutting down");
                    break;
                }
                notification = notification_rx.recv() => {
                    match notification {
                        Ok(raw) => {
                            match service.process(raw) {
                                Ok(_) => {}
                                Err(e) if e.is_payload_error() => {
                                    warn!("Dropping malformed notification: {}", e);
                                }
                                Err(e) => error!("Notification processing failed: {}", e),
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            // Lost notifications can't be patched; refetch everything
                            warn!("Sync service lagged {} notifications, invalidating cache", n);
                            let touched = service.invalidator.invalidate_locations(&[CacheLocation::All]);
                            service.invalidated.fetch_add(touched as u64, Ordering::Relaxed);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("Notification channel closed, sync service stopping");
                            break;
                        }
                    }
                }
            }
        }

        info!("Sync service stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{QueryCache, QueryKey};
    use crate::canonical::CanonicalRegistry;
    use crate::patch::{PatchRegistry, PatchState};
    use serde_json::json;

    fn service(cache: Arc<QueryCache>) -> SyncService {
        let engine = Arc::new(PatchEngine::new(Arc::new(PatchRegistry::standard())));
        let invalidator = Invalidator::new(Arc::new(CanonicalRegistry::standard()), cache.clone());
        SyncService::new(engine, invalidator, cache)
    }

    fn raw(value: serde_json::Value) -> RawNotification {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_malformed_is_rejected_without_touching_cache() {
        let cache = Arc::new(QueryCache::with_defaults());
        cache.store_fetched(QueryKey::new(["acts", "list"]), json!([{"id": "1"}]));
        let service = service(cache.clone());

        let result = service.process(raw(json!({
            "entityType": "act", "entityId": "1", "operation": "merge"
        })));

        tokio_test::assert_err!(result);
        assert_eq!(service.stats().malformed, 1);
        assert_eq!(cache.stats().stale, 0);
    }

    #[test]
    fn test_fallback_uses_hints() {
        let cache = Arc::new(QueryCache::with_defaults());
        cache.store_fetched(QueryKey::new(["acts", "list"]), json!([{"id": "2"}]));
        cache.store_fetched(QueryKey::new(["clients", "list"]), json!([]));
        let service = service(cache.clone());

        let outcome = tokio_test::assert_ok!(service.process(raw(json!({
            "entityType": "act",
            "entityId": "1",
            "operation": "delete",
            "invalidationHints": ["delivery:act:list"]
        }))));

        assert_eq!(outcome.state, PatchState::FallbackInvalidate);
        assert_eq!(cache.is_stale(&QueryKey::new(["acts", "list"])), Some(true));
        assert_eq!(cache.is_stale(&QueryKey::new(["clients", "list"])), Some(false));
        assert_eq!(service.stats().invalidated, 1);
    }

    #[test]
    fn test_fallback_without_hints_targets_own_queries() {
        let cache = Arc::new(QueryCache::with_defaults());
        cache.store_fetched(QueryKey::new(["acts", "list"]), json!({"broken": true}));
        cache.store_fetched(QueryKey::new(["clients", "list"]), json!([]));
        let service = service(cache.clone());

        let n = ChangeNotification::delete("act", "1");
        assert!(!service.handle(&n).applied);

        assert_eq!(cache.is_stale(&QueryKey::new(["acts", "list"])), Some(true));
        assert_eq!(cache.is_stale(&QueryKey::new(["clients", "list"])), Some(false));
    }

    #[test]
    fn test_applied_does_not_invalidate() {
        let cache = Arc::new(QueryCache::with_defaults());
        cache.store_fetched(QueryKey::new(["acts", "list"]), json!([{"id": "1"}]));
        let service = service(cache.clone());

        let outcome = service.handle(&ChangeNotification::delete("act", "1"));
        assert!(outcome.applied);
        assert_eq!(cache.stats().stale, 0);
        assert_eq!(service.stats().applied, 1);
    }
}
