//! Patch Engine - apply or reject a change notification against the cache
//!
//! ```text
//! received ──▶ ordering-checked ──┬──▶ applied
//!                                 ├──▶ rejected-stale   (already satisfied)
//!                                 └──▶ fallback-invalidate (hints returned)
//! ```
//!
//! Notifications may arrive out of order and more than once. Correctness
//! under reordering comes from the stale check: a cached record carrying an
//! `entityVersion` (or, failing that, an `updatedAt`) at least as new as the
//! notification's is never regressed. Duplicate creates are absorbed by the
//! identity check.
//!
//! Mutations are computed on copies and only written back once every
//! location has been patched successfully, so a shape error leaves the cache
//! untouched and turns into a fallback invalidation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use super::registry::{PatchHandler, PatchRegistry};
use crate::cache::{CacheStore, QueryKey};
use crate::notification::{id_text, ChangeNotification, PatchOp, Record};
use crate::types::PatchError;

/// Field holding a record's monotonically increasing version
pub const VERSION_FIELD: &str = "entityVersion";
/// Field holding a record's last-modified timestamp (RFC 3339)
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// Terminal state of one notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchState {
    Applied,
    RejectedStale,
    FallbackInvalidate,
}

impl PatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::RejectedStale => "rejected-stale",
            Self::FallbackInvalidate => "fallback-invalidate",
        }
    }
}

/// Result handed back to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    /// True when the cache already reflects the notification
    pub applied: bool,
    /// Canonical keys to invalidate; empty whenever `applied`
    pub invalidate_keys: Vec<String>,
    pub state: PatchState,
}

impl PatchOutcome {
    fn applied() -> Self {
        Self {
            applied: true,
            invalidate_keys: Vec::new(),
            state: PatchState::Applied,
        }
    }

    fn stale() -> Self {
        Self {
            applied: true,
            invalidate_keys: Vec::new(),
            state: PatchState::RejectedStale,
        }
    }

    fn fallback(notification: &ChangeNotification) -> Self {
        Self {
            applied: false,
            invalidate_keys: notification.invalidation_hints.clone(),
            state: PatchState::FallbackInvalidate,
        }
    }
}

/// Counters per terminal state
#[derive(Debug, Default)]
pub struct EngineStats {
    applied: AtomicU64,
    stale: AtomicU64,
    fallbacks: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    pub applied: u64,
    pub stale: u64,
    pub fallbacks: u64,
    /// Fallbacks caused by a mutation failure
    pub errors: u64,
}

impl EngineStats {
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Applies change notifications to a [`CacheStore`]
pub struct PatchEngine {
    registry: Arc<PatchRegistry>,
    stats: EngineStats,
}

impl PatchEngine {
    pub fn new(registry: Arc<PatchRegistry>) -> Self {
        Self {
            registry,
            stats: EngineStats::default(),
        }
    }

    pub fn registry(&self) -> &PatchRegistry {
        &self.registry
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Process one notification.
    ///
    /// `store` is `None` while the cache is not initialized yet. Never fails:
    /// every problem degrades to returning the notification's hints.
    pub fn apply(
        &self,
        store: Option<&dyn CacheStore>,
        notification: &ChangeNotification,
    ) -> PatchOutcome {
        let outcome = self.evaluate(store, notification);

        let counter = match outcome.state {
            PatchState::Applied => &self.stats.applied,
            PatchState::RejectedStale => &self.stats.stale,
            PatchState::FallbackInvalidate => &self.stats.fallbacks,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        debug!(
            entity_type = %notification.entity_type,
            entity_id = %notification.entity_id,
            operation = notification.operation_name(),
            state = outcome.state.as_str(),
            invalidate = outcome.invalidate_keys.len(),
            "Notification processed"
        );
        outcome
    }

    fn evaluate(
        &self,
        store: Option<&dyn CacheStore>,
        notification: &ChangeNotification,
    ) -> PatchOutcome {
        let (Some(store), Some(patch)) = (store, notification.patch.as_ref()) else {
            return PatchOutcome::fallback(notification);
        };

        let Some(handler) = self.registry.lookup(&notification.entity_type) else {
            debug!(
                entity_type = %notification.entity_type,
                "No patch handler registered"
            );
            return PatchOutcome::fallback(notification);
        };

        let detail_key = handler.detail_key(&notification.entity_id);
        let list = store.get(&handler.list_key);
        let detail = store.get(&detail_key);

        if is_stale(notification, handler, list.as_ref(), detail.as_ref()) {
            return PatchOutcome::stale();
        }

        let result = match patch {
            PatchOp::Merge(fields) => {
                apply_merge(store, handler, &detail_key, notification, fields, list, detail)
            }
            PatchOp::Delete => apply_delete(store, handler, &detail_key, notification, list),
            PatchOp::Create(snapshot) => apply_create(store, handler, notification, snapshot, list),
        };

        match result {
            Ok(true) => PatchOutcome::applied(),
            Ok(false) => PatchOutcome::fallback(notification),
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    entity_type = %notification.entity_type,
                    entity_id = %notification.entity_id,
                    error = %e,
                    "Cache patch failed, falling back to invalidation"
                );
                PatchOutcome::fallback(notification)
            }
        }
    }
}

/// Whether any cached copy is already at least as new as the notification
fn is_stale(
    notification: &ChangeNotification,
    handler: &PatchHandler,
    list: Option<&JsonValue>,
    detail: Option<&JsonValue>,
) -> bool {
    if !notification.has_ordering() {
        return false;
    }

    let in_list = list
        .and_then(collection_items)
        .and_then(|items| {
            items
                .iter()
                .find(|item| matches_identity(item, &handler.identity_field, &notification.entity_id))
        })
        .and_then(JsonValue::as_object);

    let in_detail = detail.and_then(JsonValue::as_object);

    [in_list, in_detail]
        .into_iter()
        .flatten()
        .any(|cached| cached_is_current(cached, notification))
}

/// A cached marker that is not an unsigned integer (version) or an RFC 3339
/// string (timestamp) counts as absent. The other marker then decides, and
/// with neither readable the notification is applied.
fn cached_is_current(cached: &Record, notification: &ChangeNotification) -> bool {
    // Version wins over timestamp when both sides carry one
    if let (Some(incoming), Some(current)) = (notification.entity_version, record_version(cached)) {
        return current >= incoming;
    }

    match (notification.updated_at, record_updated_at(cached)) {
        (Some(incoming), Some(current)) => current >= incoming,
        _ => false,
    }
}

fn record_version(record: &Record) -> Option<u64> {
    record.get(VERSION_FIELD).and_then(JsonValue::as_u64)
}

fn record_updated_at(record: &Record) -> Option<DateTime<Utc>> {
    record
        .get(UPDATED_AT_FIELD)
        .and_then(JsonValue::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn matches_identity(item: &JsonValue, field: &str, id: &str) -> bool {
    item.get(field).and_then(id_text).as_deref() == Some(id)
}

/// Records of a cached collection: a bare array or a page with `items`
fn collection_items(value: &JsonValue) -> Option<&Vec<JsonValue>> {
    match value {
        JsonValue::Array(items) => Some(items),
        JsonValue::Object(page) => page.get("items").and_then(JsonValue::as_array),
        _ => None,
    }
}

fn collection_items_mut<'a>(
    value: &'a mut JsonValue,
    key: &QueryKey,
) -> Result<&'a mut Vec<JsonValue>, PatchError> {
    let not_a_list = || PatchError::NotAList {
        key: key.to_storage_key(),
    };
    match value {
        JsonValue::Array(items) => Ok(items),
        JsonValue::Object(page) => page
            .get_mut("items")
            .and_then(JsonValue::as_array_mut)
            .ok_or_else(not_a_list),
        _ => Err(not_a_list()),
    }
}

/// Shallow merge plus the notification's ordering markers
fn merge_into(
    target: &mut JsonValue,
    fields: &Record,
    notification: &ChangeNotification,
    key: &QueryKey,
) -> Result<(), PatchError> {
    let record = target.as_object_mut().ok_or_else(|| PatchError::NotAnObject {
        key: key.to_storage_key(),
    })?;

    for (field, value) in fields {
        record.insert(field.clone(), value.clone());
    }
    stamp_ordering(record, notification);
    Ok(())
}

fn stamp_ordering(record: &mut Record, notification: &ChangeNotification) {
    if let Some(version) = notification.entity_version {
        record.insert(VERSION_FIELD.to_string(), JsonValue::from(version));
    }
    if let Some(updated_at) = notification.updated_at {
        record.insert(UPDATED_AT_FIELD.to_string(), timestamp_value(updated_at));
    }
}

/// Like [`stamp_ordering`], but a marker the snapshot already carries wins
fn stamp_missing_ordering(record: &mut Record, notification: &ChangeNotification) {
    if let Some(version) = notification.entity_version {
        record
            .entry(VERSION_FIELD)
            .or_insert_with(|| JsonValue::from(version));
    }
    if let Some(updated_at) = notification.updated_at {
        record
            .entry(UPDATED_AT_FIELD)
            .or_insert_with(|| timestamp_value(updated_at));
    }
}

fn timestamp_value(at: DateTime<Utc>) -> JsonValue {
    JsonValue::String(at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Returns `Ok(false)` when neither location held the record
fn apply_merge(
    store: &dyn CacheStore,
    handler: &PatchHandler,
    detail_key: &QueryKey,
    notification: &ChangeNotification,
    fields: &Record,
    list: Option<JsonValue>,
    detail: Option<JsonValue>,
) -> Result<bool, PatchError> {
    let mut new_list = None;
    if let Some(mut list) = list {
        let found = {
            let items = collection_items_mut(&mut list, &handler.list_key)?;
            match items
                .iter_mut()
                .find(|item| matches_identity(item, &handler.identity_field, &notification.entity_id))
            {
                Some(item) => {
                    merge_into(item, fields, notification, &handler.list_key)?;
                    true
                }
                None => false,
            }
        };
        if found {
            new_list = Some(list);
        }
    }

    let mut new_detail = None;
    if let Some(mut detail) = detail {
        merge_into(&mut detail, fields, notification, detail_key)?;
        new_detail = Some(detail);
    }

    let touched = new_list.is_some() || new_detail.is_some();
    if let Some(list) = new_list {
        store.set(&handler.list_key, list);
    }
    if let Some(detail) = new_detail {
        store.set(detail_key, detail);
    }
    Ok(touched)
}

fn apply_delete(
    store: &dyn CacheStore,
    handler: &PatchHandler,
    detail_key: &QueryKey,
    notification: &ChangeNotification,
    list: Option<JsonValue>,
) -> Result<bool, PatchError> {
    let Some(mut list) = list else {
        return Ok(false);
    };

    let removed = {
        let items = collection_items_mut(&mut list, &handler.list_key)?;
        let before = items.len();
        items.retain(|item| !matches_identity(item, &handler.identity_field, &notification.entity_id));
        items.len() != before
    };

    if !removed {
        return Ok(false);
    }

    store.set(&handler.list_key, list);
    store.remove(detail_key);
    Ok(true)
}

fn apply_create(
    store: &dyn CacheStore,
    handler: &PatchHandler,
    notification: &ChangeNotification,
    snapshot: &Record,
    list: Option<JsonValue>,
) -> Result<bool, PatchError> {
    let Some(mut list) = list else {
        return Ok(false);
    };

    let mut record = snapshot.clone();
    match record.get(&handler.identity_field).and_then(id_text) {
        Some(id) if id != notification.entity_id => {
            return Err(PatchError::InvalidSnapshot {
                entity_id: notification.entity_id.clone(),
            })
        }
        Some(_) => {}
        None => {
            record.insert(
                handler.identity_field.clone(),
                JsonValue::String(notification.entity_id.clone()),
            );
        }
    }
    stamp_missing_ordering(&mut record, notification);

    let inserted = {
        let items = collection_items_mut(&mut list, &handler.list_key)?;
        if items
            .iter()
            .any(|item| matches_identity(item, &handler.identity_field, &notification.entity_id))
        {
            false
        } else {
            items.insert(0, JsonValue::Object(record));
            true
        }
    };

    if inserted {
        store.set(&handler.list_key, list);
    }
    Ok(true)
}
