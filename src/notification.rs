//! Change notifications pushed by the server
//!
//! The wire shape ([`RawNotification`]) is loose: payload fields are optional
//! and the id may arrive as a string or a number. [`ChangeNotification`] is
//! the validated form the patch engine works on, where the payload is tied to
//! the operation and a merge without fields cannot be built.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::types::{Result, SyncError};

/// JSON object used for merge fields and create snapshots
pub type Record = Map<String, JsonValue>;

/// Operation named on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Merge,
    Delete,
    Create,
}

/// Notification exactly as received from the push channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawNotification {
    /// Domain entity kind (e.g. "act", "invoice", "order")
    pub entity_type: String,
    /// String or number
    pub entity_id: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Canonical keys to force-refetch if patching is not possible
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invalidation_hints: Vec<String>,
}

/// Structured cache patch carried by a notification
#[derive(Debug, Clone, PartialEq)]
pub enum PatchOp {
    /// Shallow-merge these fields into the cached record
    Merge(Record),
    /// The record no longer exists
    Delete,
    /// Full representation of a new record
    Create(Record),
}

impl PatchOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Merge(_) => "merge",
            Self::Delete => "delete",
            Self::Create(_) => "create",
        }
    }
}

/// Validated change notification
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotification {
    pub entity_type: String,
    pub entity_id: String,
    /// `None` for hint-only notifications
    pub patch: Option<PatchOp>,
    pub entity_version: Option<u64>,
    pub updated_at: Option<DateTime<Utc>>,
    pub invalidation_hints: Vec<String>,
}

impl ChangeNotification {
    pub fn merge(entity_type: &str, entity_id: &str, fields: Record) -> Self {
        Self::with_patch(entity_type, entity_id, Some(PatchOp::Merge(fields)))
    }

    pub fn delete(entity_type: &str, entity_id: &str) -> Self {
        Self::with_patch(entity_type, entity_id, Some(PatchOp::Delete))
    }

    pub fn create(entity_type: &str, entity_id: &str, snapshot: Record) -> Self {
        Self::with_patch(entity_type, entity_id, Some(PatchOp::Create(snapshot)))
    }

    /// Notification that only asks for invalidation
    pub fn hints_only(entity_type: &str, entity_id: &str, hints: Vec<String>) -> Self {
        Self::with_patch(entity_type, entity_id, None).with_hints(hints)
    }

    fn with_patch(entity_type: &str, entity_id: &str, patch: Option<PatchOp>) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            patch,
            entity_version: None,
            updated_at: None,
            invalidation_hints: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.entity_version = Some(version);
        self
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = Some(updated_at);
        self
    }

    pub fn with_hints(mut self, hints: Vec<String>) -> Self {
        self.invalidation_hints = hints;
        self
    }

    /// Operation name for logging
    pub fn operation_name(&self) -> &'static str {
        self.patch.as_ref().map(PatchOp::name).unwrap_or("invalidate")
    }

    /// Whether the notification carries anything to order it by
    pub fn has_ordering(&self) -> bool {
        self.entity_version.is_some() || self.updated_at.is_some()
    }
}

/// Normalize a JSON id (string or integer) to its textual form
pub fn id_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl TryFrom<RawNotification> for ChangeNotification {
    type Error = SyncError;

    fn try_from(raw: RawNotification) -> Result<Self> {
        if raw.entity_type.trim().is_empty() {
            return Err(SyncError::MalformedNotification("empty entityType".into()));
        }

        let entity_id = match id_text(&raw.entity_id) {
            Some(id) if !id.is_empty() => id,
            _ => {
                return Err(SyncError::MalformedNotification(format!(
                    "{}: entityId must be a non-empty string or number, got {}",
                    raw.entity_type, raw.entity_id
                )))
            }
        };

        let malformed = |what: &str| {
            SyncError::MalformedNotification(format!(
                "{}:{}: {}",
                raw.entity_type, entity_id, what
            ))
        };

        let patch = match (raw.operation, raw.fields, raw.snapshot) {
            (Some(Operation::Merge), Some(fields), None) => Some(PatchOp::Merge(fields)),
            (Some(Operation::Merge), None, _) => return Err(malformed("merge without fields")),
            (Some(Operation::Create), None, Some(snapshot)) => Some(PatchOp::Create(snapshot)),
            (Some(Operation::Create), _, None) => return Err(malformed("create without snapshot")),
            (Some(Operation::Delete), None, None) => Some(PatchOp::Delete),
            (Some(op), _, _) => {
                return Err(malformed(&format!(
                    "unexpected payload for {:?}",
                    op
                )))
            }
            (None, None, None) => None,
            (None, _, _) => return Err(malformed("payload without operation")),
        };

        Ok(Self {
            entity_type: raw.entity_type,
            entity_id,
            patch,
            entity_version: raw.entity_version,
            updated_at: raw.updated_at,
            invalidation_hints: raw.invalidation_hints,
        })
    }
}

/// Decode a text frame
pub fn decode_text(text: &str) -> Result<RawNotification> {
    let value: JsonValue = serde_json::from_str(text)?;
    from_value(value)
}

/// Decode a binary frame (MessagePack, JSON as fallback)
pub fn decode_binary(data: &[u8]) -> Result<RawNotification> {
    let packed = rmp_serde::from_slice::<JsonValue>(data)
        .map_err(SyncError::from)
        .and_then(from_value);

    match packed {
        Ok(raw) => Ok(raw),
        // JSON text sent in a binary frame also parses as a msgpack scalar
        Err(e) => match std::str::from_utf8(data) {
            Ok(text) => decode_text(text).map_err(|_| e),
            Err(_) => Err(e),
        },
    }
}

/// Extract a notification from the envelopes the push channel uses
pub fn from_value(value: JsonValue) -> Result<RawNotification> {
    // Direct object
    if value.get("entityType").is_some() {
        return Ok(serde_json::from_value(value)?);
    }

    // { "payload": ... } / { "notification": ... } / { "type": ..., "data": ... }
    for wrapper in ["payload", "notification", "data"] {
        if let Some(inner) = value.get(wrapper) {
            return from_value(inner.clone());
        }
    }

    Err(SyncError::Decode(format!(
        "unrecognized notification format: {}",
        value
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: JsonValue) -> RawNotification {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_merge_deserialization() {
        let n = raw(json!({
            "entityType": "act",
            "entityId": "1",
            "operation": "merge",
            "fields": {"title": "Y"},
            "entityVersion": 2,
            "invalidationHints": ["delivery:act:list"]
        }));

        let n = ChangeNotification::try_from(n).unwrap();
        assert_eq!(n.entity_type, "act");
        assert_eq!(n.entity_id, "1");
        assert_eq!(n.entity_version, Some(2));
        assert_eq!(n.operation_name(), "merge");
        assert_eq!(n.invalidation_hints, vec!["delivery:act:list".to_string()]);
        match n.patch {
            Some(PatchOp::Merge(fields)) => assert_eq!(fields["title"], "Y"),
            other => panic!("expected merge, got {:?}", other),
        }
    }

    #[test]
    fn test_numeric_id_and_timestamp() {
        let n = raw(json!({
            "entityType": "invoice",
            "entityId": 42,
            "operation": "delete",
            "updatedAt": "2026-03-01T10:00:00Z"
        }));

        let n = ChangeNotification::try_from(n).unwrap();
        assert_eq!(n.entity_id, "42");
        assert_eq!(n.patch, Some(PatchOp::Delete));
        assert!(n.updated_at.is_some());
        assert!(n.has_ordering());
    }

    #[test]
    fn test_hint_only_notification() {
        let n = raw(json!({
            "entityType": "order",
            "entityId": "3",
            "invalidationHints": ["orders:order:list"]
        }));

        let n = ChangeNotification::try_from(n).unwrap();
        assert!(n.patch.is_none());
        assert_eq!(n.operation_name(), "invalidate");
    }

    #[test]
    fn test_payload_must_match_operation() {
        let cases = [
            json!({"entityType": "act", "entityId": "1", "operation": "merge"}),
            json!({"entityType": "act", "entityId": "1", "operation": "create", "fields": {"a": 1}}),
            json!({"entityType": "act", "entityId": "1", "operation": "delete", "fields": {"a": 1}}),
            json!({"entityType": "act", "entityId": "1", "operation": "merge", "fields": {}, "snapshot": {}}),
            json!({"entityType": "act", "entityId": "1", "fields": {"a": 1}}),
            json!({"entityType": "", "entityId": "1", "operation": "delete"}),
            json!({"entityType": "act", "entityId": null, "operation": "delete"}),
            json!({"entityType": "act", "entityId": "", "operation": "delete"}),
        ];

        for case in cases {
            let err = ChangeNotification::try_from(raw(case.clone())).unwrap_err();
            assert!(
                matches!(err, SyncError::MalformedNotification(_)),
                "case {} gave {:?}",
                case,
                err
            );
        }
    }

    #[test]
    fn test_decode_envelopes() {
        let inner = json!({"entityType": "act", "entityId": "1", "operation": "delete"});

        let direct = decode_text(&inner.to_string()).unwrap();
        assert_eq!(direct.entity_type, "act");

        let wrapped = decode_text(&json!({"payload": inner.clone()}).to_string()).unwrap();
        assert_eq!(wrapped, direct);

        let typed = json!({"type": "entity.changed", "data": {"notification": inner}});
        assert_eq!(decode_text(&typed.to_string()).unwrap(), direct);

        assert!(decode_text(r#"{"hello": "world"}"#).is_err());
    }

    #[test]
    fn test_decode_binary_msgpack_and_json() {
        let value = json!({"entityType": "act", "entityId": "5", "operation": "delete"});
        let packed = rmp_serde::to_vec_named(&value).unwrap();
        assert_eq!(decode_binary(&packed).unwrap().entity_id, json!("5"));

        let text = value.to_string();
        assert_eq!(decode_binary(text.as_bytes()).unwrap().entity_id, json!("5"));
    }
}
