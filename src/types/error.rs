//! Error types for realtime-cache
//!
//! Nothing in the notification path propagates these to the push source.
//! They surface at startup (config, connect) or are logged and dropped.

/// Main error type for cache sync operations
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Malformed notification: {0}")]
    MalformedNotification(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("NATS error: {0}")]
    Nats(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Seed error: {0}")]
    Seed(String),
}

impl SyncError {
    /// Whether the failure came from the payload rather than the transport
    pub fn is_payload_error(&self) -> bool {
        matches!(self, Self::MalformedNotification(_) | Self::Decode(_))
    }
}

/// Failure while mutating a cached entry in place.
///
/// Always turned into a fallback invalidation by the patch engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error("cached collection at {key} is not a list")]
    NotAList { key: String },

    #[error("cached record at {key} is not an object")]
    NotAnObject { key: String },

    #[error("snapshot identity does not match notification entity {entity_id}")]
    InvalidSnapshot { entity_id: String },
}

// Implement From conversions for common error types

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(format!("JSON error: {}", err))
    }
}

impl From<rmp_serde::decode::Error> for SyncError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Decode(format!("MessagePack error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

/// Result type alias for cache sync operations
pub type Result<T> = std::result::Result<T, SyncError>;
