//! Notification consumption
//!
//! Push sources ([`ws`], [`nats`]) decode frames into raw notifications and
//! broadcast them. A single [`service::SyncService`] task consumes that
//! channel, so cache mutation is serialized through one point.

pub mod nats;
pub mod service;
pub mod ws;

pub use nats::NatsSource;
pub use service::{spawn_sync_task, SyncService, SyncStats};
pub use ws::{spawn_ws_source, WsSource, WsSourceConfig};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::notification::{self, RawNotification};

/// Decode a text frame and forward it
pub(crate) fn emit_text(tx: &broadcast::Sender<RawNotification>, text: &str) {
    match notification::decode_text(text) {
        Ok(raw) => emit(tx, raw),
        Err(e) => debug!(error = %e, "Dropping undecodable text frame"),
    }
}

/// Decode a binary frame and forward it
pub(crate) fn emit_binary(tx: &broadcast::Sender<RawNotification>, data: &[u8]) {
    match notification::decode_binary(data) {
        Ok(raw) => emit(tx, raw),
        Err(e) => debug!(error = %e, bytes = data.len(), "Dropping undecodable binary frame"),
    }
}

fn emit(tx: &broadcast::Sender<RawNotification>, raw: RawNotification) {
    debug!(
        entity_type = %raw.entity_type,
        entity_id = %raw.entity_id,
        "Received change notification"
    );
    if let Err(e) = tx.send(raw) {
        warn!("Failed to forward notification (no consumer?): {}", e);
    }
}
