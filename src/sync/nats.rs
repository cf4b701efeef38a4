//! NATS push source
//!
//! Subscribes to the change subject and forwards each message payload
//! (MessagePack or JSON) to the sync service.

use std::time::Duration;

use async_nats::{Client, ConnectOptions};
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tracing::info;

use crate::config::NatsArgs;
use crate::notification::RawNotification;
use crate::types::{Result, SyncError};

/// Default ping interval for keep-alive
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);

pub struct NatsSource {
    client: Client,
    subject: String,
    notification_tx: broadcast::Sender<RawNotification>,
}

impl NatsSource {
    /// Connect to NATS; `name` identifies this session in server logs
    pub async fn connect(
        args: &NatsArgs,
        name: &str,
        notification_tx: broadcast::Sender<RawNotification>,
    ) -> Result<Self> {
        let url = args
            .nats_url
            .as_deref()
            .ok_or_else(|| SyncError::Config("NATS_URL is not set".to_string()))?;

        info!("Connecting to NATS at {}", url);

        let mut options = ConnectOptions::new()
            .name(name)
            .ping_interval(DEFAULT_PING_INTERVAL)
            .connection_timeout(Duration::from_secs(5));

        if let (Some(user), Some(pass)) = (&args.nats_user, &args.nats_password) {
            options = options.user_and_password(user.clone(), pass.clone());
        }

        let client = options
            .connect(url)
            .await
            .map_err(|e| SyncError::Nats(format!("Failed to connect: {}", e)))?;

        info!("Connected to NATS at {}", url);

        Ok(Self {
            client,
            subject: args.nats_subject.clone(),
            notification_tx,
        })
    }

    /// Forward messages until shutdown or until the subscription ends
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let mut subscriber = self
            .client
            .subscribe(self.subject.clone())
            .await
            .map_err(|e| SyncError::Nats(format!("Subscribe failed: {}", e)))?;

        info!(subject = %self.subject, "Subscribed to change subject");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("NATS source shutting down");
                    break;
                }
                message = subscriber.next() => {
                    match message {
                        Some(message) => super::emit_binary(&self.notification_tx, &message.payload),
                        None => {
                            info!("NATS subscription closed");
                            break;
                        }
                    }
                }
            }
        }

        let _ = subscriber.unsubscribe().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_without_url_is_config_error() {
        let args = NatsArgs {
            nats_url: None,
            nats_subject: "backoffice.changes".to_string(),
            nats_user: None,
            nats_password: None,
        };
        let (tx, _rx) = broadcast::channel(4);

        let err = NatsSource::connect(&args, "realtime-cache-test", tx)
            .await
            .err()
            .expect("connect should fail without a URL");
        assert!(matches!(err, SyncError::Config(_)));
        assert!(!err.is_payload_error());
    }
}
