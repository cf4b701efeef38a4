//! WebSocket push source
//!
//! Holds a connection to the server's change feed, reconnecting on failure,
//! and forwards every decoded notification to the sync service.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info};

use crate::notification::RawNotification;
use crate::types::{Result, SyncError};

/// Source configuration
#[derive(Debug, Clone)]
pub struct WsSourceConfig {
    /// Change feed WebSocket URL
    pub url: String,
    /// Reconnection delay on disconnect
    pub reconnect_delay: Duration,
    /// Maximum reconnection attempts (0 = infinite)
    pub max_reconnect_attempts: u32,
    /// Ping interval for keepalive
    pub ping_interval: Duration,
}

impl Default for WsSourceConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/changes".to_string(),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 0, // Infinite
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// WebSocket change-feed client
pub struct WsSource {
    config: WsSourceConfig,
    notification_tx: broadcast::Sender<RawNotification>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WsSource {
    pub fn new(config: WsSourceConfig, notification_tx: broadcast::Sender<RawNotification>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            notification_tx,
            shutdown_tx,
        }
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Run until shutdown or until reconnect attempts are exhausted
    pub async fn run(&self) {
        let mut reconnect_attempts = 0u32;
        let mut shutdown_rx = self.shutdown_receiver();

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!("WebSocket source shutting down");
                break;
            }

            info!("Connecting to change feed at {}", self.config.url);

            match self.connect_and_listen().await {
                Ok(()) => {
                    reconnect_attempts = 0;
                }
                Err(e) => {
                    error!("Change feed connection error: {}", e);
                    reconnect_attempts += 1;

                    if self.config.max_reconnect_attempts > 0
                        && reconnect_attempts >= self.config.max_reconnect_attempts
                    {
                        error!(
                            "Max reconnection attempts ({}) reached, stopping source",
                            self.config.max_reconnect_attempts
                        );
                        break;
                    }
                }
            }

            info!(
                "Reconnecting in {:?} (attempt {})",
                self.config.reconnect_delay, reconnect_attempts
            );

            tokio::select! {
                _ = sleep(self.config.reconnect_delay) => {}
                _ = shutdown_rx.recv() => {
                    info!("Shutdown received during reconnect wait");
                    break;
                }
            }
        }

        info!("WebSocket source stopped");
    }

    async fn connect_and_listen(&self) -> Result<()> {
        let (ws_stream, _) = connect_async(&self.config.url).await?;

        info!("Connected to change feed");

        let (mut write, mut read) = ws_stream.split();
        let mut shutdown_rx = self.shutdown_receiver();
        let mut ping_interval = tokio::time::interval(self.config.ping_interval);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, closing connection");
                    let _ = write.close().await;
                    return Ok(());
                }

                _ = ping_interval.tick() => {
                    write.send(Message::Ping(vec![])).await?;
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            super::emit_text(&self.notification_tx, &text);
                        }
                        Some(Ok(Message::Binary(data))) => {
                            super::emit_binary(&self.notification_tx, &data);
                        }
                        Some(Ok(Message::Pong(_))) => {
                            debug!("Received pong");
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("Server closed change feed");
                            return Ok(());
                        }
                        Some(Err(e)) => {
                            return Err(e.into());
                        }
                        None => {
                            return Err(SyncError::WebSocket("stream ended".to_string()));
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

/// Spawn the WebSocket source as a background task
pub fn spawn_ws_source(
    config: WsSourceConfig,
    notification_tx: broadcast::Sender<RawNotification>,
) -> (Arc<WsSource>, tokio::task::JoinHandle<()>) {
    let source = Arc::new(WsSource::new(config, notification_tx));
    let source_clone = source.clone();

    let handle = tokio::spawn(async move {
        source_clone.run().await;
    });

    (source, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = WsSourceConfig::default();
        assert_eq!(config.url, "ws://localhost:8080/changes");
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.max_reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (tx, _rx) = broadcast::channel(8);
        let source = WsSource::new(
            WsSourceConfig {
                // nothing listens on port 9 locally
                url: "ws://127.0.0.1:9/changes".to_string(),
                reconnect_delay: Duration::from_millis(10),
                max_reconnect_attempts: 2,
                ping_interval: Duration::from_secs(30),
            },
            tx,
        );

        tokio::time::timeout(Duration::from_secs(5), source.run())
            .await
            .expect("source should stop on its own");
    }
}
