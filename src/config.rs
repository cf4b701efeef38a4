//! Configuration for realtime-cache
//!
//! CLI arguments and environment variable handling using clap.
//! Cache tunables come from [`crate::cache::CacheConfig::from_env`].

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::sync::WsSourceConfig;

/// realtime-cache - keeps a session read cache in step with server pushes
#[derive(Parser, Debug, Clone)]
#[command(name = "realtime-cache")]
#[command(about = "Patch-or-invalidate cache synchronization driven by server change notifications")]
pub struct Args {
    /// Identifier of this cache session
    #[arg(long, env = "SESSION_ID", default_value_t = Uuid::new_v4())]
    pub session_id: Uuid,

    /// Change feed WebSocket URL (ws:// or wss://)
    #[arg(long, env = "PUSH_WS_URL")]
    pub push_ws_url: Option<String>,

    /// NATS configuration
    #[command(flatten)]
    pub nats: NatsArgs,

    /// JSON seed file to prime the cache with
    #[arg(long, env = "SEED_FILE")]
    pub seed_file: Option<PathBuf>,

    /// Capacity of the notification channel
    #[arg(long, env = "EVENT_BUFFER", default_value = "1000")]
    pub event_buffer: usize,

    /// Seconds between change feed reconnect attempts
    #[arg(long, env = "RECONNECT_DELAY_SECS", default_value = "5")]
    pub reconnect_delay_secs: u64,

    /// Maximum change feed reconnect attempts (0 = infinite)
    #[arg(long, env = "MAX_RECONNECT", default_value = "0")]
    pub max_reconnect: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    /// Seconds between statistics log lines (0 = off)
    #[arg(long, env = "STATS_INTERVAL_SECS", default_value = "60")]
    pub stats_interval_secs: u64,
}

/// NATS connection configuration
#[derive(Parser, Debug, Clone)]
pub struct NatsArgs {
    /// NATS server URL (unset = no NATS source)
    #[arg(long, env = "NATS_URL")]
    pub nats_url: Option<String>,

    /// Subject carrying change notifications
    #[arg(long, env = "NATS_SUBJECT", default_value = "backoffice.changes")]
    pub nats_subject: String,

    /// NATS username (optional)
    #[arg(long, env = "NATS_USER")]
    pub nats_user: Option<String>,

    /// NATS password (optional)
    #[arg(long, env = "NATS_PASSWORD")]
    pub nats_password: Option<String>,
}

impl Args {
    /// WebSocket source settings, if a change feed URL is configured
    pub fn ws_source_config(&self) -> Option<WsSourceConfig> {
        self.push_ws_url.as_ref().map(|url| WsSourceConfig {
            url: url.clone(),
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            max_reconnect_attempts: self.max_reconnect,
            ..WsSourceConfig::default()
        })
    }

    /// Name this session announces to NATS
    pub fn client_name(&self) -> String {
        format!("realtime-cache-{}", self.session_id)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.push_ws_url.is_none() && self.nats.nats_url.is_none() {
            return Err("one of PUSH_WS_URL or NATS_URL is required".to_string());
        }

        if let Some(url) = &self.push_ws_url {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(format!("PUSH_WS_URL must start with ws:// or wss://, got {}", url));
            }
        }

        if self.nats.nats_subject.trim().is_empty() {
            return Err("NATS_SUBJECT must not be empty".to_string());
        }

        if self.event_buffer == 0 {
            return Err("EVENT_BUFFER must be greater than zero".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("realtime-cache").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["--push-ws-url", "ws://localhost:9000/changes"]);
        assert_eq!(args.event_buffer, 1000);
        assert_eq!(args.log_level, "info");
        assert!(!args.log_json);
        assert!(args.validate().is_ok());

        let ws = args.ws_source_config().unwrap();
        assert_eq!(ws.url, "ws://localhost:9000/changes");
        assert_eq!(ws.reconnect_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_requires_a_source() {
        let args = parse(&[]);
        // NATS_URL / PUSH_WS_URL may be set in the environment running the tests
        if args.push_ws_url.is_none() && args.nats.nats_url.is_none() {
            assert!(args.validate().is_err());
        }
    }

    #[test]
    fn test_rejects_http_url() {
        let args = parse(&["--push-ws-url", "http://localhost/changes"]);
        assert!(args.validate().unwrap_err().contains("ws://"));
    }

    #[test]
    fn test_client_name_includes_session() {
        let args = parse(&[
            "--nats-url",
            "nats://127.0.0.1:4222",
            "--session-id",
            "6f9619ff-8b86-d011-b42d-00c04fc964ff",
        ]);
        assert_eq!(
            args.client_name(),
            "realtime-cache-6f9619ff-8b86-d011-b42d-00c04fc964ff"
        );
        assert!(args.validate().is_ok());
    }
}
