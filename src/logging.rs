//! Logging setup
//!
//! `RUST_LOG` overrides the configured level when set.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::types::{Result, SyncError};

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("realtime_cache={},info", level).into())
}

/// Install the global subscriber
pub fn init(level: &str, json: bool) -> Result<()> {
    let registry = tracing_subscriber::registry().with(filter(level));

    let installed = if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    installed.map_err(|e| SyncError::Config(format!("logging already initialized: {}", e)))
}
