//! realtime-cache daemon
//!
//! Connects to the configured push sources and keeps a query cache in sync.
//! Keys needing a refetch are logged for the embedding fetch layer.

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use realtime_cache::{
    cache::{self, spawn_cleanup_task, CacheConfig, QueryCache},
    canonical::CanonicalRegistry,
    config::Args,
    invalidate::Invalidator,
    logging,
    patch::{PatchEngine, PatchRegistry},
    sync::{spawn_sync_task, spawn_ws_source, NatsSource, SyncService},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    logging::init(&args.log_level, args.log_json)?;

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let cache_config = CacheConfig::from_env();

    info!("======================================");
    info!("  realtime-cache");
    info!("======================================");
    info!("Session: {}", args.session_id);
    info!("Change feed: {}", args.push_ws_url.as_deref().unwrap_or("(none)"));
    info!(
        "NATS: {} ({})",
        args.nats.nats_url.as_deref().unwrap_or("(none)"),
        args.nats.nats_subject
    );
    info!("Cache: max {} entries, ttl {:?}", cache_config.max_entries, cache_config.ttl);
    info!("======================================");

    let store = Arc::new(QueryCache::new(cache_config));

    if let Some(path) = &args.seed_file {
        let entries = cache::load_seed_file(path)?;
        cache::prime(&store, entries);
    }

    let patch_registry = Arc::new(PatchRegistry::standard());
    info!("Patch handlers: {}", patch_registry.entity_types().join(", "));

    let engine = Arc::new(PatchEngine::new(patch_registry));
    let invalidator = Invalidator::new(Arc::new(CanonicalRegistry::standard()), store.clone());
    let service = Arc::new(SyncService::new(engine, invalidator, store.clone()));

    let (notification_tx, notification_rx) = broadcast::channel(args.event_buffer);
    let sync_handle = spawn_sync_task(service.clone(), notification_rx);
    let cleanup_handle = spawn_cleanup_task(store.clone());

    // Refetch requests; the fetch layer that embeds this crate subscribes the same way
    let mut refetch_rx = store.subscribe_refetch();
    let refetch_handle = tokio::spawn(async move {
        loop {
            match refetch_rx.recv().await {
                Ok(key) => debug!(key = %key, "Refetch requested"),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Refetch log lagged {} keys", n)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let ws = args
        .ws_source_config()
        .map(|config| spawn_ws_source(config, notification_tx.clone()));

    let nats_handle = if args.nats.nats_url.is_some() {
        match NatsSource::connect(&args.nats, &args.client_name(), notification_tx.clone()).await {
            Ok(source) => {
                let shutdown_rx = service.shutdown_receiver();
                Some(tokio::spawn(async move {
                    if let Err(e) = source.run(shutdown_rx).await {
                        error!("NATS source failed: {}", e);
                    }
                }))
            }
            Err(e) => {
                if ws.is_some() {
                    warn!("NATS connection failed (continuing with WebSocket feed): {}", e);
                    None
                } else {
                    error!("NATS connection failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
    } else {
        None
    };

    let stats_handle = (args.stats_interval_secs > 0).then(|| {
        let service = service.clone();
        let store = store.clone();
        let interval = Duration::from_secs(args.stats_interval_secs);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let sync = service.stats();
                let engine = service.engine().stats();
                let cache = store.stats();
                info!(
                    received = sync.received,
                    malformed = sync.malformed,
                    applied = engine.applied,
                    stale = engine.stale,
                    fallbacks = engine.fallbacks,
                    invalidated = sync.invalidated,
                    entries = cache.entries,
                    stale_entries = cache.stale,
                    "Sync statistics"
                );
            }
        })
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    if let Some((source, handle)) = ws {
        source.shutdown();
        let _ = handle.await;
    }
    service.shutdown();
    if let Some(handle) = nats_handle {
        let _ = handle.await;
    }
    let _ = sync_handle.await;

    cleanup_handle.abort();
    refetch_handle.abort();
    if let Some(handle) = stats_handle {
        handle.abort();
    }

    info!("realtime-cache stopped");
    Ok(())
}
