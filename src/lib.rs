//! realtime-cache - session read cache kept consistent by server pushes
//!
//! Other users editing shared back-office data (acts, work logs, projects,
//! clients, warehouses, documents, drafts) produce change notifications.
//! This crate consumes them and keeps a local query cache correct without
//! polling.
//!
//! ## Components
//!
//! - **Cache**: query results keyed by structured [`cache::QueryKey`]s
//! - **Patch**: per entity-type handlers and the patch engine that merges,
//!   deletes or creates records in place, rejecting out-of-order updates
//! - **Canonical**: resolution of `module:entity:action[:id]` keys to cache
//!   locations, degrading to a full invalidation for unknown keys
//! - **Invalidate**: dispatch of resolved locations to the cache
//! - **Presence**: what the user is looking at, for the presence channel
//! - **Sync**: push sources and the single consumer task

pub mod cache;
pub mod canonical;
pub mod config;
pub mod invalidate;
pub mod logging;
pub mod notification;
pub mod patch;
pub mod presence;
pub mod sync;
pub mod types;

pub use cache::{CacheConfig, CacheLocation, CacheStore, QueryCache, QueryKey};
pub use canonical::{CanonicalKey, CanonicalRegistry};
pub use config::Args;
pub use invalidate::Invalidator;
pub use notification::{ChangeNotification, PatchOp, RawNotification};
pub use patch::{PatchEngine, PatchOutcome, PatchRegistry, PatchState};
pub use presence::{build_presence, PresenceContext, PresenceMode};
pub use sync::SyncService;
pub use types::{Result, SyncError};
