//! Surgical cache patching from change notifications
//!
//! The [`registry`] says where each entity type is cached; the [`engine`]
//! decides per notification whether to patch in place, ignore it as stale,
//! or hand back canonical keys for invalidation.

pub mod engine;
pub mod registry;

pub use engine::{EngineStats, PatchEngine, PatchOutcome, PatchState};
pub use registry::{PatchHandler, PatchRegistry, PatchRegistryBuilder, DEFAULT_IDENTITY_FIELD};
