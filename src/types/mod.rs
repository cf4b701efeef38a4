//! Shared types for realtime-cache

pub mod error;

pub use error::{PatchError, Result, SyncError};
