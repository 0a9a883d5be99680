//! Incremental synchronization
//!
//! A run lists the remote store, diffs the listing against the versioned
//! cache and fetches only what changed, under a concurrency policy.

pub mod orchestrator;
pub mod policy;

use crate::drive::DriveError;

pub use orchestrator::{RunSummary, SyncOrchestrator};
pub use policy::ConcurrencyPolicy;

/// Errors that fail a whole run
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Failed to list remote resources: {0}")]
    List(#[from] DriveError),
}
