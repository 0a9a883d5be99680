//! Caching layer
//!
//! Two stores live here: the versioned resource cache that drives staleness
//! decisions, and the on-disk store of embedded assets (images) referenced by
//! exported documents.

pub mod assets;
pub mod versioned;

use std::path::PathBuf;

use crate::drive::DriveError;

pub use assets::{AssetCache, AssetQueue, AssetSource};
pub use versioned::{CacheEntry, Payload, Row, SnapshotGuard, VersionedCache};

/// Errors from the local stores
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Failed to read cache snapshot {path}: {reason}")]
    StoreRead { path: PathBuf, reason: String },

    #[error("Failed to write cache snapshot {path}: {reason}")]
    StoreWrite { path: PathBuf, reason: String },

    #[error("Failed to download asset {url}")]
    AssetDownload {
        url: String,
        #[source]
        source: DriveError,
    },

    #[error("Asset URL has no usable file name: {0}")]
    InvalidAssetKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
