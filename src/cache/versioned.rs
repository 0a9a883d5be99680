//! Versioned Resource Cache
//!
//! Maps each remote resource ID to the last version synchronized and the
//! normalized payload fetched at that version. The pair is only ever replaced
//! together. The whole mapping is persisted as one JSON snapshot.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::CacheError;
use crate::drive::ResourceDescriptor;

/// One spreadsheet row keyed by the sheet's header cells
pub type Row = BTreeMap<String, String>;

/// Normalized content of a resource, shaped by its kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum Payload {
    /// Children of a folder, sorted by name
    Container(Vec<ResourceDescriptor>),
    /// Rows of every sheet, keyed by sheet title
    Table(BTreeMap<String, Vec<Row>>),
    /// Exported html with asset URLs rewritten to local references
    RichText { html: String },
}

/// A cached payload together with the version it was fetched at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    version: i64,
    payload: Payload,
}

impl CacheEntry {
    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }
}

/// Resource cache shared by the sync engine and the serving layer
pub struct VersionedCache {
    /// Where snapshots are read from and written to
    snapshot_path: PathBuf,
    /// Entries by resource ID
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl VersionedCache {
    /// Create an empty cache that snapshots to `snapshot_path`
    pub fn new(snapshot_path: PathBuf) -> Self {
        Self {
            snapshot_path,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Create a cache and populate it from the snapshot on disk, if any.
    ///
    /// An unreadable snapshot is logged and the cache starts empty.
    pub fn open(snapshot_path: PathBuf) -> Self {
        let cache = Self::new(snapshot_path);
        match cache.load_from_durable_store() {
            Ok(count) => {
                info!(
                    path = %cache.snapshot_path.display(),
                    entries = count,
                    "Resource cache initialized"
                );
            }
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable cache snapshot, starting empty");
            }
        }
        cache
    }

    /// Replace the in-memory mapping with the snapshot on disk.
    ///
    /// A missing snapshot is not an error; the cache is left as is and 0 is
    /// returned. Returns the number of entries loaded.
    pub fn load_from_durable_store(&self) -> Result<usize, CacheError> {
        let read_error = |reason: String| CacheError::StoreRead {
            path: self.snapshot_path.clone(),
            reason,
        };

        let bytes = match fs::read(&self.snapshot_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.snapshot_path.display(), "No cache snapshot found");
                return Ok(0);
            }
            Err(e) => return Err(read_error(e.to_string())),
        };

        let loaded: HashMap<String, CacheEntry> =
            serde_json::from_slice(&bytes).map_err(|e| read_error(e.to_string()))?;
        let count = loaded.len();

        *self.entries.write().unwrap_or_else(PoisonError::into_inner) = loaded;
        debug!(entries = count, "Cache snapshot loaded");
        Ok(count)
    }

    /// Write the whole mapping to disk.
    ///
    /// Writes to a temp file in the same directory and renames it into place.
    pub fn snapshot_to_durable_store(&self) -> Result<(), CacheError> {
        let write_error = |reason: String| CacheError::StoreWrite {
            path: self.snapshot_path.clone(),
            reason,
        };

        let json = serde_json::to_vec(&self.contents()).map_err(|e| write_error(e.to_string()))?;

        let parent = self
            .snapshot_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        fs::create_dir_all(parent).map_err(|e| write_error(e.to_string()))?;

        let mut tmp =
            tempfile::NamedTempFile::new_in(parent).map_err(|e| write_error(e.to_string()))?;
        tmp.write_all(&json).map_err(|e| write_error(e.to_string()))?;
        tmp.persist(&self.snapshot_path)
            .map_err(|e| write_error(e.error.to_string()))?;

        info!(
            path = %self.snapshot_path.display(),
            size = json.len(),
            "Cache stored to snapshot"
        );
        Ok(())
    }

    /// Look up the entry for a resource
    pub fn get(&self, id: &str) -> Option<CacheEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Version of the cached entry for a resource, without cloning its payload
    pub fn version_of(&self, id: &str) -> Option<i64> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|entry| entry.version)
    }

    /// Store `payload` at `version`, replacing any previous entry.
    ///
    /// Does not check that `version` is newer; that is the caller's decision.
    pub fn put(&self, id: &str, version: i64, payload: Payload) -> CacheEntry {
        let entry = CacheEntry { version, payload };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), entry.clone());
        debug!(id = id, version = version, "Cached resource");
        entry
    }

    /// Copy of the whole mapping, ordered by resource ID
    pub fn contents(&self) -> BTreeMap<String, CacheEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Writes a snapshot of the cache when dropped.
///
/// Hold one for the lifetime of the process so the cache is flushed on
/// every exit path out of `main`, including early error returns.
pub struct SnapshotGuard {
    cache: Arc<VersionedCache>,
}

impl SnapshotGuard {
    pub fn new(cache: Arc<VersionedCache>) -> Self {
        Self { cache }
    }
}

impl Drop for SnapshotGuard {
    fn drop(&mut self) {
        if let Err(e) = self.cache.snapshot_to_durable_store() {
            error!(error = %e, "Failed to write cache snapshot");
        }
    }
}
