use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{ConcurrencyPolicy, SyncError};
use crate::cache::{CacheEntry, VersionedCache};
use crate::drive::ResourceDescriptor;
use crate::fetch::ResourceFetcher;

/// Counters of one completed run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub listed: usize,
    pub stale: usize,
    pub fetched: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Commit {
    /// New payload stored at the listed version
    Fresh,
    /// Fetch failed; whatever was cached before stays
    Retained,
}

/// Drives list, diff, fetch and commit for every run
pub struct SyncOrchestrator {
    fetcher: Arc<ResourceFetcher>,
    cache: Arc<VersionedCache>,
    policy: ConcurrencyPolicy,
    /// Held for the whole of a run so runs never overlap
    run_gate: Mutex<()>,
    last_run: RwLock<Option<RunSummary>>,
}

impl SyncOrchestrator {
    pub fn new(
        fetcher: Arc<ResourceFetcher>,
        cache: Arc<VersionedCache>,
        policy: ConcurrencyPolicy,
    ) -> Self {
        Self {
            fetcher,
            cache,
            policy,
            run_gate: Mutex::new(()),
            last_run: RwLock::new(None),
        }
    }

    pub fn cache(&self) -> &Arc<VersionedCache> {
        &self.cache
    }

    pub fn fetcher(&self) -> &Arc<ResourceFetcher> {
        &self.fetcher
    }

    /// Counters of the most recent completed run
    pub fn last_run(&self) -> Option<RunSummary> {
        *self.last_run.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bring the cache up to date with the remote store.
    ///
    /// `scope` restricts the listing to one shared drive. Only a listing
    /// failure fails the run; per-resource failures are logged and leave the
    /// previous entry in place. Concurrent callers queue behind the running
    /// sync and then diff against its results.
    ///
    /// Returns the full cache mapping after the run.
    pub async fn run_sync(
        &self,
        scope: Option<&str>,
    ) -> Result<BTreeMap<String, CacheEntry>, SyncError> {
        let _gate = self.run_gate.lock().await;
        let started = Instant::now();
        info!(scope = scope.unwrap_or("all"), "Starting sync run");

        let listing = match self.fetcher.store().list_all(scope).await {
            Ok(listing) => listing,
            Err(e) => {
                error!(error = %e, "Sync run aborted: listing failed");
                return Err(SyncError::List(e));
            }
        };

        let stale: Vec<&ResourceDescriptor> =
            listing.iter().filter(|d| self.is_stale(d)).collect();
        let width = self.policy.width_for(stale.len());
        debug!(
            listed = listing.len(),
            stale = stale.len(),
            width = width,
            "Diffed listing against cache"
        );

        // Futures are lazy; at most `width` of them are polled at a time
        let pending: Vec<_> = stale
            .iter()
            .map(|descriptor| self.fetch_and_commit(descriptor, &listing))
            .collect();
        let commits: Vec<Commit> = stream::iter(pending)
            .buffer_unordered(width)
            .collect()
            .await;

        let fetched = commits.iter().filter(|c| **c == Commit::Fresh).count();
        let summary = RunSummary {
            listed: listing.len(),
            stale: stale.len(),
            fetched,
            failed: stale.len() - fetched,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            listed = summary.listed,
            stale = summary.stale,
            fetched = summary.fetched,
            failed = summary.failed,
            elapsed_ms = summary.elapsed_ms,
            "Sync run complete"
        );
        *self.last_run.write().unwrap_or_else(PoisonError::into_inner) = Some(summary);

        Ok(self.cache.contents())
    }

    /// Stale when never cached, when the remote version is unknown, or when
    /// the cached version is strictly older
    fn is_stale(&self, descriptor: &ResourceDescriptor) -> bool {
        match (descriptor.version, self.cache.version_of(&descriptor.id)) {
            (Some(remote), Some(cached)) => cached < remote,
            _ => true,
        }
    }

    async fn fetch_and_commit(
        &self,
        descriptor: &ResourceDescriptor,
        listing: &[ResourceDescriptor],
    ) -> Commit {
        match self.fetcher.fetch(descriptor, listing).await {
            Ok(payload) => {
                let version = descriptor.version.unwrap_or(i64::MIN);
                self.cache.put(&descriptor.id, version, payload);
                Commit::Fresh
            }
            Err(e) => {
                warn!(
                    id = %descriptor.id,
                    name = %descriptor.name,
                    cached_version = ?self.cache.version_of(&descriptor.id),
                    error = %e,
                    "Fetch failed, keeping cached entry"
                );
                Commit::Retained
            }
        }
    }
}
