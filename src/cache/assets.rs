//! Embedded Asset Cache
//!
//! Finds image URLs on the asset host inside exported documents, rewrites
//! them to references served by this daemon, and downloads each image once
//! into a local directory. Rewriting never waits on downloading: downloads are
//! queued to a background worker and their failures only reach the logs.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use moka::sync::Cache;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::CacheError;
use crate::drive::DriveError;

/// URLs on the document image host, with optional path and query
static ASSET_URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"https?://(?:www\.)?[-a-zA-Z0-9@:%._+~#=]{2,255}\.googleusercontent\.com(?:/[-a-zA-Z0-9@:%_+.~#?&/=]*)?",
    )
    .expect("asset URL pattern compiles")
});

/// How long a download claim may be held before it is considered abandoned
const CLAIM_TTL: Duration = Duration::from_secs(600);

/// Transport used to fetch asset bytes
#[async_trait]
pub trait AssetSource: Send + Sync {
    /// Issue a metadata request and return the HTTP status
    async fn probe(&self, url: &str) -> Result<u16, DriveError>;

    /// Stream the asset body into `sink`, returning the number of bytes written
    async fn download(
        &self,
        url: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, CacheError>;
}

/// Every distinct asset-host URL in `markup`, in sorted order
pub fn extract_asset_urls(markup: &str) -> BTreeSet<String> {
    ASSET_URL_REGEX
        .find_iter(markup)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Local key of an asset URL: the last `/`-separated segment of its path,
/// query included. `None` when the URL has no path or the segment could
/// escape the asset directory.
pub fn derive_key(url: &str) -> Option<&str> {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let (_, path) = without_scheme.split_once('/')?;
    let key = path.rsplit('/').next()?;
    match key {
        "" | "." | ".." => None,
        key => Some(key),
    }
}

/// Result of one caching attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetOutcome {
    /// Written to disk, with the byte count
    Downloaded(u64),
    /// A file with this key already exists
    AlreadyCached,
    /// Another task is downloading this key right now
    InFlight,
}

/// Download counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetStats {
    pub downloaded: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// On-disk store of embedded assets
pub struct AssetCache {
    /// Directory holding one file per asset key
    asset_dir: PathBuf,
    /// Base URL that rewritten references point at
    service_base: String,
    /// Where asset bytes come from
    source: Arc<dyn AssetSource>,
    /// Keys with a download currently running
    in_flight: Cache<String, ()>,
    downloaded: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

impl AssetCache {
    /// Create an asset cache rooted at `asset_dir`
    ///
    /// # Arguments
    /// * `asset_dir` - Directory to store downloaded assets (created if missing)
    /// * `service_base` - Base URL of the serving layer, used in rewritten markup
    /// * `source` - Transport used for probes and downloads
    pub fn new(
        asset_dir: PathBuf,
        service_base: &str,
        source: Arc<dyn AssetSource>,
    ) -> Result<Self, CacheError> {
        std::fs::create_dir_all(&asset_dir)?;

        let in_flight = Cache::builder()
            .time_to_live(CLAIM_TTL)
            .name("asset_downloads_in_flight")
            .build();

        info!(asset_dir = %asset_dir.display(), "Asset cache initialized");

        Ok(Self {
            asset_dir,
            service_base: service_base.trim_end_matches('/').to_string(),
            source,
            in_flight,
            downloaded: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    /// Path of an already downloaded asset, if present
    pub fn cached_path(&self, key: &str) -> Option<PathBuf> {
        if matches!(key, "" | "." | "..") || key.contains('/') {
            return None;
        }
        let path = self.asset_dir.join(key);
        path.is_file().then_some(path)
    }

    /// Replace every asset-host URL in `markup` with
    /// `<service base>/getImage?id=<key>`. Pure text transformation.
    pub fn rewrite_urls(&self, markup: &str) -> String {
        ASSET_URL_REGEX
            .replace_all(markup, |caps: &Captures| {
                let url = &caps[0];
                match derive_key(url) {
                    Some(key) => format!("{}/getImage?id={}", self.service_base, key),
                    None => url.to_string(),
                }
            })
            .into_owned()
    }

    /// Make sure the asset behind `url` is stored locally.
    ///
    /// Presence of a file named after the derived key is the only check, so
    /// two URLs sharing a last path segment share one file.
    pub async fn cache_asset(&self, url: &str) -> Result<AssetOutcome, CacheError> {
        let key = derive_key(url).ok_or_else(|| CacheError::InvalidAssetKey(url.to_string()))?;
        let path = self.asset_dir.join(key);

        if self.is_stored(&path).await {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            trace!(key = key, "Asset already cached");
            return Ok(AssetOutcome::AlreadyCached);
        }

        let claim = self.in_flight.entry(key.to_string()).or_insert(());
        if !claim.is_fresh() {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            trace!(key = key, "Asset download already in flight");
            return Ok(AssetOutcome::InFlight);
        }

        // A download that finished between the first check and the claim
        if self.is_stored(&path).await {
            self.in_flight.invalidate(key);
            self.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(AssetOutcome::AlreadyCached);
        }

        let result = self.download_into(url, &path).await;
        self.in_flight.invalidate(key);

        match result {
            Ok(size) => {
                self.downloaded.fetch_add(1, Ordering::Relaxed);
                info!(key = key, size = size, "Cached asset");
                Ok(AssetOutcome::Downloaded(size))
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Background variant of [`cache_asset`](Self::cache_asset): failures are logged only
    pub async fn cache_asset_logged(&self, url: &str) {
        if let Err(e) = self.cache_asset(url).await {
            warn!(url = url, error = %e, "Asset download failed");
        }
    }

    async fn is_stored(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    /// Probe, then stream the body into a temp file and move it into place
    async fn download_into(&self, url: &str, path: &Path) -> Result<u64, CacheError> {
        let status = self
            .source
            .probe(url)
            .await
            .map_err(|source| CacheError::AssetDownload {
                url: url.to_string(),
                source,
            })?;

        if !(200..300).contains(&status) {
            return Err(CacheError::AssetDownload {
                url: url.to_string(),
                source: DriveError::from_status(status, "asset probe rejected"),
            });
        }

        let tmp = tempfile::NamedTempFile::new_in(&self.asset_dir)?;
        let mut file = tokio::fs::File::from_std(tmp.reopen()?);
        let size = self.source.download(url, &mut file).await?;
        file.flush().await?;
        drop(file);

        tmp.persist(path).map_err(|e| CacheError::Io(e.error))?;
        debug!(url = url, local = %path.display(), "Stored asset");
        Ok(size)
    }

    /// Get download counters
    pub fn stats(&self) -> AssetStats {
        AssetStats {
            downloaded: self.downloaded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Log current asset metrics
    pub fn log_metrics(&self) {
        let stats = self.stats();
        debug!(
            downloaded = stats.downloaded,
            skipped = stats.skipped,
            failed = stats.failed,
            in_flight = self.in_flight.entry_count(),
            "Asset cache metrics"
        );
    }

    /// Start the background worker that drains `queue`.
    ///
    /// At most `max_downloads` downloads run at once. The worker exits once
    /// every [`AssetQueue`] handle is dropped and running downloads finish.
    pub fn spawn_worker(
        self: Arc<Self>,
        mut queue: mpsc::UnboundedReceiver<String>,
        max_downloads: usize,
    ) -> JoinHandle<()> {
        let width = max_downloads.max(1);

        tokio::spawn(async move {
            let permits = Arc::new(Semaphore::new(width));

            while let Some(url) = queue.recv().await {
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };
                let cache = Arc::clone(&self);
                tokio::spawn(async move {
                    let _permit = permit;
                    cache.cache_asset_logged(&url).await;
                });
            }

            // Wait for running downloads before reporting
            let _ = permits.acquire_many(width as u32).await;
            self.log_metrics();
            debug!("Asset worker stopped");
        })
    }
}

/// Submission handle for background asset downloads
#[derive(Clone)]
pub struct AssetQueue {
    tx: mpsc::UnboundedSender<String>,
}

impl AssetQueue {
    /// Create a queue and the receiver a worker drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a download; never waits
    pub fn submit(&self, url: String) {
        if let Err(e) = self.tx.send(url) {
            warn!(url = %e.0, "Asset worker is gone, dropping download");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Asset host stand-in counting requests
    struct MockAssets {
        status: u16,
        body: Vec<u8>,
        delay: Duration,
        probes: AtomicUsize,
        downloads: AtomicUsize,
    }

    impl MockAssets {
        fn new(status: u16, body: &[u8]) -> Self {
            Self {
                status,
                body: body.to_vec(),
                delay: Duration::ZERO,
                probes: AtomicUsize::new(0),
                downloads: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AssetSource for MockAssets {
        async fn probe(&self, _url: &str) -> Result<u16, DriveError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            Ok(self.status)
        }

        async fn download(
            &self,
            _url: &str,
            sink: &mut (dyn AsyncWrite + Unpin + Send),
        ) -> Result<u64, CacheError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            sink.write_all(&self.body).await?;
            Ok(self.body.len() as u64)
        }
    }

    fn asset_cache(source: Arc<MockAssets>) -> (tempfile::TempDir, AssetCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache =
            AssetCache::new(dir.path().join("assets"), "https://proxy.example/api/v1/", source)
                .unwrap();
        (dir, cache)
    }

    #[test]
    fn test_extract_deduplicates() {
        let markup = r#"<img src="https://lh3.googleusercontent.com/abc123?sz=w100">
            <img src="https://lh3.googleusercontent.com/abc123?sz=w100">
            <img src="https://lh4.googleusercontent.com/def">
            <a href="https://example.com/abc">x</a>"#;
        let urls = extract_asset_urls(markup);
        assert_eq!(urls.len(), 2);
        assert!(urls.contains("https://lh3.googleusercontent.com/abc123?sz=w100"));
        assert!(urls.contains("https://lh4.googleusercontent.com/def"));
    }

    #[test]
    fn test_extract_empty() {
        assert!(extract_asset_urls("").is_empty());
        assert!(extract_asset_urls("<p>no images here</p>").is_empty());
    }

    #[test]
    fn test_derive_key() {
        assert_eq!(
            derive_key("https://lh3.googleusercontent.com/abc123?sz=w100"),
            Some("abc123?sz=w100")
        );
        assert_eq!(derive_key("https://lh3.googleusercontent.com/a/b/c"), Some("c"));
        assert_eq!(derive_key("https://lh3.googleusercontent.com"), None);
        assert_eq!(derive_key("https://lh3.googleusercontent.com/"), None);
        assert_eq!(derive_key("https://lh3.googleusercontent.com/x/.."), None);
    }

    #[test]
    fn test_rewrite_urls() {
        let (_dir, cache) = asset_cache(Arc::new(MockAssets::new(200, b"")));
        let markup = r#"<p>Hello</p><img src="https://lh3.googleusercontent.com/abc123?sz=w100"><a href="https://example.com/x">link</a>"#;
        let rewritten = cache.rewrite_urls(markup);

        assert!(rewritten.contains("/getImage?id=abc123?sz=w100"));
        assert!(rewritten
            .contains(r#"<img src="https://proxy.example/api/v1/getImage?id=abc123?sz=w100">"#));
        assert!(rewritten.starts_with("<p>Hello</p>"));
        assert!(rewritten.ends_with(r#"<a href="https://example.com/x">link</a>"#));
        assert!(!rewritten.contains("googleusercontent"));
    }

    #[test]
    fn test_rewrite_leaves_plain_text_alone() {
        let (_dir, cache) = asset_cache(Arc::new(MockAssets::new(200, b"")));
        let markup = "<p>googleusercontent.com is mentioned, https://example.org/a too</p>";
        assert_eq!(cache.rewrite_urls(markup), markup);
    }

    #[tokio::test]
    async fn test_cache_asset_twice_downloads_once() {
        let source = Arc::new(MockAssets::new(200, b"png-bytes"));
        let (_dir, cache) = asset_cache(Arc::clone(&source));
        let url = "https://lh3.googleusercontent.com/abc123?sz=w100";

        assert_eq!(cache.cache_asset(url).await.unwrap(), AssetOutcome::Downloaded(9));
        assert_eq!(cache.cache_asset(url).await.unwrap(), AssetOutcome::AlreadyCached);

        assert_eq!(source.downloads.load(Ordering::SeqCst), 1);
        let path = cache.cached_path("abc123?sz=w100").unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"png-bytes");
        assert_eq!(
            cache.stats(),
            AssetStats {
                downloaded: 1,
                skipped: 1,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn test_concurrent_requests_download_once() {
        let mut mock = MockAssets::new(200, b"data");
        mock.delay = Duration::from_millis(100);
        let source = Arc::new(mock);
        let (_dir, cache) = asset_cache(Arc::clone(&source));
        let url = "https://lh3.googleusercontent.com/shared";

        let (a, b) = tokio::join!(cache.cache_asset(url), cache.cache_asset(url));
        let outcomes = [a.unwrap(), b.unwrap()];

        assert!(outcomes.contains(&AssetOutcome::Downloaded(4)));
        assert!(outcomes.contains(&AssetOutcome::InFlight));
        assert_eq!(source.downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_probe_skips_download() {
        let source = Arc::new(MockAssets::new(404, b"never"));
        let (_dir, cache) = asset_cache(Arc::clone(&source));
        let url = "https://lh3.googleusercontent.com/missing";

        let err = cache.cache_asset(url).await.unwrap_err();
        assert!(matches!(err, CacheError::AssetDownload { .. }));
        assert_eq!(source.downloads.load(Ordering::SeqCst), 0);
        assert!(cache.cached_path("missing").is_none());

        // The claim is released, so a later attempt probes again
        let _ = cache.cache_asset(url).await;
        assert_eq!(source.probes.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().failed, 2);
    }

    #[tokio::test]
    async fn test_invalid_key_is_rejected() {
        let source = Arc::new(MockAssets::new(200, b""));
        let (_dir, cache) = asset_cache(Arc::clone(&source));
        let err = cache
            .cache_asset("https://lh3.googleusercontent.com/..")
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidAssetKey(_)));
        assert_eq!(source.probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_worker_drains_queue() {
        let source = Arc::new(MockAssets::new(200, b"img"));
        let (_dir, cache) = asset_cache(Arc::clone(&source));
        let cache = Arc::new(cache);

        let (queue, rx) = AssetQueue::channel();
        let worker = Arc::clone(&cache).spawn_worker(rx, 2);

        queue.submit("https://lh3.googleusercontent.com/one".to_string());
        queue.submit("https://lh3.googleusercontent.com/two".to_string());
        queue.submit("https://lh3.googleusercontent.com/one".to_string());
        drop(queue);

        worker.await.unwrap();

        assert!(cache.cached_path("one").is_some());
        assert!(cache.cached_path("two").is_some());
        assert_eq!(source.downloads.load(Ordering::SeqCst), 2);
    }
}
