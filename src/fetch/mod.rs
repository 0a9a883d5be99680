//! Resource fetching
//!
//! Turns one remote resource into its normalized cache payload. The kind of
//! the resource picks the strategy at a single dispatch point.

pub mod table;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::cache::assets::extract_asset_urls;
use crate::cache::{AssetCache, AssetQueue, Payload, Row};
use crate::drive::{DriveError, RemoteStore, ResourceDescriptor, ResourceKind};

/// Per-resource fetch failures
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Unsupported resource kind: {0}")]
    UnsupportedResourceKind(String),

    #[error("Remote fetch failed: {0}")]
    Remote(#[from] DriveError),
}

/// Fetches and normalizes resources of every supported kind
pub struct ResourceFetcher {
    store: Arc<dyn RemoteStore>,
    assets: Arc<AssetCache>,
    queue: AssetQueue,
}

impl ResourceFetcher {
    /// # Arguments
    /// * `store` - Remote store to read from
    /// * `assets` - Asset cache used to rewrite document markup
    /// * `queue` - Where asset downloads found in documents are submitted
    pub fn new(store: Arc<dyn RemoteStore>, assets: Arc<AssetCache>, queue: AssetQueue) -> Self {
        Self {
            store,
            assets,
            queue,
        }
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    pub fn assets(&self) -> &Arc<AssetCache> {
        &self.assets
    }

    /// Fetch the payload of `descriptor`.
    ///
    /// `siblings` is the full listing the descriptor came from; folders are
    /// resolved against it without any remote call.
    pub async fn fetch(
        &self,
        descriptor: &ResourceDescriptor,
        siblings: &[ResourceDescriptor],
    ) -> Result<Payload, FetchError> {
        match &descriptor.kind {
            ResourceKind::Container => Ok(fetch_container(&descriptor.id, siblings)),
            ResourceKind::Table => self.fetch_table(&descriptor.id).await,
            ResourceKind::RichText => {
                let html = self.fetch_rich_text(&descriptor.id).await?;
                Ok(Payload::RichText { html })
            }
            ResourceKind::Unrecognized(mime) => {
                Err(FetchError::UnsupportedResourceKind(mime.clone()))
            }
        }
    }

    /// All sheets of a spreadsheet, read in one batched call
    async fn fetch_table(&self, id: &str) -> Result<Payload, FetchError> {
        let names = self.store.fetch_table_names(id).await?;
        if names.is_empty() {
            debug!(spreadsheet = id, "Spreadsheet has no sheets");
            return Ok(Payload::Table(BTreeMap::new()));
        }

        let ranges = self.store.fetch_tables(id, &names).await?;
        let tables = table::fold_tables(ranges);
        debug!(spreadsheet = id, sheets = tables.len(), "Fetched spreadsheet");
        Ok(Payload::Table(tables))
    }

    /// Exported html with asset URLs rewritten; downloads are queued, not awaited
    pub async fn fetch_rich_text(&self, id: &str) -> Result<String, FetchError> {
        let html = self.store.fetch_rich_text(id).await?;
        let rewritten = self.assets.rewrite_urls(&html);

        for url in extract_asset_urls(&html) {
            trace!(document = id, url = %url, "Queueing asset download");
            self.queue.submit(url);
        }

        Ok(rewritten)
    }

    /// Rows of a single A1 range, folded by its header row
    pub async fn fetch_range(&self, id: &str, range: &str) -> Result<Vec<Row>, FetchError> {
        let values = self.store.fetch_range(id, range).await?;
        Ok(table::transform_rows(&values.values))
    }
}

/// Children of `id` among `siblings`, sorted by name
fn fetch_container(id: &str, siblings: &[ResourceDescriptor]) -> Payload {
    let mut children: Vec<ResourceDescriptor> = siblings
        .iter()
        .filter(|s| s.has_parent(id))
        .cloned()
        .collect();
    children.sort_by(|a, b| a.name.cmp(&b.name));
    Payload::Container(children)
}

/// Fetcher over `store` with an asset cache in a fresh temp dir.
/// The returned receiver sees every queued asset URL.
#[cfg(test)]
pub fn test_fetcher(
    store: Arc<dyn RemoteStore>,
) -> (
    tempfile::TempDir,
    ResourceFetcher,
    tokio::sync::mpsc::UnboundedReceiver<String>,
) {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(crate::drive::DriveClient::new("unused").unwrap());
    let assets = Arc::new(
        AssetCache::new(dir.path().join("assets"), "https://proxy.example/api/v1", source)
            .unwrap(),
    );
    let (queue, rx) = AssetQueue::channel();
    (dir, ResourceFetcher::new(store, assets, queue), rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::mock::{descriptor, MockDrive};
    use crate::drive::ValueRange;
    use serde_json::json;

    #[tokio::test]
    async fn test_container_children_sorted() {
        let (_dir, fetcher, _rx) = test_fetcher(Arc::new(MockDrive::new()));
        let listing = vec![
            descriptor("root", "Site", ResourceKind::Container, 1, &[]),
            descriptor("d2", "Zebra", ResourceKind::RichText, 1, &["root"]),
            descriptor("d1", "Apple", ResourceKind::RichText, 1, &["root", "other"]),
            descriptor("d3", "Elsewhere", ResourceKind::RichText, 1, &["other"]),
        ];

        let payload = fetcher.fetch(&listing[0], &listing).await.unwrap();
        let Payload::Container(children) = payload else {
            panic!("Expected container payload");
        };
        let names: Vec<&str> = children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Apple", "Zebra"]);
    }

    #[tokio::test]
    async fn test_empty_container() {
        let (_dir, fetcher, _rx) = test_fetcher(Arc::new(MockDrive::new()));
        let folder = descriptor("lonely", "Lonely", ResourceKind::Container, 1, &[]);
        let payload = fetcher.fetch(&folder, &[folder.clone()]).await.unwrap();
        assert_eq!(payload, Payload::Container(vec![]));
    }

    #[tokio::test]
    async fn test_table_fetch() {
        let drive = Arc::new(MockDrive::new());
        drive.add_spreadsheet(
            "sheet",
            1,
            vec![ValueRange {
                range: "Sheet1!A1:B3".to_string(),
                values: serde_json::from_value(json!([["a", "b"], ["1", "2"], ["3", "4"]]))
                    .unwrap(),
            }],
        );
        let (_dir, fetcher, _rx) = test_fetcher(drive.clone());
        let listing = drive.list_all(None).await.unwrap();

        let payload = fetcher.fetch(&listing[0], &listing).await.unwrap();
        let Payload::Table(tables) = payload else {
            panic!("Expected table payload");
        };
        let rows = &tables["Sheet1"];
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["a"], "1");
        assert_eq!(rows[0]["b"], "2");
        assert_eq!(rows[1]["a"], "3");
        assert_eq!(rows[1]["b"], "4");
    }

    #[tokio::test]
    async fn test_rich_text_rewrites_and_queues_assets() {
        let drive = Arc::new(MockDrive::new());
        drive.add_document(
            "doc",
            1,
            r#"<p>Hi</p><img src="https://lh3.googleusercontent.com/abc123?sz=w100"><img src="https://lh3.googleusercontent.com/abc123?sz=w100">"#,
        );
        let (_dir, fetcher, mut rx) = test_fetcher(drive.clone());
        let listing = drive.list_all(None).await.unwrap();

        let payload = fetcher.fetch(&listing[0], &listing).await.unwrap();
        let Payload::RichText { html } = payload else {
            panic!("Expected rich text payload");
        };
        assert!(html.contains("https://proxy.example/api/v1/getImage?id=abc123?sz=w100"));
        assert!(html.starts_with("<p>Hi</p>"));

        assert_eq!(
            rx.try_recv().unwrap(),
            "https://lh3.googleusercontent.com/abc123?sz=w100"
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unrecognized_kind_fails() {
        let (_dir, fetcher, _rx) = test_fetcher(Arc::new(MockDrive::new()));
        let pdf = descriptor(
            "pdf",
            "Brochure",
            ResourceKind::Unrecognized("application/pdf".to_string()),
            1,
            &[],
        );
        let err = fetcher.fetch(&pdf, &[pdf.clone()]).await.unwrap_err();
        assert!(matches!(err, FetchError::UnsupportedResourceKind(m) if m == "application/pdf"));
    }

    #[tokio::test]
    async fn test_remote_failure_is_fetch_error() {
        let drive = Arc::new(MockDrive::new());
        drive.add_document("doc", 1, "<p></p>");
        drive.fail_fetch("doc");
        let (_dir, fetcher, _rx) = test_fetcher(drive.clone());
        let listing = drive.list_all(None).await.unwrap();

        let err = fetcher.fetch(&listing[0], &listing).await.unwrap_err();
        assert!(matches!(err, FetchError::Remote(DriveError::Server(500, _))));
    }

    #[tokio::test]
    async fn test_fetch_range_rows() {
        let drive = Arc::new(MockDrive::new());
        drive.add_spreadsheet(
            "sheet",
            1,
            vec![ValueRange {
                range: "Hours!A1:B2".to_string(),
                values: serde_json::from_value(json!([["day", "open"], ["Mon", "9"]])).unwrap(),
            }],
        );
        let (_dir, fetcher, _rx) = test_fetcher(drive);
        let rows = fetcher.fetch_range("sheet", "Hours").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["day"], "Mon");
    }
}
