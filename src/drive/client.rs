//! Google Drive API Client
//!
//! Provides token-authenticated access to Drive v3 (listing, export) and
//! Sheets v4 (sheet titles, cell values), plus plain downloads of embedded assets.

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::errors::DriveError;
use super::types::{
    BatchGetResponse, ListFilesResponse, ResourceDescriptor, SpreadsheetResponse, ValueRange,
};
use super::RemoteStore;
use crate::cache::assets::AssetSource;
use crate::cache::CacheError;

/// Drive v3 REST base URL
const DRIVE_API_URL: &str = "https://www.googleapis.com/drive/v3";

/// Sheets v4 REST base URL
const SHEETS_API_URL: &str = "https://sheets.googleapis.com/v4";

/// HTTP client timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Files requested per listing page
const PAGE_SIZE: u32 = 100;

/// Fields requested for each listed file
const LIST_FIELDS: &str = "nextPageToken, files(id, name, version, mimeType, parents)";

/// Maximum number of recent errors to track
const MAX_ERROR_HISTORY: usize = 10;

/// Health status values
pub const HEALTH_HEALTHY: u8 = 0;
pub const HEALTH_DEGRADED: u8 = 1;
pub const HEALTH_UNHEALTHY: u8 = 2;

/// A recent error entry for tracking
#[derive(Debug, Clone)]
pub struct ErrorEntry {
    pub timestamp: u64,
    pub operation: String,
    pub target: String,
    pub error: String,
}

/// Drive API client for making authenticated requests
#[derive(Clone)]
pub struct DriveClient {
    /// HTTP client for making requests
    http_client: Client,
    /// Bearer token (replaceable when the credential layer refreshes it)
    access_token: Arc<RwLock<String>>,
    /// Connection health (0=healthy, 1=degraded, 2=unhealthy)
    health: Arc<AtomicU8>,
    /// Recent error log
    error_log: Arc<RwLock<VecDeque<ErrorEntry>>>,
}

impl DriveClient {
    /// Create a client that authenticates every API call with `access_token`
    pub fn new(access_token: &str) -> anyhow::Result<Self> {
        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        info!("Drive client ready");
        Ok(Self {
            http_client,
            access_token: Arc::new(RwLock::new(access_token.to_string())),
            health: Arc::new(AtomicU8::new(HEALTH_HEALTHY)),
            error_log: Arc::new(RwLock::new(VecDeque::with_capacity(MAX_ERROR_HISTORY))),
        })
    }

    /// Replace the bearer token used for subsequent requests
    pub fn set_access_token(&self, token: &str) {
        let mut current = self
            .access_token
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *current = token.to_string();
        debug!("Drive access token replaced");
    }

    fn bearer(&self) -> String {
        let token = self
            .access_token
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        format!("Bearer {}", token)
    }

    /// Get connection health status string
    pub fn health_status(&self) -> &'static str {
        match self.health.load(Ordering::Relaxed) {
            HEALTH_HEALTHY => "healthy",
            HEALTH_DEGRADED => "degraded",
            _ => "unhealthy",
        }
    }

    /// Get recent errors
    pub fn recent_errors(&self) -> Vec<ErrorEntry> {
        self.error_log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Record the outcome of an API operation in the health state
    fn observe<T>(
        &self,
        operation: &str,
        target: &str,
        result: Result<T, DriveError>,
    ) -> Result<T, DriveError> {
        match &result {
            Ok(_) => self.health.store(HEALTH_HEALTHY, Ordering::Relaxed),
            Err(e) => {
                if e.is_network() {
                    self.health.store(HEALTH_UNHEALTHY, Ordering::Relaxed);
                } else if e.is_throttled() {
                    self.health.store(HEALTH_DEGRADED, Ordering::Relaxed);
                }
                warn!(operation = operation, target = target, error = %e, "Drive API call failed");
                self.log_error(operation, target, &e.to_string());
            }
        }
        result
    }

    /// Log an error to the error history ring buffer
    fn log_error(&self, operation: &str, target: &str, error: &str) {
        let entry = ErrorEntry {
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            operation: operation.to_string(),
            target: target.to_string(),
            error: error.to_string(),
        };

        let mut log = self.error_log.write().unwrap_or_else(PoisonError::into_inner);
        if log.len() >= MAX_ERROR_HISTORY {
            log.pop_front();
        }
        log.push_back(entry);
    }

    /// Send an authenticated GET and fail on a non-success status
    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<Response, DriveError> {
        let response = self
            .http_client
            .get(url)
            .header("Authorization", self.bearer())
            .query(query)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(DriveError::from_status(status, &body));
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, DriveError> {
        let response = self.get(url, query).await?;
        response
            .json()
            .await
            .map_err(|e| DriveError::Decode(e.to_string()))
    }

    /// Run a files.list query, following page tokens until exhausted
    async fn list_files(
        &self,
        q: &str,
        scope: Option<&str>,
    ) -> Result<Vec<ResourceDescriptor>, DriveError> {
        let url = format!("{}/files", DRIVE_API_URL);
        let mut all_files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("q", q.to_string()),
                ("orderBy", "name".to_string()),
                ("pageSize", PAGE_SIZE.to_string()),
                ("fields", LIST_FIELDS.to_string()),
            ];
            if let Some(drive_id) = scope {
                query.push(("corpora", "drive".to_string()));
                query.push(("driveId", drive_id.to_string()));
                query.push(("includeItemsFromAllDrives", "true".to_string()));
                query.push(("supportsAllDrives", "true".to_string()));
            }
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }

            debug!(q = q, scope = ?scope, page = ?page_token, "Listing files from Drive");

            let page: ListFilesResponse = self.get_json(&url, &query).await?;
            all_files.extend(page.files);

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        debug!(count = all_files.len(), "Listed files from Drive");
        Ok(all_files)
    }
}

#[async_trait]
impl RemoteStore for DriveClient {
    async fn list_all(&self, scope: Option<&str>) -> Result<Vec<ResourceDescriptor>, DriveError> {
        let result = self.list_files("trashed != true", scope).await;
        self.observe("list_all", scope.unwrap_or("my-drive"), result)
    }

    async fn list_folder(
        &self,
        folder_id: &str,
        scope: Option<&str>,
    ) -> Result<Vec<ResourceDescriptor>, DriveError> {
        let q = format!("'{}' in parents and trashed != true", folder_id.replace('\'', "\\'"));
        let result = self.list_files(&q, scope).await;
        self.observe("list_folder", folder_id, result)
    }

    async fn fetch_table_names(&self, id: &str) -> Result<Vec<String>, DriveError> {
        let url = format!("{}/spreadsheets/{}", SHEETS_API_URL, urlencoding::encode(id));
        let query = [("fields", "sheets(properties(title))".to_string())];
        let result = self
            .get_json::<SpreadsheetResponse>(&url, &query)
            .await
            .map(|resp| resp.sheets.into_iter().map(|s| s.properties.title).collect());
        self.observe("fetch_table_names", id, result)
    }

    async fn fetch_tables(&self, id: &str, names: &[String]) -> Result<Vec<ValueRange>, DriveError> {
        let url = format!(
            "{}/spreadsheets/{}/values:batchGet",
            SHEETS_API_URL,
            urlencoding::encode(id)
        );
        let query: Vec<(&str, String)> = names.iter().map(|n| ("ranges", n.clone())).collect();

        debug!(spreadsheet = id, sheets = names.len(), "Batch fetching sheets");

        let result = self
            .get_json::<BatchGetResponse>(&url, &query)
            .await
            .map(|resp| resp.value_ranges);
        self.observe("fetch_tables", id, result)
    }

    async fn fetch_range(&self, id: &str, range: &str) -> Result<ValueRange, DriveError> {
        let url = format!(
            "{}/spreadsheets/{}/values/{}",
            SHEETS_API_URL,
            urlencoding::encode(id),
            urlencoding::encode(range)
        );
        let result = self.get_json::<ValueRange>(&url, &[]).await;
        self.observe("fetch_range", id, result)
    }

    async fn fetch_rich_text(&self, id: &str) -> Result<String, DriveError> {
        let url = format!("{}/files/{}/export", DRIVE_API_URL, urlencoding::encode(id));
        let query = [("mimeType", "text/html".to_string())];
        let result = match self.get(&url, &query).await {
            Ok(response) => response.text().await.map_err(DriveError::from),
            Err(e) => Err(e),
        };
        if let Ok(html) = &result {
            debug!(document = id, size = html.len(), "Exported document from Drive");
        }
        self.observe("fetch_rich_text", id, result)
    }
}

/// Assets live on public hosts, so these requests carry no bearer token.
#[async_trait]
impl AssetSource for DriveClient {
    async fn probe(&self, url: &str) -> Result<u16, DriveError> {
        let response = self.http_client.head(url).send().await?;
        Ok(response.status().as_u16())
    }

    async fn download(
        &self,
        url: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, CacheError> {
        let asset_error = |source: DriveError| CacheError::AssetDownload {
            url: url.to_string(),
            source,
        };

        let mut response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| asset_error(e.into()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            return Err(asset_error(DriveError::from_status(status, "")));
        }

        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await.map_err(|e| asset_error(e.into()))? {
            sink.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        sink.flush().await?;

        Ok(written)
    }
}
