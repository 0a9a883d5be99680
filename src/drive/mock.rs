//! In-memory remote store for testing.
//!
//! Holds descriptors, document bodies and sheet values in memory and records
//! every per-resource fetch so tests can assert on ordering and overlap.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::errors::DriveError;
use super::types::{ResourceDescriptor, ResourceKind, ValueRange};
use super::RemoteStore;

type FetchHook = Box<dyn Fn(&str) + Send + Sync>;

/// Build a descriptor for test fixtures
pub fn descriptor(
    id: &str,
    name: &str,
    kind: ResourceKind,
    version: i64,
    parents: &[&str],
) -> ResourceDescriptor {
    ResourceDescriptor {
        id: id.to_string(),
        name: name.to_string(),
        kind,
        version: Some(version),
        parents: parents.iter().map(|p| p.to_string()).collect(),
    }
}

#[derive(Default)]
pub struct MockDrive {
    files: Mutex<Vec<ResourceDescriptor>>,
    documents: Mutex<HashMap<String, String>>,
    sheets: Mutex<HashMap<String, Vec<ValueRange>>>,
    failing: Mutex<HashSet<String>>,
    listing_fails: AtomicBool,
    delay: Mutex<Duration>,
    fetch_log: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    hook: Mutex<Option<FetchHook>>,
}

impl MockDrive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, descriptor: ResourceDescriptor) {
        self.files.lock().unwrap().push(descriptor);
    }

    pub fn add_document(&self, id: &str, version: i64, html: &str) {
        self.add(descriptor(id, id, ResourceKind::RichText, version, &[]));
        self.documents
            .lock()
            .unwrap()
            .insert(id.to_string(), html.to_string());
    }

    pub fn add_spreadsheet(&self, id: &str, version: i64, tables: Vec<ValueRange>) {
        self.add(descriptor(id, id, ResourceKind::Table, version, &[]));
        self.sheets.lock().unwrap().insert(id.to_string(), tables);
    }

    /// Bump the remote version of a resource
    pub fn set_version(&self, id: &str, version: i64) {
        for file in self.files.lock().unwrap().iter_mut() {
            if file.id == id {
                file.version = Some(version);
            }
        }
    }

    /// Make a resource report no parsable version
    pub fn clear_version(&self, id: &str) {
        for file in self.files.lock().unwrap().iter_mut() {
            if file.id == id {
                file.version = None;
            }
        }
    }

    pub fn fail_fetch(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    pub fn fail_listing(&self) {
        self.listing_fails.store(true, Ordering::SeqCst);
    }

    /// Make every fetch suspend for `delay` before answering
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Called with the resource id whenever a fetch starts
    pub fn on_fetch_start(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Resource ids in the order their fetches started
    pub fn fetch_log(&self) -> Vec<String> {
        self.fetch_log.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn instrumented_fetch(&self, id: &str) -> Result<(), DriveError> {
        self.fetch_log.lock().unwrap().push(id.to_string());
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(id);
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.lock().unwrap().contains(id) {
            return Err(DriveError::Server(500, format!("injected failure for {}", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MockDrive {
    async fn list_all(&self, _scope: Option<&str>) -> Result<Vec<ResourceDescriptor>, DriveError> {
        if self.listing_fails.load(Ordering::SeqCst) {
            return Err(DriveError::Network("injected listing failure".to_string()));
        }
        let mut files = self.files.lock().unwrap().clone();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn list_folder(
        &self,
        folder_id: &str,
        scope: Option<&str>,
    ) -> Result<Vec<ResourceDescriptor>, DriveError> {
        let files = self.list_all(scope).await?;
        Ok(files.into_iter().filter(|f| f.has_parent(folder_id)).collect())
    }

    async fn fetch_table_names(&self, id: &str) -> Result<Vec<String>, DriveError> {
        self.instrumented_fetch(id).await?;
        let sheets = self.sheets.lock().unwrap();
        let tables = sheets
            .get(id)
            .ok_or_else(|| DriveError::NotFound(id.to_string()))?;
        Ok(tables
            .iter()
            .map(|t| t.range.split('!').next().unwrap_or_default().to_string())
            .collect())
    }

    async fn fetch_tables(&self, id: &str, names: &[String]) -> Result<Vec<ValueRange>, DriveError> {
        let sheets = self.sheets.lock().unwrap();
        let tables = sheets
            .get(id)
            .ok_or_else(|| DriveError::NotFound(id.to_string()))?;
        Ok(tables
            .iter()
            .filter(|t| names.iter().any(|n| t.range.starts_with(n.as_str())))
            .cloned()
            .collect())
    }

    async fn fetch_range(&self, id: &str, range: &str) -> Result<ValueRange, DriveError> {
        let sheets = self.sheets.lock().unwrap();
        sheets
            .get(id)
            .and_then(|tables| tables.iter().find(|t| t.range.starts_with(range)))
            .cloned()
            .ok_or_else(|| DriveError::NotFound(format!("{}!{}", id, range)))
    }

    async fn fetch_rich_text(&self, id: &str) -> Result<String, DriveError> {
        self.instrumented_fetch(id).await?;
        self.documents
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| DriveError::NotFound(id.to_string()))
    }
}
