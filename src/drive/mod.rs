//! Google Drive API client and the remote store capability

pub mod client;
pub mod errors;
#[cfg(test)]
pub mod mock;
pub mod types;

pub use client::DriveClient;
pub use errors::DriveError;
pub use types::*;

use async_trait::async_trait;

/// Remote document store consumed by the sync engine.
///
/// Every call is a single round trip (or a paged sequence of them); none of
/// them touch local state.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// List every non-trashed resource, optionally restricted to a shared drive
    async fn list_all(&self, scope: Option<&str>) -> Result<Vec<ResourceDescriptor>, DriveError>;

    /// List the direct children of one folder
    async fn list_folder(
        &self,
        folder_id: &str,
        scope: Option<&str>,
    ) -> Result<Vec<ResourceDescriptor>, DriveError>;

    /// Titles of the sheets inside a spreadsheet
    async fn fetch_table_names(&self, id: &str) -> Result<Vec<String>, DriveError>;

    /// All named sheets of a spreadsheet in one batched call
    async fn fetch_tables(&self, id: &str, names: &[String]) -> Result<Vec<ValueRange>, DriveError>;

    /// A single A1 range of a spreadsheet
    async fn fetch_range(&self, id: &str, range: &str) -> Result<ValueRange, DriveError>;

    /// A document exported as html
    async fn fetch_rich_text(&self, id: &str) -> Result<String, DriveError>;
}
