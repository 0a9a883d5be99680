//! IPC protocol definitions
//!
//! This module defines the JSON protocol spoken by the serving layer and
//! the daemon over a Unix domain socket, one JSON object per line.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::cache::assets::AssetStats;
use crate::cache::{CacheEntry, Row};
use crate::drive::ResourceDescriptor;
use crate::sync::RunSummary;

/// Protocol version for future compatibility
pub const PROTOCOL_VERSION: u32 = 1;

/// Commands sent from the serving layer to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    /// Run a sync and return the whole cache
    #[serde(rename_all = "camelCase")]
    GetAll {
        /// Restrict the listing to one shared drive
        #[serde(default)]
        drive_id: Option<String>,
    },
    /// Read one cached entry without syncing
    GetEntry { id: String },
    /// Read one A1 range of a spreadsheet, bypassing the cache
    GetSheet { id: String, range: String },
    /// Export one document with asset references rewritten
    GetDoc { id: String },
    /// List the direct children of a folder
    #[serde(rename_all = "camelCase")]
    ListFiles {
        folder: String,
        #[serde(default)]
        drive_id: Option<String>,
    },
    /// Resolve an asset key to its local file
    GetImage { id: String },
    /// Replace the Drive access token
    SetToken { token: String },
    /// Get daemon status
    GetStatus,
}

/// Responses sent from the daemon to the serving layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Response {
    /// Success response
    #[serde(rename_all = "camelCase")]
    Success {
        /// Optional success message
        message: Option<String>,
    },
    /// Error response
    #[serde(rename_all = "camelCase")]
    Error {
        /// Error message
        error: String,
    },
    /// Full cache mapping after a sync
    Cache { entries: BTreeMap<String, CacheEntry> },
    Entry { id: String, entry: CacheEntry },
    Rows { rows: Vec<Row> },
    Document { html: String },
    Files { files: Vec<ResourceDescriptor> },
    /// Local path of a cached asset
    Image { path: String },
    /// Status response with daemon state
    #[serde(rename_all = "camelCase")]
    Status {
        /// Protocol version
        version: u32,
        /// Remote connection health: healthy, degraded or unhealthy
        health: String,
        /// Number of cached resources
        entries: usize,
        /// Counters of the last completed sync
        last_run: Option<RunSummary>,
        /// Asset download counters
        assets: AssetStats,
        /// Most recent remote errors, oldest first
        recent_errors: Vec<ErrorInfo>,
    },
}

/// A recent remote error (for status response)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Unix time in seconds
    pub timestamp: u64,
    pub operation: String,
    pub target: String,
    pub error: String,
}

/// Parse a JSON command from bytes
pub fn parse_command(data: &[u8]) -> Result<Command, serde_json::Error> {
    serde_json::from_slice(data)
}

/// Serialize a response to JSON bytes
pub fn serialize_response(response: &Response) -> Result<Vec<u8>, serde_json::Error> {
    let mut json = serde_json::to_vec(response)?;
    json.push(b'\n'); // Add newline delimiter
    Ok(json)
}
