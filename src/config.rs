//! Daemon configuration, read once from the environment at startup

use anyhow::{anyhow, Context, Result};
use std::num::NonZeroUsize;
use std::path::PathBuf;

use crate::sync::ConcurrencyPolicy;

/// Default base URL that rewritten asset references point at
pub const DEFAULT_SERVICE_BASE: &str = "http://localhost:8080/api/v1";

/// Default socket path for IPC communication
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/drive-proxy.sock";

/// Default number of concurrent asset downloads
const DEFAULT_ASSET_DOWNLOADS: usize = 4;

#[derive(Debug, Clone)]
pub struct Config {
    /// Bearer token for the Drive and Sheets APIs
    pub access_token: Option<String>,
    /// Holds `cache.json` and the `assets/` directory
    pub cache_dir: PathBuf,
    pub service_base: String,
    pub socket_path: PathBuf,
    pub policy: ConcurrencyPolicy,
    pub asset_downloads: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from any variable source; empty values count as unset
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let cache_dir = match var("DRIVE_PROXY_CACHE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("drive-proxy"),
        };

        let defaults = ConcurrencyPolicy::default();
        let sequential_above = match var("DRIVE_PROXY_SEQUENTIAL_ABOVE") {
            Some(v) => parse_number("DRIVE_PROXY_SEQUENTIAL_ABOVE", &v)?,
            None => defaults.sequential_above,
        };
        let max_in_flight = match var("DRIVE_PROXY_MAX_IN_FLIGHT") {
            Some(v) => Some(
                NonZeroUsize::new(parse_number("DRIVE_PROXY_MAX_IN_FLIGHT", &v)?)
                    .ok_or_else(|| anyhow!("DRIVE_PROXY_MAX_IN_FLIGHT must be at least 1"))?,
            ),
            None => defaults.max_in_flight,
        };
        let asset_downloads = match var("DRIVE_PROXY_ASSET_DOWNLOADS") {
            Some(v) => parse_number("DRIVE_PROXY_ASSET_DOWNLOADS", &v)?,
            None => DEFAULT_ASSET_DOWNLOADS,
        };

        Ok(Self {
            access_token: var("DRIVE_ACCESS_TOKEN"),
            cache_dir,
            service_base: var("DRIVE_PROXY_SERVICE_BASE")
                .unwrap_or_else(|| DEFAULT_SERVICE_BASE.to_string()),
            socket_path: PathBuf::from(
                var("DRIVE_PROXY_SOCKET").unwrap_or_else(|| DEFAULT_SOCKET_PATH.to_string()),
            ),
            policy: ConcurrencyPolicy {
                sequential_above,
                max_in_flight,
            },
            asset_downloads,
        })
    }

    /// Access token, or an error explaining how to supply one
    pub fn require_token(&self) -> Result<&str> {
        self.access_token
            .as_deref()
            .ok_or_else(|| anyhow!("DRIVE_ACCESS_TOKEN is not set"))
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.cache_dir.join("cache.json")
    }

    pub fn asset_dir(&self) -> PathBuf {
        self.cache_dir.join("assets")
    }
}

fn parse_number(name: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .with_context(|| format!("{} must be a non-negative integer, got '{}'", name, value))
}
