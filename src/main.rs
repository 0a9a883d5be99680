//! Drive Proxy Daemon - incremental sync and cache for Google Drive content
//!
//! This daemon keeps a versioned cache of Drive folders, spreadsheets and
//! documents, and serves it to a web layer over a Unix socket.

mod cache;
mod config;
mod drive;
mod fetch;
mod ipc;
mod sync;

use anyhow::{anyhow, Context, Result};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cache::{AssetCache, AssetQueue, SnapshotGuard, VersionedCache};
use config::Config;
use drive::DriveClient;
use fetch::ResourceFetcher;
use ipc::IpcServer;
use sync::SyncOrchestrator;

/// How long a one-shot sync waits for queued asset downloads on exit
const ASSET_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// CLI command
#[derive(Debug)]
enum Command {
    /// Run IPC server mode (default)
    Server,
    /// Run one sync and exit (CLI mode)
    Sync { drive_id: Option<String> },
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"Drive Proxy Daemon - Incremental cache of Google Drive content

USAGE:
    drive-proxy                    # Run IPC server (default)
    drive-proxy sync [drive_id]
    drive-proxy help

COMMANDS:
    (none)  Run IPC server mode (waits for commands from the web layer)
    sync    Synchronize once, write the cache snapshot and exit
    help    Show this help message

EXAMPLES:
    # Run IPC server (default)
    DRIVE_ACCESS_TOKEN=ya29.xxx drive-proxy

    # Sync one shared drive
    DRIVE_ACCESS_TOKEN=ya29.xxx drive-proxy sync 0AExampleDriveId

ENVIRONMENT:
    DRIVE_ACCESS_TOKEN             OAuth bearer token for Drive and Sheets
    DRIVE_PROXY_CACHE_DIR          Cache snapshot and asset directory
    DRIVE_PROXY_SERVICE_BASE       Base URL used in rewritten image links
    DRIVE_PROXY_SOCKET             IPC socket path (default /tmp/drive-proxy.sock)
    DRIVE_PROXY_SEQUENTIAL_ABOVE   Fetch one at a time above this many changes (default 4)
    DRIVE_PROXY_MAX_IN_FLIGHT      Cap on concurrent fetches otherwise (default unlimited)
    DRIVE_PROXY_ASSET_DOWNLOADS    Concurrent image downloads (default 4)
    RUST_LOG                       Log filter (trace, debug, info, warn, error)
"#
    );
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Server);
    }

    match args[1].as_str() {
        "sync" => {
            if args.len() > 3 {
                return Err(anyhow!("Usage: drive-proxy sync [drive_id]"));
            }
            Ok(Command::Sync {
                drive_id: args.get(2).cloned(),
            })
        }
        "help" | "--help" | "-h" => Ok(Command::Help),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            Ok(Command::Help)
        }
    }
}

/// Everything a run or the server needs, built from the config
struct Daemon {
    drive: DriveClient,
    orchestrator: Arc<SyncOrchestrator>,
    asset_worker: JoinHandle<()>,
}

fn build_daemon(config: &Config, cache: Arc<VersionedCache>) -> Result<Daemon> {
    let drive = DriveClient::new(config.require_token()?)?;

    let asset_dir = config.asset_dir();
    let assets = Arc::new(
        AssetCache::new(asset_dir.clone(), &config.service_base, Arc::new(drive.clone()))
            .with_context(|| format!("Failed to create asset directory {:?}", asset_dir))?,
    );
    let (queue, downloads) = AssetQueue::channel();
    let asset_worker = Arc::clone(&assets).spawn_worker(downloads, config.asset_downloads);

    let fetcher = Arc::new(ResourceFetcher::new(
        Arc::new(drive.clone()),
        assets,
        queue,
    ));
    let orchestrator = Arc::new(SyncOrchestrator::new(fetcher, cache, config.policy));

    Ok(Daemon {
        drive,
        orchestrator,
        asset_worker,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Parse command
    let command = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    if let Command::Help = command {
        print_help();
        return Ok(());
    }

    let config = Config::from_env()?;
    let cache = Arc::new(VersionedCache::open(config.snapshot_path()));
    if cache.is_empty() {
        info!("Cache is empty, the first sync fetches every resource");
    }
    // Flushes the cache on every way out of main from here on
    let _snapshot = SnapshotGuard::new(Arc::clone(&cache));

    let daemon = build_daemon(&config, cache)?;

    match command {
        Command::Server => {
            info!("Starting drive proxy in IPC server mode");

            let mut ipc_server = IpcServer::new(
                Arc::clone(&daemon.orchestrator),
                daemon.drive.clone(),
                &config.socket_path,
            );
            if let Err(e) = ipc_server.start().await {
                error!(error = %e, "Failed to start IPC server");
                return Err(e);
            }

            info!("Daemon ready. Waiting for commands...");

            let ipc_server = Arc::new(ipc_server);
            let running = Arc::clone(&ipc_server);
            let ipc_handle = tokio::spawn(async move {
                if let Err(e) = running.run().await {
                    error!(error = %e, "IPC server error");
                }
            });

            // Wait for Ctrl+C
            tokio::signal::ctrl_c().await?;

            info!("Received shutdown signal, stopping...");
            ipc_handle.abort();
            ipc_server.stop().await?;
            daemon.orchestrator.fetcher().assets().log_metrics();

            info!("Shutdown complete.");
        }
        Command::Sync { drive_id } => {
            let Daemon {
                orchestrator,
                asset_worker,
                ..
            } = daemon;

            let entries = match orchestrator.run_sync(drive_id.as_deref()).await {
                Ok(entries) => entries,
                Err(e) => {
                    error!(error = %e, "Sync failed");
                    return Err(e.into());
                }
            };
            let summary = orchestrator.last_run().unwrap_or_default();

            // Closing the last queue handle lets the worker finish and exit
            drop(orchestrator);
            if tokio::time::timeout(ASSET_DRAIN_TIMEOUT, asset_worker)
                .await
                .is_err()
            {
                warn!("Timed out waiting for asset downloads");
            }

            println!(
                "Synchronized {} resources: {} listed, {} changed, {} fetched, {} failed ({} ms)",
                entries.len(),
                summary.listed,
                summary.stale,
                summary.fetched,
                summary.failed,
                summary.elapsed_ms
            );
        }
        Command::Help => {}
    }

    Ok(())
}
