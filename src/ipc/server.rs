//! IPC Server - Unix socket server for the serving layer
//!
//! Handles incoming connections and dispatches commands to the sync
//! orchestrator, the versioned cache and the asset cache.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::drive::DriveClient;
use crate::ipc::protocol::{
    parse_command, serialize_response, Command, ErrorInfo, Response, PROTOCOL_VERSION,
};
use crate::sync::SyncOrchestrator;

/// IPC Server that listens for commands from the serving layer
pub struct IpcServer {
    /// Sync engine and, through it, the caches
    orchestrator: Arc<SyncOrchestrator>,
    /// Drive client, for health and token replacement
    drive: DriveClient,
    socket_path: PathBuf,
    /// Socket listener
    listener: Option<UnixListener>,
    /// Active connections counter
    connection_count: Arc<RwLock<u32>>,
}

impl IpcServer {
    /// Create a new IPC server
    pub fn new(orchestrator: Arc<SyncOrchestrator>, drive: DriveClient, socket_path: &Path) -> Self {
        Self {
            orchestrator,
            drive,
            socket_path: socket_path.to_path_buf(),
            listener: None,
            connection_count: Arc::new(RwLock::new(0)),
        }
    }

    /// Start the IPC server
    pub async fn start(&mut self) -> Result<()> {
        // Clean up any existing socket file
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .context("Failed to remove existing socket file")?;
        }

        // Create the socket listener
        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind Unix socket {}", self.socket_path.display()))?;

        info!(socket_path = %self.socket_path.display(), "IPC server started");

        self.listener = Some(listener);
        Ok(())
    }

    /// Run the server loop, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("Server not started")?;

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let orchestrator = Arc::clone(&self.orchestrator);
                    let drive = self.drive.clone();
                    let connection_count = Arc::clone(&self.connection_count);

                    // Spawn a new task to handle this connection
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(stream, orchestrator, drive, connection_count).await
                        {
                            error!(error = %e, "Connection handler error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Stop the IPC server and clean up
    pub async fn stop(&self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).context("Failed to remove socket file")?;
        }
        info!(
            open_connections = self.connection_count().await,
            "IPC server stopped"
        );
        Ok(())
    }

    /// Get the number of active connections
    pub async fn connection_count(&self) -> u32 {
        *self.connection_count.read().await
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: UnixStream,
    orchestrator: Arc<SyncOrchestrator>,
    drive: DriveClient,
    connection_count: Arc<RwLock<u32>>,
) -> Result<()> {
    {
        let mut count = connection_count.write().await;
        *count += 1;
        debug!(count = *count, "New connection");
    }

    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();

    // Read commands line by line (newline-delimited JSON)
    loop {
        line.clear();
        match buf_reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("Connection closed by client");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let response = match parse_command(trimmed.as_bytes()) {
                    Ok(command) => {
                        debug!(command = ?command, "Received command");
                        process_command(command, &orchestrator, &drive).await
                    }
                    Err(e) => {
                        error!(error = %e, command = %trimmed, "Failed to parse command");
                        Response::Error {
                            error: format!("Invalid command: {}", e),
                        }
                    }
                };

                match serialize_response(&response) {
                    Ok(json) => {
                        if let Err(e) = writer.write_all(&json).await {
                            error!(error = %e, "Failed to write response");
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to serialize response");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to read from socket");
                break;
            }
        }
    }

    {
        let mut count = connection_count.write().await;
        *count = count.saturating_sub(1);
        debug!(count = *count, "Connection ended");
    }

    Ok(())
}

/// Process a command and return a response
async fn process_command(
    command: Command,
    orchestrator: &SyncOrchestrator,
    drive: &DriveClient,
) -> Response {
    let fetcher = orchestrator.fetcher();

    match command {
        Command::GetAll { drive_id } => {
            info!(drive_id = ?drive_id, "Processing getAll command");
            match orchestrator.run_sync(drive_id.as_deref()).await {
                Ok(entries) => Response::Cache { entries },
                Err(e) => Response::Error {
                    error: e.to_string(),
                },
            }
        }

        Command::GetEntry { id } => match orchestrator.cache().get(&id) {
            Some(entry) => Response::Entry { id, entry },
            None => Response::Error {
                error: format!("Resource not cached: {}", id),
            },
        },

        Command::GetSheet { id, range } => {
            debug!(id = %id, range = %range, "Processing getSheet command");
            match fetcher.fetch_range(&id, &range).await {
                Ok(rows) => Response::Rows { rows },
                Err(e) => Response::Error {
                    error: format!("Failed to read sheet {}: {}", id, e),
                },
            }
        }

        Command::GetDoc { id } => {
            debug!(id = %id, "Processing getDoc command");
            match fetcher.fetch_rich_text(&id).await {
                Ok(html) => Response::Document { html },
                Err(e) => Response::Error {
                    error: format!("Failed to export document {}: {}", id, e),
                },
            }
        }

        Command::ListFiles { folder, drive_id } => {
            debug!(folder = %folder, "Processing listFiles command");
            match fetcher.store().list_folder(&folder, drive_id.as_deref()).await {
                Ok(files) => Response::Files { files },
                Err(e) => Response::Error {
                    error: format!("Failed to list folder {}: {}", folder, e),
                },
            }
        }

        Command::GetImage { id } => match fetcher.assets().cached_path(&id) {
            Some(path) => Response::Image {
                path: path.to_string_lossy().to_string(),
            },
            None => Response::Error {
                error: format!("Asset not cached: {}", id),
            },
        },

        Command::SetToken { token } => {
            info!("Processing setToken command");
            drive.set_access_token(&token);
            Response::Success {
                message: Some("Access token replaced".to_string()),
            }
        }

        Command::GetStatus => {
            debug!("Processing getStatus command");
            let recent_errors = drive
                .recent_errors()
                .into_iter()
                .map(|e| ErrorInfo {
                    timestamp: e.timestamp,
                    operation: e.operation,
                    target: e.target,
                    error: e.error,
                })
                .collect();

            Response::Status {
                version: PROTOCOL_VERSION,
                health: drive.health_status().to_string(),
                entries: orchestrator.cache().len(),
                last_run: orchestrator.last_run(),
                assets: fetcher.assets().stats(),
                recent_errors,
            }
        }
    }
}
