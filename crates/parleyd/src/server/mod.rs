//! Unix socket intake server.
//!
//! The server:
//! - Listens on a Unix socket for transport connections
//! - Spawns a `ConnectionHandler` for each one
//! - Feeds every parsed event into the engine and acknowledges it
//! - Supports graceful shutdown via `CancellationToken`
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  IntakeServer   │
//! │  UnixListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐  dispatch  ┌─────────────────┐
//! │ConnectionHandler│───────────▶│     Engine      │
//! │ (per transport) │◀───────────│ (all registries)│
//! └─────────────────┘    ack     └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Server errors are logged and allow continued operation

mod connection;

pub use connection::{ConnectionError, ConnectionHandler, MAX_MESSAGE_SIZE};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;

/// Default socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/parley.sock";

/// Unix socket server that feeds transport events into an [`Engine`].
pub struct IntakeServer {
    socket_path: PathBuf,
    engine: Engine,
    cancel_token: CancellationToken,

    /// Connection counter for generating client IDs
    connection_counter: AtomicU64,
}

impl IntakeServer {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        engine: Engine,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            engine,
            cancel_token,
            connection_counter: AtomicU64::new(0),
        }
    }

    /// Creates a server with the default socket path.
    pub fn with_default_path(engine: Engine, cancel_token: CancellationToken) -> Self {
        Self::new(DEFAULT_SOCKET_PATH, engine, cancel_token)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Listens for connections until the cancellation token fires.
    ///
    /// # Errors
    ///
    /// `ServerError::SocketSetup` if the socket cannot be created.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;
        info!(socket = %self.socket_path.display(), "Intake server listening");

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            self.handle_connection(stream, conn_num);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        self.cleanup();
        Ok(())
    }

    /// Replaces a stale socket file and binds the listener.
    fn bind(&self) -> Result<UnixListener, ServerError> {
        let setup_error = |e: std::io::Error| ServerError::SocketSetup {
            path: self.socket_path.clone(),
            error: e.to_string(),
        };

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(setup_error)?;
        }

        if let Some(parent) = self.socket_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(setup_error)?;
            }
        }

        UnixListener::bind(&self.socket_path).map_err(setup_error)
    }

    fn handle_connection(&self, stream: tokio::net::UnixStream, connection_number: u64) {
        let (reader, writer) = stream.into_split();
        let handler = ConnectionHandler::new(reader, writer, self.engine.clone(), connection_number);

        tokio::spawn(async move {
            if let Some(client_id) = handler.run().await {
                debug!(client_id = %client_id, "Connection task finished");
            }
        });
    }

    fn cleanup(&self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
            }
        }
        info!("Server cleanup complete");
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_socket_path() {
        assert_eq!(DEFAULT_SOCKET_PATH, "/tmp/parley.sock");
    }

    #[test]
    fn test_server_error_display() {
        let err = ServerError::SocketSetup {
            path: PathBuf::from("/tmp/test.sock"),
            error: "permission denied".to_string(),
        };
        assert!(err.to_string().contains("/tmp/test.sock"));
        assert!(err.to_string().contains("permission denied"));
    }
}
