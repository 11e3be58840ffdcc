//! Unix socket transport for the helper.
//!
//! Newline-delimited JSON framing. Each connection is handled in its own task,
//! with a writer task that interleaves responses and session events.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::methods::{ConnectionState, MethodHandler};
use super::protocol::{NOTIFY_IMAGING_EVENT, Request, Response};
use crate::core::events::SessionEvent;

const EVENT_BUFFER: usize = 64;

/// Manages the Unix socket transport layer.
pub struct Transport {
    socket_path: PathBuf,
    socket_mode: u32,
    handler: Arc<MethodHandler>,
}

impl Transport {
    pub fn new(socket_path: PathBuf, socket_mode: u32, handler: MethodHandler) -> Self {
        Self {
            socket_path,
            socket_mode,
            handler: Arc::new(handler),
        }
    }

    fn bind(&self) -> anyhow::Result<UnixListener> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        // A previous helper may have left its socket behind.
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => debug!(path = %self.socket_path.display(), "Removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to remove stale socket {}", self.socket_path.display())
                });
            }
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind {}", self.socket_path.display()))?;
        std::fs::set_permissions(
            &self.socket_path,
            std::fs::Permissions::from_mode(self.socket_mode),
        )
        .with_context(|| format!("Failed to set permissions on {}", self.socket_path.display()))?;

        Ok(listener)
    }

    /// Start listening for connections. Runs until shutdown signal is received.
    pub async fn listen(&self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let listener = self.bind()?;
        info!(path = %self.socket_path.display(), mode = %format!("{:o}", self.socket_mode), "Helper listening");

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _)) => {
                            debug!("Client connected");
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, handler).await {
                                    debug!(error = %e, "Connection error");
                                }
                                debug!("Client disconnected");
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Helper shutting down");
                    break;
                }
            }
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!(error = %e, "Failed to remove socket on shutdown");
        }

        Ok(())
    }
}

/// Handle a single client connection.
async fn handle_connection(stream: UnixStream, handler: Arc<MethodHandler>) -> anyhow::Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    let (response_tx, response_rx) = mpsc::channel::<Response>(EVENT_BUFFER);
    let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(EVENT_BUFFER);
    tokio::spawn(write_loop(writer, response_rx, event_rx));

    // Dropped on every exit path, which cancels a session still running.
    let mut conn = ConnectionState::new(event_tx);

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            // EOF - client disconnected
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(request) => {
                if let Err(msg) = request.validate() {
                    warn!(error = msg, "Invalid request");
                    let id = request.id.clone().unwrap_or(serde_json::Value::Null);
                    Response::invalid_request(id)
                } else if request.is_notification() {
                    debug!(method = %request.method, "Notification received");
                    handler.handle(request, &mut conn).await;
                    continue;
                } else {
                    handler.handle(request, &mut conn).await
                }
            }
            Err(e) => {
                warn!(error = %e, "Parse error");
                Response::parse_error()
            }
        };

        if response_tx.send(response).await.is_err() {
            break;
        }
    }

    Ok(())
}

/// Serialise responses and session events onto the socket.
///
/// Ends when both channels close or the peer stops reading.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut responses: mpsc::Receiver<Response>,
    mut events: mpsc::Receiver<SessionEvent>,
) {
    let (mut responses_open, mut events_open) = (true, true);

    while responses_open || events_open {
        let line = tokio::select! {
            biased;
            response = responses.recv(), if responses_open => match response {
                Some(response) => serde_json::to_string(&response),
                None => {
                    responses_open = false;
                    continue;
                }
            },
            event = events.recv(), if events_open => match event {
                Some(event) => serde_json::to_string(&Request::notification(NOTIFY_IMAGING_EVENT, &event)),
                None => {
                    events_open = false;
                    continue;
                }
            },
        };

        let mut line = match line {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "Failed to serialise message");
                continue;
            }
        };
        line.push('\n');

        if let Err(e) = writer.write_all(line.as_bytes()).await {
            debug!(error = %e, "Client stopped reading");
            break;
        }
    }
}
