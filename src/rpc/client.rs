//! Client side of the helper connection.
//!
//! A [`HelperConnection`] is one Unix socket connection. Responses are matched
//! to requests by id; `imaging.event` notifications that arrive while a call
//! is waiting are queued for [`HelperConnection::next_event`].

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, warn};
use uuid::Uuid;

use super::protocol::{
    ApplyImageParams, ApplyImageResult, CancelParams, HelperStatus, Incoming, METHOD_APPLY,
    METHOD_CANCEL, METHOD_STATUS, METHOD_VERSION, NOTIFY_IMAGING_EVENT, Request, RpcError,
    VersionInfo,
};
use crate::core::events::SessionEvent;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to helper at {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Communication error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Rpc(RpcError),
    #[error("Helper closed the connection")]
    Closed,
}

/// Where to find the helper.
#[derive(Debug, Clone)]
pub struct HelperClient {
    socket_path: PathBuf,
}

impl HelperClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Open a fresh connection. Each imaging attempt uses its own.
    pub async fn connect(&self) -> Result<HelperConnection, ClientError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| ClientError::Connect {
                path: self.socket_path.clone(),
                source,
            })?;
        let (reader, writer) = stream.into_split();

        Ok(HelperConnection {
            lines: BufReader::new(reader).lines(),
            writer,
            next_id: 1,
            pending: VecDeque::new(),
        })
    }

    /// One-shot `helper.version`.
    pub async fn version(&self) -> Result<VersionInfo, ClientError> {
        self.connect().await?.version().await
    }

    /// One-shot `helper.status`.
    pub async fn status(&self) -> Result<HelperStatus, ClientError> {
        self.connect().await?.status().await
    }
}

pub struct HelperConnection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    next_id: u64,
    pending: VecDeque<SessionEvent>,
}

impl HelperConnection {
    /// Call a method and wait for its response.
    pub async fn call<P: Serialize, T: DeserializeOwned>(
        &mut self,
        method: &str,
        params: Option<P>,
    ) -> Result<T, ClientError> {
        let id = self.next_id;
        self.next_id += 1;

        let params = params.map(serde_json::to_value).transpose()?;
        let request = Request::new(method, params, id);
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;

        loop {
            let line = self.lines.next_line().await?.ok_or(ClientError::Closed)?;
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<Incoming>(&line)? {
                Incoming::Response(response) => {
                    if response.id != Value::from(id) {
                        warn!(id = %response.id, expected = id, "Ignoring response to another request");
                        continue;
                    }
                    if let Some(error) = response.error {
                        return Err(ClientError::Rpc(error));
                    }
                    let result = response.result.unwrap_or(Value::Null);
                    return Ok(serde_json::from_value(result)?);
                }
                Incoming::Request(notification) => {
                    if let Some(event) = session_event(notification) {
                        self.pending.push_back(event);
                    }
                }
            }
        }
    }

    pub async fn version(&mut self) -> Result<VersionInfo, ClientError> {
        self.call(METHOD_VERSION, None::<()>).await
    }

    pub async fn status(&mut self) -> Result<HelperStatus, ClientError> {
        self.call(METHOD_STATUS, None::<()>).await
    }

    /// Ask the helper to start imaging. Returns once the session has begun.
    pub async fn apply_image(&mut self, params: &ApplyImageParams) -> Result<Uuid, ClientError> {
        let result: ApplyImageResult = self.call(METHOD_APPLY, Some(params)).await?;
        Ok(result.session_id)
    }

    pub async fn cancel_imaging(&mut self, session_id: Uuid) -> Result<(), ClientError> {
        let _: Value = self
            .call(METHOD_CANCEL, Some(CancelParams { session_id }))
            .await?;
        Ok(())
    }

    /// Next event pushed by the helper, or `None` once it hangs up.
    ///
    /// Cancel safe: no event is lost if the returned future is dropped.
    pub async fn next_event(&mut self) -> Result<Option<SessionEvent>, ClientError> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }

        while let Some(line) = self.lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Incoming>(&line)? {
                Incoming::Request(notification) => {
                    if let Some(event) = session_event(notification) {
                        return Ok(Some(event));
                    }
                }
                Incoming::Response(response) => {
                    debug!(id = %response.id, "Ignoring unsolicited response");
                }
            }
        }

        Ok(None)
    }
}

fn session_event(notification: Request) -> Option<SessionEvent> {
    if notification.method != NOTIFY_IMAGING_EVENT {
        warn!(method = %notification.method, "Ignoring unknown notification");
        return None;
    }
    match serde_json::from_value(notification.params.unwrap_or(Value::Null)) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, "Ignoring malformed imaging event");
            None
        }
    }
}
