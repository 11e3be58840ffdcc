//! RPC method handlers.
//!
//! Dispatches JSON-RPC method calls to the appropriate handler functions.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::context::HelperContext;
use crate::core::events::{ImagingFailure, SessionEvent};
use crate::core::imaging_tool::ApplyRequest;
use crate::core::server_session::ImageSessionServer;

use super::protocol::{
    ApplyImageParams, ApplyImageResult, CancelParams, HelperStatus, IMAGE_NOT_IN_CATALOG,
    METHOD_APPLY, METHOD_CANCEL, METHOD_STATUS, METHOD_VERSION, NO_ACTIVE_SESSION, Request,
    Response, SESSION_ALREADY_STARTED, VersionInfo,
};

/// Per-connection state. A connection carries at most one imaging session.
///
/// Dropping it treats the connection as lost and cancels that session.
pub struct ConnectionState {
    events: mpsc::Sender<SessionEvent>,
    session: Option<Arc<ImageSessionServer>>,
}

impl ConnectionState {
    pub fn new(events: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            events,
            session: None,
        }
    }

    pub fn session(&self) -> Option<&Arc<ImageSessionServer>> {
        self.session.as_ref()
    }
}

impl Drop for ConnectionState {
    fn drop(&mut self) {
        if let Some(session) = &self.session
            && !session.is_finished()
        {
            warn!(session_id = %session.id(), "Connection lost with imaging in progress");
            session.cancel_imaging(ImagingFailure::connection_lost());
        }
    }
}

/// Handles RPC method dispatch and execution.
pub struct MethodHandler {
    ctx: HelperContext,
    start_time: Instant,
}

impl MethodHandler {
    pub fn new(ctx: HelperContext) -> Self {
        Self {
            ctx,
            start_time: Instant::now(),
        }
    }

    /// Handle an RPC request and return a response.
    pub async fn handle(&self, request: Request, conn: &mut ConnectionState) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);

        match request.method.as_str() {
            METHOD_VERSION => Response::success(id, VersionInfo::current()),
            METHOD_STATUS => self.helper_status(id).await,
            METHOD_APPLY => self.image_apply(id, params, conn).await,
            METHOD_CANCEL => self.image_cancel(id, params, conn),
            _ => Response::method_not_found(id, &request.method),
        }
    }

    async fn helper_status(&self, id: Value) -> Response {
        let sessions = self.ctx.registry.get_all().await;

        Response::success(
            id,
            HelperStatus {
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_secs: self.start_time.elapsed().as_secs(),
                imaging_tool: self.ctx.config.imaging_tool,
                active_sessions: sessions.len(),
                sessions,
            },
        )
    }

    /// Start imaging and answer with the session id without waiting for it.
    async fn image_apply(&self, id: Value, params: Value, conn: &mut ConnectionState) -> Response {
        if let Some(session) = &conn.session {
            warn!(session_id = %session.id(), "Second apply on one connection");
            return Response::error(
                id,
                SESSION_ALREADY_STARTED,
                format!(
                    "Imaging session {} already started on this connection",
                    session.id()
                ),
            );
        }

        let ApplyImageParams {
            mut image,
            source,
            disk,
        } = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return Response::invalid_params(id, e.to_string()),
        };

        if let Err(e) = image.validate() {
            return Response::invalid_params(id, e.to_string());
        }
        if disk.identifier.is_empty() {
            return Response::invalid_params(id, "disk identifier must not be empty");
        }

        // Only images the helper's own catalog describes are written, and the
        // source is later checked against the helper's digests.
        let image = match self.ctx.catalog.get(&image.name) {
            Some(known) if *known == image => known.clone(),
            Some(_) => {
                warn!(image = %image.name, "Apply request disagrees with the catalog");
                return Response::error(
                    id,
                    IMAGE_NOT_IN_CATALOG,
                    format!("Image {:?} does not match the helper catalog", image.name),
                );
            }
            None => {
                warn!(image = %image.name, "Apply request for unknown image");
                return Response::error(
                    id,
                    IMAGE_NOT_IN_CATALOG,
                    format!("Image {:?} is not in the helper catalog", image.name),
                );
            }
        };

        let config = &self.ctx.config;
        let request = ApplyRequest {
            image,
            source,
            disk,
            verify: config.verify_images,
            post_script: config.post_script.clone(),
        };

        info!(image = %request.image.name, disk = %request.disk, "Apply requested");

        let session = ImageSessionServer::new(
            request,
            self.ctx.tool.clone(),
            conn.events.clone(),
            self.ctx.registry.clone(),
            config.verify_source_checksum,
        );

        if let Err(e) = session.begin_imaging().await {
            return Response::error(id, SESSION_ALREADY_STARTED, e.to_string());
        }

        let session_id = session.id();
        conn.session = Some(session);
        Response::success(id, ApplyImageResult { session_id })
    }

    fn image_cancel(&self, id: Value, params: Value, conn: &mut ConnectionState) -> Response {
        let CancelParams { session_id } = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return Response::invalid_params(id, e.to_string()),
        };

        match &conn.session {
            Some(session) if session.id() == session_id => {
                session.cancel_imaging(ImagingFailure::cancelled());
                Response::success(id, serde_json::json!({ "cancelled": true }))
            }
            _ => Response::error(
                id,
                NO_ACTIVE_SESSION,
                format!("No imaging session {} on this connection", session_id),
            ),
        }
    }
}
