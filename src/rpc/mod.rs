//! The imaging protocol between the unprivileged caller and the helper.
//!
//! JSON-RPC 2.0 over a Unix domain socket, one connection per imaging
//! attempt. The helper answers `helper.version`, `helper.status`,
//! `image.apply` and `image.cancel`, and streams `imaging.event`
//! notifications for the connection's session. Closing the connection
//! cancels that session.
//!
//! ## Architecture
//!
//! - `protocol`: message types, method names and error codes
//! - `transport`: Unix socket listener with newline-delimited JSON framing
//! - `methods`: method dispatcher and per-connection session state
//! - `client`: connection used by the caller side

pub mod client;
pub mod methods;
pub mod protocol;
mod transport;

use tokio::sync::broadcast;

use crate::context::HelperContext;
use transport::Transport;

pub use client::{ClientError, HelperClient, HelperConnection};
pub use methods::MethodHandler;
pub use protocol::{Request, Response, RpcError};

/// The privileged helper's socket server.
pub struct HelperServer {
    transport: Transport,
    shutdown_tx: broadcast::Sender<()>,
}

impl HelperServer {
    pub fn new(ctx: HelperContext) -> Self {
        let socket_path = ctx.config.socket_path.clone();
        let socket_mode = ctx.config.socket_mode;
        let handler = MethodHandler::new(ctx);
        let transport = Transport::new(socket_path, socket_mode, handler);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            transport,
            shutdown_tx,
        }
    }

    /// Serve until [`shutdown`](Self::shutdown) is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.transport.listen(shutdown_rx).await
    }

    /// Stop accepting connections. Sessions already running carry on.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
