//! WebSocket ingestor server.
//!
//! Devices connect to `GET /ws` and push one JSON coordinate record per
//! message. Each upgraded connection is attached to the bridge as a session.
//! While the bridge is shutting down, upgrades are refused with
//! `503 Service Unavailable`.

pub mod connection;
pub mod error;
pub mod handler;

use std::net::SocketAddr;

use axum::{Router, routing::get};
use geobridge_core::BridgeHandle;
use snafu::ResultExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use connection::WsConnection;
pub use error::{Result, WsServerError};

use crate::{
    error::{BindSnafu, ServeSnafu},
    handler::ws_handler,
};

/// Default limit on the size of a single device message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// WebSocket server that attaches device connections to a bridge.
pub struct WsIngestor {
    state: WsIngestorState,
}

#[derive(Clone)]
pub struct WsIngestorState {
    bridge: BridgeHandle,
    max_message_size: usize,
}

impl WsIngestor {
    pub fn new(bridge: BridgeHandle) -> Self {
        let state = WsIngestorState {
            bridge,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        };

        Self { state }
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.state.max_message_size = max_message_size;
        self
    }

    pub fn into_router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .with_state(self.state)
    }
}

/// Binds `address`, returning the listener.
pub async fn bind(address: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(address).await.context(BindSnafu { address })
}

/// Serves `router` until `ct` is cancelled.
///
/// The router is served with connection info, which the `/ws` handler needs to
/// name its peers.
pub async fn serve(listener: TcpListener, router: Router, ct: CancellationToken) -> Result<()> {
    if let Ok(address) = listener.local_addr() {
        info!(%address, "websocket server listening");
    }

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        ct.cancelled().await;
    })
    .await
    .context(ServeSnafu)
}
