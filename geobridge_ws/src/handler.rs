use std::net::SocketAddr;

use axum::{
    extract::{
        ConnectInfo, State,
        ws::{WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use geobridge_core::{BridgeError, BridgeHandle};
use tracing::{debug, info, warn};

use crate::{WsIngestorState, connection::WsConnection};

/// Handler for the `/ws` endpoint.
pub async fn ws_handler(
    State(state): State<WsIngestorState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if state.bridge.is_shutting_down() {
        debug!(%peer, "refusing connection while shutting down");
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            warn!(
                %peer,
                kind = rejection_kind(&rejection),
                status = rejection.status().as_u16(),
                "websocket upgrade rejected"
            );
            return rejection.into_response();
        }
    };

    upgrade
        .max_message_size(state.max_message_size)
        .on_failed_upgrade(move |err| {
            warn!(%peer, kind = "handshake", err = %err, "websocket upgrade failed");
        })
        .on_upgrade(move |socket| attach(state.bridge, socket, peer))
}

async fn attach(bridge: BridgeHandle, socket: WebSocket, peer: SocketAddr) {
    let conn = WsConnection::new(socket, peer);

    match bridge.attach(conn).await {
        Ok(session_id) => info!(%peer, %session_id, "device connected"),
        Err(BridgeError::ShuttingDown) => {
            debug!(%peer, "connection dropped, bridge is shutting down");
        }
        Err(err) => warn!(%peer, err = %err, "failed to attach connection"),
    }
}

fn rejection_kind(rejection: &WebSocketUpgradeRejection) -> &'static str {
    match rejection {
        WebSocketUpgradeRejection::MethodNotGet(_) => "method_not_get",
        WebSocketUpgradeRejection::MethodNotConnect(_) => "method_not_connect",
        WebSocketUpgradeRejection::InvalidConnectionHeader(_) => "invalid_connection_header",
        WebSocketUpgradeRejection::InvalidUpgradeHeader(_) => "invalid_upgrade_header",
        WebSocketUpgradeRejection::InvalidProtocolPseudoheader(_) => "invalid_protocol",
        WebSocketUpgradeRejection::InvalidWebSocketVersionHeader(_) => "invalid_version",
        WebSocketUpgradeRejection::WebSocketKeyHeaderMissing(_) => "missing_key",
        WebSocketUpgradeRejection::ConnectionNotUpgradable(_) => "not_upgradable",
        _ => "other",
    }
}
