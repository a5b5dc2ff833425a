use std::net::SocketAddr;

use snafu::Snafu;

/// Errors that can occur in the WebSocket server.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WsServerError {
    #[snafu(display("failed to bind to address {address}"))]
    Bind {
        address: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("server error"))]
    Serve { source: std::io::Error },
}

pub type Result<T, E = WsServerError> = std::result::Result<T, E>;
