use async_trait::async_trait;
use bytes::Bytes;
use snafu::Snafu;

/// One inbound device connection, as seen by a session.
///
/// The transport owns framing and the handshake; the session only sees
/// complete messages.
#[async_trait]
pub trait SourceConnection: Send + 'static {
    /// Receives the next message.
    ///
    /// Returns `None` once the peer closed the connection.
    async fn recv(&mut self) -> Option<Result<Bytes, ConnectionError>>;

    /// Closes the connection. Must be idempotent.
    async fn close(&mut self);

    /// A description of the peer, used in logs.
    fn peer(&self) -> String {
        "unknown".to_string()
    }
}

#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum ConnectionError {
    #[snafu(display("connection reset: {message}"))]
    Reset { message: String },
    #[snafu(display("protocol error: {message}"))]
    Protocol { message: String },
}
