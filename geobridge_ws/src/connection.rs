use std::net::SocketAddr;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use geobridge_core::{ConnectionError, SourceConnection};
use tracing::debug;

/// A device connected over WebSocket.
///
/// Text and binary messages are handed to the session as is. Pings are
/// answered by axum and never reach the session.
pub struct WsConnection {
    socket: WebSocket,
    peer: SocketAddr,
    closed: bool,
}

impl WsConnection {
    pub fn new(socket: WebSocket, peer: SocketAddr) -> Self {
        Self {
            socket,
            peer,
            closed: false,
        }
    }
}

#[async_trait]
impl SourceConnection for WsConnection {
    async fn recv(&mut self) -> Option<Result<Bytes, ConnectionError>> {
        if self.closed {
            return None;
        }

        loop {
            let message = match self.socket.recv().await? {
                Ok(message) => message,
                Err(err) => {
                    self.closed = true;
                    return Some(Err(ConnectionError::Reset {
                        message: err.to_string(),
                    }));
                }
            };

            match message {
                Message::Text(text) => {
                    return Some(Ok(Bytes::copy_from_slice(text.as_str().as_bytes())));
                }
                Message::Binary(data) => return Some(Ok(data)),
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(frame) => {
                    debug!(peer = %self.peer, ?frame, "peer closed websocket");
                    self.closed = true;
                    return None;
                }
            }
        }
    }

    async fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }

        if let Err(err) = self.socket.send(Message::Close(None)).await {
            debug!(peer = %self.peer, err = %err, "failed to send close frame");
        }
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }
}
