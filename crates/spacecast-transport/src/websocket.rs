//! WebSocket connection over an upgraded axum socket.
//!
//! The socket is split so that the inbound pump can block on reads while
//! the outbound pump and the managers write.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::state::{bounded, ConnectionState};
use crate::traits::{Connection, ConnectionError, ConnectionId, Frame, FrameKind, LivenessHandler};

/// Default maximum inbound message size in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// A WebSocket connection.
pub struct WebSocketConnection {
    id: ConnectionId,
    state: ConnectionState,
    sink: Mutex<SplitSink<WebSocket, Message>>,
    stream: Mutex<SplitStream<WebSocket>>,
    remote_addr: Option<SocketAddr>,
    max_message_size: usize,
}

impl WebSocketConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket, max_message_size: usize) -> Self {
        let (sink, stream) = socket.split();
        Self {
            id: ConnectionId::generate(),
            state: ConnectionState::new(),
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            remote_addr: None,
            max_message_size,
        }
    }

    /// Record the peer address for logging.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    fn check_size(&self, size: usize) -> Result<(), ConnectionError> {
        if size > self.max_message_size {
            warn!(
                connection = %self.id,
                "Message too large: {} bytes (max: {})",
                size,
                self.max_message_size
            );
            return Err(ConnectionError::MessageTooLarge {
                size,
                limit: self.max_message_size,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn read_frame(&self) -> Result<Frame, ConnectionError> {
        if !self.state.is_open() {
            return Err(ConnectionError::Closed);
        }

        let mut stream = self.stream.lock().await;

        loop {
            let deadline = self.state.read_deadline();

            let next = tokio::select! {
                biased;
                _ = self.state.closed() => return Err(ConnectionError::Closed),
                next = bounded(deadline, stream.next()) => next?,
            };

            match next {
                Some(Ok(Message::Text(text))) => {
                    self.check_size(text.len())?;
                    return Ok(Frame::new(FrameKind::Text, text));
                }
                Some(Ok(Message::Binary(data))) => {
                    self.check_size(data.len())?;
                    return Ok(Frame::new(FrameKind::Binary, data));
                }
                Some(Ok(Message::Ping(_))) => {
                    // Answered by the websocket layer
                }
                Some(Ok(Message::Pong(_))) => {
                    self.state.fire_liveness();
                }
                Some(Ok(Message::Close(_))) => {
                    debug!(connection = %self.id, "Received close frame");
                    self.state.mark_closed();
                    return Err(ConnectionError::Closed);
                }
                Some(Err(e)) => {
                    debug!(connection = %self.id, error = %e, "WebSocket error");
                    self.state.mark_closed();
                    return Err(ConnectionError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!(connection = %self.id, "WebSocket stream ended");
                    self.state.mark_closed();
                    return Err(ConnectionError::Closed);
                }
            }
        }
    }

    async fn write_frame(&self, kind: FrameKind, data: Bytes) -> Result<(), ConnectionError> {
        if !self.state.is_open() {
            return Err(ConnectionError::Closed);
        }

        let message = match kind {
            FrameKind::Text => Message::Text(
                String::from_utf8(data.to_vec())
                    .map_err(|e| ConnectionError::SendFailed(e.to_string()))?,
            ),
            FrameKind::Binary => Message::Binary(data.to_vec()),
            FrameKind::Ping => Message::Ping(data.to_vec()),
            FrameKind::Pong => Message::Pong(data.to_vec()),
            FrameKind::Close => Message::Close(None),
        };

        let deadline = self.state.write_deadline();
        let result = bounded(deadline, async {
            let mut sink = self.sink.lock().await;
            sink.send(message).await
        })
        .await?
        .map_err(|e| ConnectionError::SendFailed(e.to_string()));

        if kind == FrameKind::Close {
            self.state.mark_closed();
        }

        result
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        if !self.state.mark_closed() {
            return Ok(()); // Already closed
        }

        let deadline = self.state.write_deadline();
        bounded(deadline, async {
            let mut sink = self.sink.lock().await;
            sink.close().await
        })
        .await?
        .map_err(|e| ConnectionError::Other(format!("Failed to close: {}", e)))
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.state.set_read_deadline(deadline);
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.state.set_write_deadline(deadline);
    }

    fn set_liveness_handler(&self, handler: LivenessHandler) {
        self.state.set_liveness_handler(handler);
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }

    fn is_open(&self) -> bool {
        self.state.is_open()
    }
}
