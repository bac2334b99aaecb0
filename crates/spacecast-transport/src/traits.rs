//! Connection abstraction traits for spacecast.
//!
//! A [`Connection`] is one bidirectional message stream. The session pumps
//! and the user-scoped managers only ever talk to this trait, so any real
//! or fake stream satisfying it is usable.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::time::Instant;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of a transport frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Text,
    Binary,
    Ping,
    Pong,
    Close,
}

/// A single transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub data: Bytes,
}

impl Frame {
    #[must_use]
    pub fn new(kind: FrameKind, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    #[must_use]
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Text, data)
    }

    #[must_use]
    pub fn close() -> Self {
        Self::new(FrameKind::Close, Bytes::new())
    }

    /// Whether this frame carries application data.
    #[must_use]
    pub fn is_data(&self) -> bool {
        matches!(self.kind, FrameKind::Text | FrameKind::Binary)
    }
}

/// Connection errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Connection was closed.
    #[error("Connection closed")]
    Closed,

    /// A read or write deadline elapsed.
    #[error("Connection timed out")]
    Timeout,

    /// Inbound message exceeds the configured limit.
    #[error("Message size {size} exceeds limit {limit}")]
    MessageTooLarge { size: usize, limit: usize },

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Callback fired whenever the remote end answers a liveness probe.
pub type LivenessHandler = Arc<dyn Fn() + Send + Sync>;

/// An active bidirectional message stream.
///
/// All methods take `&self`: one task may block in [`Connection::read_frame`]
/// while others write or close.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Receive the next data frame.
    ///
    /// Blocks until a text or binary frame arrives. Liveness replies are
    /// consumed here and fire the liveness handler instead of being
    /// returned.
    async fn read_frame(&self) -> Result<Frame, ConnectionError>;

    /// Send one frame.
    ///
    /// Writing a [`FrameKind::Close`] frame completes the close handshake
    /// from this side and leaves the connection closed.
    async fn write_frame(&self, kind: FrameKind, data: Bytes) -> Result<(), ConnectionError>;

    /// Close the connection. Calling this more than once is a no-op.
    async fn close(&self) -> Result<(), ConnectionError>;

    /// Bound subsequent reads. `None` removes the bound.
    fn set_read_deadline(&self, deadline: Option<Instant>);

    /// Bound subsequent writes. `None` removes the bound.
    fn set_write_deadline(&self, deadline: Option<Instant>);

    /// Install the callback fired on liveness replies.
    fn set_liveness_handler(&self, handler: LivenessHandler);

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}
