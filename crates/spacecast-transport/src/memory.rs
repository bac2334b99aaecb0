//! In-memory connection.
//!
//! [`MemoryConnection`] is the server side handed to pumps and managers;
//! [`MemoryPeer`] plays the remote client. Dropping the peer behaves like
//! a client that vanished: server reads end and server writes fail.
//! [`MemoryPeer::stall`] behaves like a client that stopped reading:
//! server writes block until their deadline passes.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::trace;

use crate::state::{bounded, ConnectionState};
use crate::traits::{Connection, ConnectionError, ConnectionId, Frame, FrameKind, LivenessHandler};

/// Server side of an in-memory connection.
pub struct MemoryConnection {
    id: ConnectionId,
    state: ConnectionState,
    inbound: Mutex<mpsc::UnboundedReceiver<Frame>>,
    outbound: mpsc::UnboundedSender<Frame>,
    stalled: watch::Receiver<bool>,
}

/// Client side of an in-memory connection.
pub struct MemoryPeer {
    inbound: mpsc::UnboundedSender<Frame>,
    outbound: mpsc::UnboundedReceiver<Frame>,
    stalled: watch::Sender<bool>,
}

impl MemoryConnection {
    /// Create a connected server/peer pair.
    #[must_use]
    pub fn pair() -> (Self, MemoryPeer) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (stalled_tx, stalled_rx) = watch::channel(false);

        let conn = Self {
            id: ConnectionId::generate(),
            state: ConnectionState::new(),
            inbound: Mutex::new(inbound_rx),
            outbound: outbound_tx,
            stalled: stalled_rx,
        };
        let peer = MemoryPeer {
            inbound: inbound_tx,
            outbound: outbound_rx,
            stalled: stalled_tx,
        };

        (conn, peer)
    }

    /// Resolves once the peer accepts writes. A dropped peer never stalls.
    async fn writable(&self) {
        let mut stalled = self.stalled.clone();
        let _ = stalled.wait_for(|stalled| !*stalled).await;
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn read_frame(&self) -> Result<Frame, ConnectionError> {
        if !self.state.is_open() {
            return Err(ConnectionError::Closed);
        }

        let mut inbound = self.inbound.lock().await;

        loop {
            // Re-read every iteration, a pong may have moved it
            let deadline = self.state.read_deadline();

            let next = tokio::select! {
                biased;
                _ = self.state.closed() => return Err(ConnectionError::Closed),
                next = bounded(deadline, inbound.recv()) => next?,
            };

            let Some(frame) = next else {
                self.state.mark_closed();
                return Err(ConnectionError::Closed);
            };

            match frame.kind {
                FrameKind::Text | FrameKind::Binary => return Ok(frame),
                FrameKind::Pong => self.state.fire_liveness(),
                FrameKind::Ping => {
                    let _ = self.outbound.send(Frame::new(FrameKind::Pong, frame.data));
                }
                FrameKind::Close => {
                    trace!(connection = %self.id, "Peer sent close");
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
        if self
            .state
            .write_deadline()
            .is_some_and(|deadline| deadline <= Instant::now())
        {
            return Err(ConnectionError::Timeout);
        }

        tokio::select! {
            biased;
            _ = self.state.closed() => return Err(ConnectionError::Closed),
            ready = bounded(self.state.write_deadline(), self.writable()) => ready?,
        }

        let result = self
            .outbound
            .send(Frame::new(kind, data))
            .map_err(|_| ConnectionError::SendFailed("peer dropped".into()));

        if kind == FrameKind::Close {
            self.state.mark_closed();
        }

        result
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        if !self.state.mark_closed() {
            return Ok(());
        }

        // The close frame queues behind a stalled peer like any other write
        bounded(self.state.write_deadline(), self.writable()).await?;
        let _ = self.outbound.send(Frame::close());
        Ok(())
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
        Some("memory".to_string())
    }

    fn is_open(&self) -> bool {
        self.state.is_open()
    }
}

impl MemoryPeer {
    /// Send a text frame to the server. Returns `false` once the server
    /// side is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(Frame::text(text.into()))
    }

    /// Answer a liveness probe.
    pub fn send_pong(&self) -> bool {
        self.send(Frame::new(FrameKind::Pong, Bytes::new()))
    }

    /// Start a close handshake from the client side.
    pub fn send_close(&self) -> bool {
        self.send(Frame::close())
    }

    /// Send an arbitrary frame.
    pub fn send(&self, frame: Frame) -> bool {
        self.inbound.send(frame).is_ok()
    }

    /// Receive the next frame written by the server.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.outbound.recv().await
    }

    /// Receive the next frame, giving up after `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Frame> {
        tokio::time::timeout(timeout, self.outbound.recv())
            .await
            .ok()
            .flatten()
    }

    /// Receive the next data frame, skipping probes and close frames.
    pub async fn recv_data(&mut self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            let frame = tokio::time::timeout_at(deadline, self.outbound.recv())
                .await
                .ok()
                .flatten()?;
            if frame.is_data() {
                return Some(frame);
            }
        }
    }

    /// Stop accepting server writes until [`resume`](Self::resume).
    pub fn stall(&self) {
        self.stalled.send_replace(true);
    }

    /// Accept server writes again, releasing any blocked writer.
    pub fn resume(&self) {
        self.stalled.send_replace(false);
    }

    /// Take a frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.outbound.try_recv().ok()
    }
}
