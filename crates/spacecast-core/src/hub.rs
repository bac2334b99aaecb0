//! The hub: a single control loop owning the session registry.
//!
//! Pumps and HTTP handlers never touch the registry directly; they send
//! commands through a [`HubHandle`] and the loop applies them one at a
//! time. Every fan-out is a non-blocking enqueue, so one slow consumer
//! cannot stall the loop.

use bytes::Bytes;
use spacecast_protocol::{codec, Envelope, ProtocolError, SpaceId};
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace};

use crate::message::SpaceMessage;
use crate::router::{Delivery, SpaceRouter};
use crate::session::{ClientSession, SessionId};

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub loop is no longer running.
    #[error("Hub is not running")]
    Closed,

    /// A frame could not be encoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the command mailbox.
    pub command_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_buffer: 1024,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HubStats {
    /// Number of registered sessions.
    pub session_count: usize,
    /// Number of spaces with at least one session.
    pub space_count: usize,
}

enum Command {
    Register(ClientSession),
    Unregister(SessionId),
    Broadcast(Bytes),
    SpaceBroadcast(SpaceMessage),
    Contains(SessionId, oneshot::Sender<bool>),
    Stats(oneshot::Sender<HubStats>),
}

/// The hub control loop.
pub struct Hub {
    router: SpaceRouter,
    commands: mpsc::Receiver<Command>,
}

/// Cloneable handle for sending commands to a [`Hub`].
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<Command>,
}

impl Hub {
    /// Create a hub and the handle that drives it.
    #[must_use]
    pub fn new(config: HubConfig) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(config.command_buffer.max(1));
        let hub = Self {
            router: SpaceRouter::new(),
            commands: rx,
        };
        (hub, HubHandle { commands: tx })
    }

    /// Create a hub and run it on a background task.
    #[must_use]
    pub fn spawn(config: HubConfig) -> HubHandle {
        let (hub, handle) = Self::new(config);
        tokio::spawn(hub.run());
        handle
    }

    /// Run until every [`HubHandle`] has been dropped.
    ///
    /// Registered sessions are dropped on exit, closing their queues.
    pub async fn run(mut self) {
        info!("Hub started");

        while let Some(command) = self.commands.recv().await {
            self.handle(command);
        }

        info!(sessions = self.router.len(), "Hub stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register(session) => self.register(session),
            Command::Unregister(id) => self.unregister(&id),
            Command::Broadcast(frame) => {
                let delivery = self.router.deliver_all(&frame);
                trace!(recipients = delivery.delivered, "Broadcast to all");
                self.announce_evictions(delivery);
            }
            Command::SpaceBroadcast(message) => {
                self.fan_out(&message.space_id, &message.payload);
            }
            Command::Contains(id, reply) => {
                let _ = reply.send(self.router.contains(&id));
            }
            Command::Stats(reply) => {
                let _ = reply.send(HubStats {
                    session_count: self.router.len(),
                    space_count: self.router.space_count(),
                });
            }
        }
    }

    fn register(&mut self, session: ClientSession) {
        let join = Envelope::join(&session.user_id, &session.username, &session.space_id);
        let space_id = session.space_id.clone();

        if self.router.insert(session) {
            self.fan_out_envelope(&space_id, &join);
        }
    }

    fn unregister(&mut self, id: &SessionId) {
        let Some(session) = self.router.remove(id) else {
            trace!(session = %id, "Unregister of unknown session ignored");
            return;
        };

        let leave = Envelope::leave(&session.user_id, &session.username, &session.space_id);
        // Close the queue before telling the rest of the space
        drop(session);
        self.fan_out_envelope(&leave.space_id, &leave);
    }

    fn fan_out_envelope(&mut self, space_id: &str, envelope: &Envelope) {
        match codec::encode(envelope) {
            Ok(frame) => self.fan_out(space_id, &frame),
            Err(e) => error!(space = %space_id, error = %e, "Failed to encode envelope"),
        }
    }

    fn fan_out(&mut self, space_id: &str, frame: &Bytes) {
        let delivery = self.router.deliver_to_space(space_id, frame);
        trace!(space = %space_id, recipients = delivery.delivered, "Space broadcast");
        self.announce_evictions(delivery);
    }

    /// Send a `leave` for every evicted session.
    ///
    /// A leave can itself overflow further queues; those sessions are
    /// announced in turn until nothing more is evicted.
    fn announce_evictions(&mut self, delivery: Delivery) {
        let mut pending: VecDeque<ClientSession> = delivery.evicted.into();
        if !pending.is_empty() {
            debug!(count = pending.len(), "Sessions evicted during fan-out");
        }

        while let Some(session) = pending.pop_front() {
            let leave = Envelope::leave(&session.user_id, &session.username, &session.space_id);
            drop(session);

            let frame = match codec::encode(&leave) {
                Ok(frame) => frame,
                Err(e) => {
                    error!(space = %leave.space_id, error = %e, "Failed to encode envelope");
                    continue;
                }
            };
            let delivery = self.router.deliver_to_space(&leave.space_id, &frame);
            pending.extend(delivery.evicted);
        }
    }
}

impl HubHandle {
    async fn send(&self, command: Command) -> Result<(), HubError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Register a session and announce it to its space.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is not running.
    pub async fn register(&self, session: ClientSession) -> Result<(), HubError> {
        self.send(Command::Register(session)).await
    }

    /// Unregister a session. Unknown ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is not running.
    pub async fn unregister(&self, id: SessionId) -> Result<(), HubError> {
        self.send(Command::Unregister(id)).await
    }

    /// Enqueue a frame to every registered session.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is not running.
    pub async fn broadcast_all(&self, frame: Bytes) -> Result<(), HubError> {
        self.send(Command::Broadcast(frame)).await
    }

    /// Enqueue a frame to every session in a space.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is not running.
    pub async fn space_broadcast(
        &self,
        space_id: impl Into<SpaceId>,
        frame: Bytes,
    ) -> Result<(), HubError> {
        self.send(Command::SpaceBroadcast(SpaceMessage::new(space_id, frame)))
            .await
    }

    /// Encode an envelope and broadcast it to its `space_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the hub is not running.
    pub async fn broadcast_envelope(&self, envelope: &Envelope) -> Result<(), HubError> {
        let frame = codec::encode(envelope)?;
        self.space_broadcast(envelope.space_id.clone(), frame).await
    }

    /// Check whether a session is currently registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is not running.
    pub async fn contains(&self, id: &SessionId) -> Result<bool, HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Contains(id.clone(), tx)).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Get hub statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is not running.
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stats(tx)).await?;
        rx.await.map_err(|_| HubError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spacecast_protocol::EnvelopeType;
    use spacecast_transport::ConnectionId;
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;

    fn session(user: &str, space: &str, capacity: usize) -> (ClientSession, Receiver<Bytes>) {
        ClientSession::new(ConnectionId::generate(), user, format!("user-{user}"), space, capacity)
    }

    fn drain(rx: &mut Receiver<Bytes>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(codec::decode(&frame).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_register_announces_join() {
        let hub = Hub::spawn(HubConfig::default());
        let (a, mut rx_a) = session("1", "42", 8);
        let (b, mut rx_b) = session("2", "42", 8);

        hub.register(a).await.unwrap();
        hub.register(b).await.unwrap();
        hub.stats().await.unwrap();

        let seen_by_a = drain(&mut rx_a);
        assert_eq!(seen_by_a.len(), 2);
        assert!(seen_by_a.iter().all(|e| e.kind == EnvelopeType::Join));
        assert_eq!(seen_by_a[1].user_id, "2");

        let seen_by_b = drain(&mut rx_b);
        assert_eq!(seen_by_b.len(), 1);
        assert_eq!(seen_by_b[0].user_id, "2");
    }

    #[tokio::test]
    async fn test_space_broadcast_isolation() {
        let hub = Hub::spawn(HubConfig::default());
        let (s1, mut rx1) = session("1", "42", 8);
        let (s2, mut rx2) = session("2", "42", 8);
        let (s3, mut rx3) = session("3", "7", 8);
        hub.register(s1).await.unwrap();
        hub.register(s2).await.unwrap();
        hub.register(s3).await.unwrap();
        hub.stats().await.unwrap();
        drain(&mut rx1);
        drain(&mut rx2);
        drain(&mut rx3);

        let chat = Envelope::new(EnvelopeType::Chat, serde_json::json!({"content": "hi"}), "1", "42");
        hub.broadcast_envelope(&chat).await.unwrap();
        hub.stats().await.unwrap();

        assert_eq!(drain(&mut rx1), vec![chat.clone()]);
        assert_eq!(drain(&mut rx2), vec![chat]);
        assert!(drain(&mut rx3).is_empty());
    }

    #[tokio::test]
    async fn test_unregister_announces_leave_and_closes_queue() {
        let hub = Hub::spawn(HubConfig::default());
        let (a, mut rx_a) = session("1", "42", 8);
        let (b, mut rx_b) = session("2", "42", 8);
        let a_id = a.id.clone();
        hub.register(a).await.unwrap();
        hub.register(b).await.unwrap();

        hub.unregister(a_id.clone()).await.unwrap();
        assert!(!hub.contains(&a_id).await.unwrap());

        let seen_by_b = drain(&mut rx_b);
        assert_eq!(seen_by_b.last().unwrap().kind, EnvelopeType::Leave);
        assert_eq!(seen_by_b.last().unwrap().user_id, "1");

        drain(&mut rx_a);
        assert!(rx_a.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unregister_absent_is_noop() {
        let hub = Hub::spawn(HubConfig::default());
        let (a, mut rx_a) = session("1", "42", 8);
        hub.register(a).await.unwrap();

        hub.unregister(ConnectionId::generate()).await.unwrap();
        let stats = hub.stats().await.unwrap();

        assert_eq!(stats.session_count, 1);
        // Only a's own join, no leave
        assert_eq!(drain(&mut rx_a).len(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_evicts_without_blocking() {
        let hub = Hub::spawn(HubConfig::default());
        // Capacity 1 is consumed by the join envelope
        let (slow, _slow_rx) = session("1", "42", 1);
        let slow_id = slow.id.clone();
        hub.register(slow).await.unwrap();

        let frame = Bytes::from_static(b"{}");
        tokio::time::timeout(Duration::from_secs(1), async {
            for _ in 0..3 {
                hub.space_broadcast("42", frame.clone()).await.unwrap();
            }
        })
        .await
        .expect("fan-out must not block");

        assert!(!hub.contains(&slow_id).await.unwrap());
        assert_eq!(hub.stats().await.unwrap().session_count, 0);
    }

    #[tokio::test]
    async fn test_evicted_session_is_announced_as_leave() {
        let hub = Hub::spawn(HubConfig::default());
        // Both joins fill the slow queue, the chat overflows it
        let (slow, _slow_rx) = session("1", "42", 2);
        let (peer, mut peer_rx) = session("2", "42", 8);
        hub.register(slow).await.unwrap();
        hub.register(peer).await.unwrap();
        hub.stats().await.unwrap();
        drain(&mut peer_rx);

        let chat = Envelope::new(EnvelopeType::Chat, serde_json::json!({"content": "hi"}), "2", "42");
        hub.broadcast_envelope(&chat).await.unwrap();
        hub.stats().await.unwrap();

        let seen = drain(&mut peer_rx);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], chat);
        assert_eq!(seen[1].kind, EnvelopeType::Leave);
        assert_eq!(seen[1].user_id, "1");
        assert_eq!(hub.stats().await.unwrap().session_count, 1);
    }

    #[tokio::test]
    async fn test_broadcast_all() {
        let hub = Hub::spawn(HubConfig::default());
        let (a, mut rx_a) = session("1", "42", 8);
        let (b, mut rx_b) = session("2", "7", 8);
        hub.register(a).await.unwrap();
        hub.register(b).await.unwrap();
        hub.stats().await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        hub.broadcast_all(codec::encode(&Envelope::ping()).unwrap())
            .await
            .unwrap();
        hub.stats().await.unwrap();

        assert_eq!(drain(&mut rx_a)[0].kind, EnvelopeType::Ping);
        assert_eq!(drain(&mut rx_b)[0].kind, EnvelopeType::Ping);
    }

    #[tokio::test]
    async fn test_dropping_handles_stops_hub() {
        let (hub, handle) = Hub::new(HubConfig::default());
        let (a, mut rx_a) = session("1", "42", 8);
        let task = tokio::spawn(hub.run());

        handle.register(a).await.unwrap();
        drop(handle);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        drain(&mut rx_a);
        assert!(rx_a.recv().await.is_none());
    }
}
