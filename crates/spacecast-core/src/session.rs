//! Client sessions and their read/write pumps.
//!
//! Each space connection gets two workers: the inbound pump reads and
//! dispatches frames, the outbound pump drains the session's bounded queue
//! onto the wire. The hub holds the only sender of that queue, so
//! unregistering or evicting a session is what stops its outbound pump.

use bytes::Bytes;
use spacecast_protocol::{
    codec, error_code, ChatInput, Envelope, EnvelopeType, ProtocolError, SpaceId, UserId,
};
use spacecast_transport::{Connection, ConnectionError, ConnectionId, FrameKind};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::chat::{ChatError, ChatService};
use crate::hub::HubError;
use crate::liveness;

/// Sessions are identified by the id of their connection.
pub type SessionId = ConnectionId;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for each write.
    pub write_wait: Duration,
    /// Read deadline window, extended by every liveness reply.
    pub pong_wait: Duration,
    /// Interval between liveness probes. Must be shorter than `pong_wait`.
    pub ping_period: Duration,
    /// Maximum inbound frame size in bytes.
    pub max_message_size: usize,
    /// Capacity of each session's outbound queue.
    pub send_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            write_wait: Duration::from_secs(10),
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            max_message_size: 8 * 1024,
            send_buffer: 256,
        }
    }
}

/// Why a frame could not be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("outbound queue full")]
    Full,
    #[error("outbound queue closed")]
    Closed,
}

/// A registered space connection.
#[derive(Debug)]
pub struct ClientSession {
    pub id: SessionId,
    pub user_id: UserId,
    pub username: String,
    pub space_id: SpaceId,
    sender: mpsc::Sender<Bytes>,
}

impl ClientSession {
    /// Create a session and the receiving end of its outbound queue.
    #[must_use]
    pub fn new(
        id: SessionId,
        user_id: impl Into<UserId>,
        username: impl Into<String>,
        space_id: impl Into<SpaceId>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let session = Self {
            id,
            user_id: user_id.into(),
            username: username.into(),
            space_id: space_id.into(),
            sender,
        };
        (session, receiver)
    }

    /// Enqueue a frame without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is full or its receiver is gone.
    pub fn try_enqueue(&self, frame: Bytes) -> Result<(), EnqueueError> {
        self.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }
}

/// Who is on the other end of a space connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_id: UserId,
    pub username: String,
    pub space_id: SpaceId,
}

impl SessionIdentity {
    #[must_use]
    pub fn new(
        user_id: impl Into<UserId>,
        username: impl Into<String>,
        space_id: impl Into<SpaceId>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            space_id: space_id.into(),
        }
    }
}

/// Serve one space connection until it closes.
///
/// Registers the session, spawns the outbound pump, runs the inbound pump
/// on the current task and unregisters the session exactly once when the
/// inbound pump exits.
///
/// # Errors
///
/// Returns an error if the hub is not running.
pub async fn serve_session(
    conn: Arc<dyn Connection>,
    identity: SessionIdentity,
    chat: ChatService,
    config: SessionConfig,
) -> Result<(), HubError> {
    let (session, queue) = ClientSession::new(
        conn.id().clone(),
        identity.user_id.clone(),
        identity.username.clone(),
        identity.space_id.clone(),
        config.send_buffer,
    );
    let session_id = session.id.clone();

    if let Err(e) = chat.hub().register(session).await {
        let _ = conn.close().await;
        return Err(e);
    }

    info!(
        session = %session_id,
        user = %identity.user_id,
        space = %identity.space_id,
        remote = conn.remote_addr().as_deref().unwrap_or("unknown"),
        "Session started"
    );

    let writer = tokio::spawn(write_pump(conn.clone(), queue, config.clone()));

    read_pump(&conn, &identity, &chat, &config).await;

    if let Err(e) = chat.hub().unregister(session_id.clone()).await {
        debug!(session = %session_id, error = %e, "Unregister after hub shutdown");
    }
    let _ = conn.close().await;
    let _ = writer.await;

    info!(session = %session_id, "Session ended");
    Ok(())
}

/// Read frames until the connection fails, dispatching each one.
async fn read_pump(
    conn: &Arc<dyn Connection>,
    identity: &SessionIdentity,
    chat: &ChatService,
    config: &SessionConfig,
) {
    liveness::refresh_on_pong(conn, config.pong_wait);

    loop {
        let frame = match conn.read_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                debug!(session = %conn.id(), error = %e, "Inbound pump stopped");
                return;
            }
        };

        if frame.data.len() > config.max_message_size {
            warn!(
                session = %conn.id(),
                size = frame.data.len(),
                limit = config.max_message_size,
                "Inbound frame too large"
            );
            return;
        }

        let result = match codec::decode(&frame.data) {
            Ok(envelope) => dispatch(conn, identity, chat, config, envelope).await,
            Err(ProtocolError::UnknownType(kind)) => {
                let message = format!("Unknown message type: {}", kind);
                reply_error(conn, config, error_code::UNKNOWN_TYPE, message).await
            }
            Err(e) => reply_error(conn, config, error_code::INVALID_MESSAGE, e.to_string()).await,
        };

        if let Err(e) = result {
            debug!(session = %conn.id(), error = %e, "Inbound pump stopped");
            return;
        }
    }
}

async fn dispatch(
    conn: &Arc<dyn Connection>,
    identity: &SessionIdentity,
    chat: &ChatService,
    config: &SessionConfig,
    envelope: Envelope,
) -> Result<(), ConnectionError> {
    match envelope.kind {
        EnvelopeType::Chat => {
            let content = envelope
                .data_as::<ChatInput>()
                .map(|input| input.content)
                .unwrap_or_default();

            match chat
                .post(
                    &identity.user_id,
                    &identity.username,
                    &identity.space_id,
                    &content,
                )
                .await
            {
                Ok(_) => Ok(()),
                Err(ChatError::Validation(e)) => {
                    reply_error(conn, config, error_code::VALIDATION_FAILED, e.to_string()).await
                }
                Err(ChatError::Persistence(e)) => {
                    reply_error(conn, config, error_code::PERSISTENCE_FAILED, e.to_string()).await
                }
                Err(ChatError::Hub(e)) => Err(ConnectionError::Other(e.to_string())),
            }
        }
        EnvelopeType::Ping => {
            let pong = Envelope::pong(&identity.user_id, &identity.space_id);
            reply(conn, config, &pong).await
        }
        EnvelopeType::Pong => {
            conn.set_read_deadline(Some(Instant::now() + config.pong_wait));
            Ok(())
        }
        EnvelopeType::Join | EnvelopeType::Leave | EnvelopeType::Error => {
            let message = format!("{} messages are sent by the server only", envelope.kind);
            reply_error(conn, config, error_code::UNSUPPORTED_TYPE, message).await
        }
    }
}

/// Write an envelope straight to this session's connection.
async fn reply(
    conn: &Arc<dyn Connection>,
    config: &SessionConfig,
    envelope: &Envelope,
) -> Result<(), ConnectionError> {
    let frame = codec::encode(envelope).map_err(|e| ConnectionError::Other(e.to_string()))?;
    conn.set_write_deadline(Some(Instant::now() + config.write_wait));
    conn.write_frame(FrameKind::Text, frame).await
}

async fn reply_error(
    conn: &Arc<dyn Connection>,
    config: &SessionConfig,
    code: &str,
    message: String,
) -> Result<(), ConnectionError> {
    debug!(session = %conn.id(), code = %code, "Rejecting inbound frame");
    reply(conn, config, &Envelope::error(code, message)).await
}

/// Drain the outbound queue onto the connection, probing liveness when idle.
async fn write_pump(
    conn: Arc<dyn Connection>,
    mut queue: mpsc::Receiver<Bytes>,
    config: SessionConfig,
) {
    let mut ticker = liveness::ticker(config.ping_period);

    loop {
        tokio::select! {
            next = queue.recv() => {
                let Some(first) = next else {
                    // Queue closed by the hub
                    conn.set_write_deadline(Some(Instant::now() + config.write_wait));
                    let _ = conn.write_frame(FrameKind::Close, Bytes::new()).await;
                    break;
                };

                let mut batch = vec![first];
                while let Ok(frame) = queue.try_recv() {
                    batch.push(frame);
                }

                conn.set_write_deadline(Some(Instant::now() + config.write_wait));
                if let Err(e) = conn.write_frame(FrameKind::Text, codec::coalesce(&batch)).await {
                    debug!(session = %conn.id(), error = %e, "Outbound pump stopped");
                    break;
                }
            }
            _ = ticker.tick() => {
                conn.set_write_deadline(Some(Instant::now() + config.write_wait));
                if let Err(e) = conn.write_frame(FrameKind::Ping, Bytes::new()).await {
                    debug!(session = %conn.id(), error = %e, "Liveness probe failed");
                    break;
                }
            }
        }
    }

    let _ = conn.close().await;
}
