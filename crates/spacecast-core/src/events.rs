//! Domain events and the in-process bus that carries them.
//!
//! Emitting never waits on handlers. Each subscribed handler runs on its
//! own task and sees events in emit order, but handlers are not ordered
//! relative to each other. A handler that falls too far behind skips the
//! events it missed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use spacecast_protocol::{Notification, UserId};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::message::generate_id;
use crate::notification::NotificationManager;

/// Default bus capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Error type returned by event handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Something that happened elsewhere in the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    CommentCreated {
        comment_id: String,
        post_id: String,
        post_author_id: UserId,
        actor_id: UserId,
    },
    ReactionCreated {
        post_id: String,
        post_author_id: UserId,
        actor_id: UserId,
        reaction: String,
    },
}

impl DomainEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CommentCreated { .. } => "comment_created",
            Self::ReactionCreated { .. } => "reaction_created",
        }
    }

    /// User the event concerns.
    #[must_use]
    pub fn recipient(&self) -> &str {
        match self {
            Self::CommentCreated { post_author_id, .. }
            | Self::ReactionCreated { post_author_id, .. } => post_author_id,
        }
    }

    /// User who caused the event.
    #[must_use]
    pub fn actor(&self) -> &str {
        match self {
            Self::CommentCreated { actor_id, .. } | Self::ReactionCreated { actor_id, .. } => {
                actor_id
            }
        }
    }

    /// Notification for the recipient.
    #[must_use]
    pub fn to_notification(&self) -> Notification {
        let (kind, data) = match self {
            Self::CommentCreated {
                comment_id,
                post_id,
                ..
            } => (
                "comment",
                json!({ "comment_id": comment_id, "post_id": post_id }),
            ),
            Self::ReactionCreated {
                post_id, reaction, ..
            } => ("reaction", json!({ "post_id": post_id, "reaction": reaction })),
        };

        Notification::new(generate_id("notif"), kind, self.recipient(), data)
            .with_actor(self.actor())
    }
}

/// Fire-and-forget event publication.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: DomainEvent);
}

/// Reacts to events published on an [`EventBus`].
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError>;
}

/// In-process publish/subscribe bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Run `handler` on its own task for every event emitted from now on.
    ///
    /// The task ends when every clone of the bus has been dropped.
    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) -> JoinHandle<()> {
        let mut receiver = self.sender.subscribe();
        debug!(handler = handler.name(), "Event handler subscribed");

        tokio::spawn(async move {
            loop {
                let event = match receiver.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(handler = handler.name(), skipped, "Event handler lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                if let Err(e) = handler.handle(&event).await {
                    warn!(
                        handler = handler.name(),
                        event = event.kind(),
                        error = %e,
                        "Event handler failed"
                    );
                }
            }
            trace!(handler = handler.name(), "Event handler stopped");
        })
    }

    /// Number of subscribed handlers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl EventEmitter for EventBus {
    fn emit(&self, event: DomainEvent) {
        let kind = event.kind();
        match self.sender.send(Arc::new(event)) {
            Ok(handlers) => trace!(event = kind, handlers, "Event emitted"),
            Err(_) => trace!(event = kind, "Event emitted with no handlers"),
        }
    }
}

/// Turns domain events into user notifications.
pub struct NotificationEventHandler {
    notifications: Arc<NotificationManager>,
}

impl NotificationEventHandler {
    #[must_use]
    pub fn new(notifications: Arc<NotificationManager>) -> Self {
        Self { notifications }
    }
}

#[async_trait]
impl EventHandler for NotificationEventHandler {
    fn name(&self) -> &'static str {
        "notifications"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        // Acting on your own content is not news
        if event.actor() == event.recipient() {
            return Ok(());
        }

        let notification = event.to_notification();
        self.notifications
            .broadcast_to_user(event.recipient(), &notification)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ManagerConfig;
    use spacecast_transport::{Connection, MemoryConnection};
    use std::time::Duration;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(1);

    fn comment(author: &str, actor: &str) -> DomainEvent {
        DomainEvent::CommentCreated {
            comment_id: "c1".into(),
            post_id: "p1".into(),
            post_author_id: author.into(),
            actor_id: actor.into(),
        }
    }

    struct Recorder {
        seen: mpsc::UnboundedSender<DomainEvent>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
            let _ = self.seen.send(event.clone());
            Ok(())
        }
    }

    #[test]
    fn test_event_wire_format() {
        let event: DomainEvent = serde_json::from_str(
            r#"{"type":"reaction_created","post_id":"p1","post_author_id":"7","actor_id":"8","reaction":"like"}"#,
        )
        .unwrap();
        assert_eq!(event.kind(), "reaction_created");
        assert_eq!(event.recipient(), "7");
        assert_eq!(event.actor(), "8");

        let notification = event.to_notification();
        assert_eq!(notification.kind, "reaction");
        assert_eq!(notification.user_id, "7");
        assert_eq!(notification.actor_id.as_deref(), Some("8"));
        assert_eq!(notification.data["reaction"], "like");
    }

    #[tokio::test]
    async fn test_bus_delivers_to_every_handler() {
        let bus = EventBus::default();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        bus.subscribe(Arc::new(Recorder { seen: tx1 }));
        bus.subscribe(Arc::new(Recorder { seen: tx2 }));
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit(comment("1", "2"));

        for rx in [&mut rx1, &mut rx2] {
            let event = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            assert_eq!(event, comment("1", "2"));
        }
    }

    #[tokio::test]
    async fn test_emit_without_handlers_is_fine() {
        let bus = EventBus::default();
        bus.emit(comment("1", "2"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_handler_stops_when_bus_dropped() {
        let bus = EventBus::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let task = bus.subscribe(Arc::new(Recorder { seen: tx }));

        drop(bus);
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_notification_handler_pushes_to_recipient() {
        let notifications = Arc::new(NotificationManager::new(ManagerConfig::default()));
        let (conn, mut peer) = MemoryConnection::pair();
        let conn: Arc<dyn Connection> = Arc::new(conn);
        notifications.handle_connection("1", conn).await.unwrap();

        let bus = EventBus::default();
        bus.subscribe(Arc::new(NotificationEventHandler::new(notifications)));

        // Self-action is skipped, the next one is delivered
        bus.emit(comment("1", "1"));
        bus.emit(comment("1", "2"));

        let frame = peer.recv_data(WAIT).await.unwrap();
        let notification: Notification = serde_json::from_slice(&frame.data).unwrap();
        assert_eq!(notification.kind, "comment");
        assert_eq!(notification.user_id, "1");
        assert_eq!(notification.actor_id.as_deref(), Some("2"));
        assert_eq!(notification.data["comment_id"], "c1");

        assert!(peer.recv_data(Duration::from_millis(50)).await.is_none());
    }
}
