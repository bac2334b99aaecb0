//! Per-user notification push.
//!
//! Each user holds at most one notification connection. Notifications are
//! fire-and-forget: an offline user simply misses them.

use spacecast_protocol::{codec, Notification, UserId};
use spacecast_transport::Connection;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::liveness;
use crate::registry::{ManagerConfig, ManagerError, UserRegistry};

/// Pushes notifications to connected users.
#[derive(Debug)]
pub struct NotificationManager {
    registry: UserRegistry,
    config: ManagerConfig,
}

impl NotificationManager {
    #[must_use]
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            registry: UserRegistry::new(config.max_connections, config.write_wait),
            config,
        }
    }

    /// Check whether `user_id` could connect right now.
    ///
    /// Called before upgrading so a full server can answer with a plain
    /// HTTP error.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::AtCapacity`] at the ceiling.
    pub async fn check_capacity(&self, user_id: &str) -> Result<(), ManagerError> {
        self.registry.check_capacity(user_id).await
    }

    /// Take ownership of a user's notification connection.
    ///
    /// Replaces and closes any previous connection for the user, then
    /// watches the new one in the background until it fails. The returned
    /// task finishes once the connection is gone.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::AtCapacity`] at the ceiling; `conn` is
    /// closed in that case.
    pub async fn handle_connection(
        self: &Arc<Self>,
        user_id: impl Into<UserId>,
        conn: Arc<dyn Connection>,
    ) -> Result<JoinHandle<()>, ManagerError> {
        let user_id = user_id.into();

        let entry = match self.registry.install(&user_id, conn.clone()).await {
            Ok(entry) => entry,
            Err(e) => {
                let _ = conn.close().await;
                return Err(e);
            }
        };

        info!(
            user = %user_id,
            connection = %conn.id(),
            remote = conn.remote_addr().as_deref().unwrap_or("unknown"),
            "Notification connection opened"
        );

        let manager = Arc::clone(self);
        let watcher = tokio::spawn(async move {
            let heartbeat = liveness::spawn_heartbeat(
                conn.clone(),
                manager.config.ping_period,
                manager.config.write_wait,
            );
            liveness::watch_until_closed(
                &conn,
                manager.config.pong_wait,
                manager.config.write_wait,
            )
            .await;
            heartbeat.abort();

            manager.registry.evict(&user_id, &entry).await;
            info!(user = %user_id, connection = %conn.id(), "Notification connection closed");
        });

        Ok(watcher)
    }

    /// Push a notification to `user_id`.
    ///
    /// Succeeds without doing anything if the user is not connected.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Delivery`] if the write fails; the stale
    /// connection is removed and closed first.
    pub async fn broadcast_to_user(
        &self,
        user_id: &str,
        notification: &Notification,
    ) -> Result<(), ManagerError> {
        let Some(entry) = self.registry.get(user_id).await else {
            trace!(
                user = %user_id,
                kind = %notification.kind,
                "User offline, dropping notification"
            );
            return Ok(());
        };

        let frame = codec::encode(notification)?;
        if let Err(source) = entry.send_text(frame, self.config.write_wait).await {
            self.registry.evict(user_id, &entry).await;
            return Err(ManagerError::Delivery {
                user_id: user_id.to_string(),
                source,
            });
        }

        debug!(
            user = %user_id,
            kind = %notification.kind,
            id = %notification.id,
            "Notification delivered"
        );
        Ok(())
    }

    pub async fn is_connected(&self, user_id: &str) -> bool {
        self.registry.contains(user_id).await
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.len().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use spacecast_transport::{FrameKind, MemoryConnection, MemoryPeer};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(1);

    fn manager(max_connections: usize) -> Arc<NotificationManager> {
        Arc::new(NotificationManager::new(ManagerConfig {
            max_connections,
            ..ManagerConfig::default()
        }))
    }

    fn conn() -> (Arc<dyn Connection>, MemoryPeer) {
        let (conn, peer) = MemoryConnection::pair();
        (Arc::new(conn), peer)
    }

    fn notification(user: &str) -> Notification {
        Notification::new("n1", "comment", user, json!({ "post_id": "p1" }))
    }

    async fn wait_until_disconnected(manager: &NotificationManager, user: &str) {
        tokio::time::timeout(WAIT, async {
            while manager.is_connected(user).await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("user still connected");
    }

    #[tokio::test]
    async fn test_broadcast_reaches_connected_user() {
        let manager = manager(10);
        let (c1, mut p1) = conn();
        manager.handle_connection("alice", c1).await.unwrap();

        let sent = notification("alice").with_actor("bob");
        manager.broadcast_to_user("alice", &sent).await.unwrap();

        let frame = p1.recv_data(WAIT).await.unwrap();
        let received: Notification = serde_json::from_slice(&frame.data).unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_offline_user_is_noop() {
        let manager = manager(10);
        manager
            .broadcast_to_user("nobody", &notification("nobody"))
            .await
            .unwrap();
        assert_eq!(manager.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_previous() {
        let manager = manager(10);
        let (c1, mut p1) = conn();
        let (c2, mut p2) = conn();

        manager.handle_connection("alice", c1.clone()).await.unwrap();
        manager.handle_connection("alice", c2).await.unwrap();

        assert!(!c1.is_open());
        assert_eq!(p1.recv_timeout(WAIT).await.unwrap().kind, FrameKind::Close);
        assert_eq!(manager.connection_count().await, 1);

        manager
            .broadcast_to_user("alice", &notification("alice"))
            .await
            .unwrap();
        assert!(p2.recv_data(WAIT).await.is_some());

        // The old watcher must not remove the new connection
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(manager.is_connected("alice").await);
    }

    #[tokio::test]
    async fn test_capacity_rejects_new_users_only() {
        let manager = manager(1);
        let (c1, _p1) = conn();
        let (c2, _p2) = conn();
        let (c3, _p3) = conn();

        manager.handle_connection("alice", c1).await.unwrap();
        assert!(manager.check_capacity("bob").await.is_err());

        let result = manager.handle_connection("bob", c2.clone()).await;
        assert!(matches!(result, Err(ManagerError::AtCapacity { limit: 1 })));
        assert!(!c2.is_open());

        manager.check_capacity("alice").await.unwrap();
        manager.handle_connection("alice", c3).await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_removes_user() {
        let manager = manager(10);
        let (c1, p1) = conn();
        manager.handle_connection("alice", c1).await.unwrap();
        assert!(manager.is_connected("alice").await);

        p1.send_close();
        wait_until_disconnected(&manager, "alice").await;
    }

    #[tokio::test]
    async fn test_failed_write_removes_connection() {
        let manager = manager(10);
        let (c1, p1) = conn();
        manager.handle_connection("alice", c1).await.unwrap();

        drop(p1);
        // The watcher may win the race; either way the user ends up gone
        let result = manager
            .broadcast_to_user("alice", &notification("alice"))
            .await;
        if let Err(e) = result {
            assert!(matches!(e, ManagerError::Delivery { .. }));
        }
        wait_until_disconnected(&manager, "alice").await;
    }

    #[tokio::test]
    async fn test_stalled_client_is_removed_after_write_deadline() {
        let write_wait = Duration::from_millis(50);
        let manager = Arc::new(NotificationManager::new(ManagerConfig {
            write_wait,
            ..ManagerConfig::default()
        }));
        let (c1, p1) = conn();
        manager.handle_connection("alice", c1.clone()).await.unwrap();
        p1.stall();

        let started = tokio::time::Instant::now();
        let result = manager
            .broadcast_to_user("alice", &notification("alice"))
            .await;

        assert!(matches!(
            result,
            Err(ManagerError::Delivery { ref user_id, .. }) if user_id == "alice"
        ));
        assert!(started.elapsed() >= write_wait);
        assert!(!manager.is_connected("alice").await);
        assert!(!c1.is_open());
    }

    #[tokio::test]
    async fn test_business_frames_are_ignored() {
        let manager = manager(10);
        let (c1, mut p1) = conn();
        manager.handle_connection("alice", c1).await.unwrap();

        p1.send_text(r#"{"type":"chat","data":{"content":"hi"}}"#);
        p1.send_text(r#"{"type":"ping"}"#);

        let frame = p1.recv_data(WAIT).await.unwrap();
        assert_eq!(
            codec::decode(&frame.data).unwrap().kind,
            spacecast_protocol::EnvelopeType::Pong
        );
        assert!(manager.is_connected("alice").await);
    }
}
