//! Online/offline presence.
//!
//! A presence connection receives its own status, then one status per
//! already-connected peer, and from then on every peer transition. Fan-out
//! is best-effort: a peer whose write fails is pruned, and its own offline
//! transition is queued behind the current one.

use spacecast_protocol::{codec, StatusMessage, UserId};
use spacecast_transport::Connection;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::liveness;
use crate::registry::{ManagerConfig, ManagerError, UserEntry, UserRegistry};

/// Tracks who is online and broadcasts transitions.
#[derive(Debug)]
pub struct PresenceManager {
    registry: UserRegistry,
    config: ManagerConfig,
}

impl PresenceManager {
    #[must_use]
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            registry: UserRegistry::new(config.max_connections, config.write_wait),
            config,
        }
    }

    /// Check whether `user_id` could connect right now.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::AtCapacity`] at the ceiling.
    pub async fn check_capacity(&self, user_id: &str) -> Result<(), ManagerError> {
        self.registry.check_capacity(user_id).await
    }

    /// Take ownership of a user's presence connection.
    ///
    /// Sends the user's own status and a snapshot of online peers, then
    /// announces the user to everyone else in the background. The returned
    /// task finishes once the connection is gone and its offline status has
    /// been sent.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::AtCapacity`] at the ceiling, or
    /// [`ManagerError::Delivery`] if the initial statuses cannot be written.
    /// `conn` is closed in both cases.
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

        if let Err(e) = self.send_initial_statuses(&user_id, &entry).await {
            self.registry.evict(&user_id, &entry).await;
            return Err(e);
        }

        info!(
            user = %user_id,
            connection = %conn.id(),
            remote = conn.remote_addr().as_deref().unwrap_or("unknown"),
            "User online"
        );

        let manager = Arc::clone(self);
        let online = StatusMessage::online(user_id.clone());
        tokio::spawn(async move { manager.fan_out(online).await });

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

            // A replaced connection goes quietly, its successor is online
            if manager.registry.evict(&user_id, &entry).await {
                info!(user = %user_id, connection = %conn.id(), "User offline");
                manager.fan_out(StatusMessage::offline(user_id)).await;
            }
        });

        Ok(watcher)
    }

    async fn send_initial_statuses(
        &self,
        user_id: &str,
        entry: &UserEntry,
    ) -> Result<(), ManagerError> {
        let delivery_error = |source| ManagerError::Delivery {
            user_id: user_id.to_string(),
            source,
        };

        let own = codec::encode(&StatusMessage::online(user_id))?;
        entry
            .send_text(own, self.config.write_wait)
            .await
            .map_err(delivery_error)?;

        for (peer_id, peer) in self.registry.snapshot().await {
            if peer_id == user_id || !peer.is_online() {
                continue;
            }
            let status = codec::encode(&StatusMessage::online(peer_id))?;
            entry
                .send_text(status, self.config.write_wait)
                .await
                .map_err(delivery_error)?;
        }

        Ok(())
    }

    /// Send `initial` to every other online user.
    ///
    /// Peers that fail are pruned and their offline status is sent in turn.
    async fn fan_out(&self, initial: StatusMessage) {
        let mut pending = VecDeque::from([initial]);

        while let Some(status) = pending.pop_front() {
            let frame = match codec::encode(&status) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(user = %status.user_id, error = %e, "Failed to encode status");
                    continue;
                }
            };

            let mut delivered = 0usize;
            for (peer_id, peer) in self.registry.snapshot().await {
                if peer_id == status.user_id || !peer.is_online() {
                    continue;
                }

                match peer.send_text(frame.clone(), self.config.write_wait).await {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        debug!(user = %peer_id, error = %e, "Pruning unreachable peer");
                        if self.registry.evict(&peer_id, &peer).await {
                            pending.push_back(StatusMessage::offline(peer_id));
                        }
                    }
                }
            }

            debug!(
                user = %status.user_id,
                status = ?status.status,
                recipients = delivered,
                "Presence fan-out"
            );
        }
    }

    /// Whether `user_id` currently has a live presence connection.
    pub async fn is_online(&self, user_id: &str) -> bool {
        self.registry
            .get(user_id)
            .await
            .is_some_and(|entry| entry.is_online())
    }

    /// Ids of all online users, sorted.
    pub async fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .filter(|(_, entry)| entry.is_online())
            .map(|(user_id, _)| user_id)
            .collect();
        users.sort();
        users
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.len().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spacecast_protocol::PresenceStatus;
    use spacecast_transport::{MemoryConnection, MemoryPeer};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(1);
    const QUIET: Duration = Duration::from_millis(100);

    fn manager() -> Arc<PresenceManager> {
        Arc::new(PresenceManager::new(ManagerConfig::default()))
    }

    fn conn() -> (Arc<dyn Connection>, MemoryPeer) {
        let (conn, peer) = MemoryConnection::pair();
        (Arc::new(conn), peer)
    }

    async fn next_status(peer: &mut MemoryPeer, wait: Duration) -> Option<StatusMessage> {
        let frame = peer.recv_data(wait).await?;
        serde_json::from_slice(&frame.data).ok()
    }

    async fn expect_status(peer: &mut MemoryPeer, user: &str, status: PresenceStatus) {
        let message = next_status(peer, WAIT).await.expect("no status");
        assert_eq!(message.kind, StatusMessage::KIND);
        assert_eq!(message.user_id, user);
        assert_eq!(message.status, status);
    }

    async fn wait_until_offline(manager: &PresenceManager, user: &str) {
        tokio::time::timeout(WAIT, async {
            while manager.is_online(user).await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("user still online");
    }

    #[tokio::test]
    async fn test_connect_sends_self_then_peers() {
        let manager = manager();
        let (c1, mut p1) = conn();
        manager.handle_connection("alice", c1).await.unwrap();
        expect_status(&mut p1, "alice", PresenceStatus::Online).await;
        // Let alice's own announcement finish before bob arrives
        tokio::time::sleep(QUIET).await;

        let (c2, mut p2) = conn();
        manager.handle_connection("bob", c2).await.unwrap();
        expect_status(&mut p2, "bob", PresenceStatus::Online).await;
        expect_status(&mut p2, "alice", PresenceStatus::Online).await;

        // alice hears about bob, bob does not hear about himself again
        expect_status(&mut p1, "bob", PresenceStatus::Online).await;
        assert!(next_status(&mut p2, QUIET).await.is_none());

        assert_eq!(manager.online_users().await, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_disconnect_announces_offline() {
        let manager = manager();
        let (c1, mut p1) = conn();
        let (c2, mut p2) = conn();
        manager.handle_connection("alice", c1).await.unwrap();
        manager.handle_connection("bob", c2).await.unwrap();
        expect_status(&mut p1, "alice", PresenceStatus::Online).await;
        expect_status(&mut p1, "bob", PresenceStatus::Online).await;
        expect_status(&mut p2, "bob", PresenceStatus::Online).await;
        expect_status(&mut p2, "alice", PresenceStatus::Online).await;

        p2.send_close();
        expect_status(&mut p1, "bob", PresenceStatus::Offline).await;
        wait_until_offline(&manager, "bob").await;
        assert_eq!(manager.online_users().await, vec!["alice"]);
    }

    #[tokio::test]
    async fn test_reconnect_is_not_an_offline_transition() {
        let manager = manager();
        let (c1, mut p1) = conn();
        let (c2, _p2) = conn();
        let (c3, mut p3) = conn();
        manager.handle_connection("alice", c1).await.unwrap();
        manager.handle_connection("bob", c2).await.unwrap();
        expect_status(&mut p1, "alice", PresenceStatus::Online).await;
        expect_status(&mut p1, "bob", PresenceStatus::Online).await;

        manager.handle_connection("bob", c3).await.unwrap();
        expect_status(&mut p3, "bob", PresenceStatus::Online).await;
        expect_status(&mut p3, "alice", PresenceStatus::Online).await;

        expect_status(&mut p1, "bob", PresenceStatus::Online).await;
        assert!(next_status(&mut p1, QUIET).await.is_none());
        assert!(manager.is_online("bob").await);
        assert_eq!(manager.connection_count().await, 2);
    }

    #[tokio::test]
    async fn test_failed_peer_is_pruned_without_failing_connect() {
        let manager = manager();
        let (c1, mut p1) = conn();
        let (c2, p2) = conn();
        manager.handle_connection("alice", c1).await.unwrap();
        manager.handle_connection("bob", c2).await.unwrap();
        expect_status(&mut p1, "alice", PresenceStatus::Online).await;
        expect_status(&mut p1, "bob", PresenceStatus::Online).await;

        // bob vanishes; whoever notices first prunes him
        drop(p2);
        let (c3, mut p3) = conn();
        manager.handle_connection("carol", c3).await.unwrap();
        expect_status(&mut p3, "carol", PresenceStatus::Online).await;

        wait_until_offline(&manager, "bob").await;

        let mut seen = Vec::new();
        while let Some(status) = next_status(&mut p1, QUIET).await {
            seen.push((status.user_id, status.status));
        }
        assert!(seen.contains(&("carol".to_string(), PresenceStatus::Online)));
        assert!(seen.contains(&("bob".to_string(), PresenceStatus::Offline)));
        assert!(manager.is_online("carol").await);
    }

    #[tokio::test]
    async fn test_stalled_peer_is_pruned_after_write_deadline() {
        let manager = Arc::new(PresenceManager::new(ManagerConfig {
            write_wait: Duration::from_millis(50),
            ..ManagerConfig::default()
        }));
        let (c1, mut p1) = conn();
        let (c2, p2) = conn();
        manager.handle_connection("alice", c1).await.unwrap();
        manager.handle_connection("bob", c2.clone()).await.unwrap();
        expect_status(&mut p1, "alice", PresenceStatus::Online).await;
        expect_status(&mut p1, "bob", PresenceStatus::Online).await;
        tokio::time::sleep(QUIET).await;

        // bob stops reading; announcing carol to him misses the deadline
        p2.stall();
        let (c3, mut p3) = conn();
        manager.handle_connection("carol", c3).await.unwrap();

        wait_until_offline(&manager, "bob").await;
        assert!(!c2.is_open());
        expect_status(&mut p1, "carol", PresenceStatus::Online).await;
        expect_status(&mut p1, "bob", PresenceStatus::Offline).await;

        let mut seen_by_carol = Vec::new();
        while let Some(status) = next_status(&mut p3, QUIET).await {
            seen_by_carol.push((status.user_id, status.status));
        }
        assert!(seen_by_carol.contains(&("bob".to_string(), PresenceStatus::Offline)));
        assert_eq!(manager.online_users().await, vec!["alice", "carol"]);
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let manager = Arc::new(PresenceManager::new(ManagerConfig {
            max_connections: 1,
            ..ManagerConfig::default()
        }));
        let (c1, _p1) = conn();
        let (c2, _p2) = conn();

        manager.handle_connection("alice", c1).await.unwrap();
        assert!(matches!(
            manager.handle_connection("bob", c2.clone()).await,
            Err(ManagerError::AtCapacity { .. })
        ));
        assert!(!c2.is_open());
        assert!(!manager.is_online("bob").await);
    }

    #[tokio::test]
    async fn test_unwritable_connection_is_rejected() {
        let manager = manager();
        let (c1, p1) = conn();
        drop(p1);

        let result = manager.handle_connection("alice", c1.clone()).await;
        assert!(matches!(result, Err(ManagerError::Delivery { .. })));
        assert!(!c1.is_open());
        assert!(!manager.is_online("alice").await);
    }
}
