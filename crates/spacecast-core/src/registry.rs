//! Single-connection-per-user registry shared by the notification and
//! presence managers.
//!
//! Each user has at most one live connection per manager. Installing a new
//! connection swaps it in and marks the previous one offline in a single
//! step, so readers never observe two connections for the same user. The
//! previous connection is closed after the lock is released.

use bytes::Bytes;
use spacecast_protocol::{ProtocolError, UserId};
use spacecast_transport::{Connection, ConnectionError, ConnectionId, FrameKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default per-manager connection ceiling.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Configuration shared by the user-scoped managers.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Maximum number of connected users.
    pub max_connections: usize,
    /// Deadline for each write.
    pub write_wait: Duration,
    /// Read deadline window, extended by every liveness reply.
    pub pong_wait: Duration,
    /// Interval between liveness probes.
    pub ping_period: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            write_wait: Duration::from_secs(10),
            pong_wait,
            ping_period: pong_wait * 9 / 10,
        }
    }
}

/// Errors from the user-scoped managers.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The connection ceiling has been reached.
    #[error("Connection limit reached ({limit})")]
    AtCapacity { limit: usize },

    /// A write to the user's connection failed; the connection was removed.
    #[error("Failed to deliver to user {user_id}: {source}")]
    Delivery {
        user_id: UserId,
        #[source]
        source: ConnectionError,
    },

    /// A frame could not be encoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// A user's installed connection.
pub struct UserEntry {
    conn: Arc<dyn Connection>,
    online: AtomicBool,
}

impl UserEntry {
    fn new(conn: Arc<dyn Connection>) -> Self {
        Self {
            conn,
            online: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        self.conn.id()
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    /// Write a text frame with a bounded deadline.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or misses the deadline.
    pub async fn send_text(
        &self,
        frame: Bytes,
        write_wait: Duration,
    ) -> Result<(), ConnectionError> {
        self.conn.set_write_deadline(Some(Instant::now() + write_wait));
        self.conn.write_frame(FrameKind::Text, frame).await
    }

    /// Close the connection, giving a blocked writer at most `write_wait`.
    pub async fn close(&self, write_wait: Duration) {
        self.conn.set_write_deadline(Some(Instant::now() + write_wait));
        if let Err(e) = self.conn.close().await {
            debug!(connection = %self.conn.id(), error = %e, "Close failed");
        }
    }
}

impl std::fmt::Debug for UserEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserEntry")
            .field("connection", self.conn.id())
            .field("online", &self.is_online())
            .finish()
    }
}

/// User id to connection map with a capacity ceiling.
#[derive(Debug)]
pub struct UserRegistry {
    users: RwLock<HashMap<UserId, Arc<UserEntry>>>,
    max_connections: usize,
    write_wait: Duration,
}

impl UserRegistry {
    #[must_use]
    pub fn new(max_connections: usize, write_wait: Duration) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            max_connections,
            write_wait,
        }
    }

    /// Check whether `user_id` could connect right now.
    ///
    /// A user who is already connected can always reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::AtCapacity`] at the ceiling.
    pub async fn check_capacity(&self, user_id: &str) -> Result<(), ManagerError> {
        let users = self.users.read().await;
        self.ensure_room(&users, user_id)
    }

    fn ensure_room(
        &self,
        users: &HashMap<UserId, Arc<UserEntry>>,
        user_id: &str,
    ) -> Result<(), ManagerError> {
        if !users.contains_key(user_id) && users.len() >= self.max_connections {
            return Err(ManagerError::AtCapacity {
                limit: self.max_connections,
            });
        }
        Ok(())
    }

    /// Install `conn` as the user's connection.
    ///
    /// Any previous connection for the user is replaced and closed before
    /// this returns. The close runs outside the lock, so a slow peer only
    /// delays its own reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::AtCapacity`] at the ceiling. The new
    /// connection is left untouched.
    pub async fn install(
        &self,
        user_id: &str,
        conn: Arc<dyn Connection>,
    ) -> Result<Arc<UserEntry>, ManagerError> {
        let entry = Arc::new(UserEntry::new(conn));

        let previous = {
            let mut users = self.users.write().await;
            self.ensure_room(&users, user_id)?;

            let previous = users.insert(user_id.to_string(), entry.clone());
            if let Some(previous) = &previous {
                previous.set_online(false);
                info!(
                    user = %user_id,
                    old = %previous.connection_id(),
                    new = %entry.connection_id(),
                    "Replacing connection"
                );
            }
            debug!(
                user = %user_id,
                connection = %entry.connection_id(),
                total = users.len(),
                "Connection installed"
            );
            previous
        };

        if let Some(previous) = previous {
            previous.close(self.write_wait).await;
        }
        Ok(entry)
    }

    /// Remove the user's entry if it still holds `connection_id`.
    ///
    /// Returns the removed entry. A stale id (the user has since
    /// reconnected) leaves the registry unchanged.
    pub async fn remove_if_current(
        &self,
        user_id: &str,
        connection_id: &ConnectionId,
    ) -> Option<Arc<UserEntry>> {
        let mut users = self.users.write().await;
        let current = users.get(user_id)?;
        if current.connection_id() != connection_id {
            return None;
        }

        let entry = users.remove(user_id)?;
        entry.set_online(false);
        debug!(
            user = %user_id,
            connection = %connection_id,
            total = users.len(),
            "Connection removed"
        );
        Some(entry)
    }

    pub async fn get(&self, user_id: &str) -> Option<Arc<UserEntry>> {
        self.users.read().await.get(user_id).cloned()
    }

    /// All installed entries at this moment.
    pub async fn snapshot(&self) -> Vec<(UserId, Arc<UserEntry>)> {
        self.users
            .read()
            .await
            .iter()
            .map(|(user_id, entry)| (user_id.clone(), entry.clone()))
            .collect()
    }

    pub async fn contains(&self, user_id: &str) -> bool {
        self.users.read().await.contains_key(user_id)
    }

    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.users.read().await.is_empty()
    }

    /// Remove and close the entry if it is still current.
    ///
    /// Returns `true` if this call removed it.
    pub async fn evict(&self, user_id: &str, entry: &UserEntry) -> bool {
        let removed = self
            .remove_if_current(user_id, entry.connection_id())
            .await
            .is_some();
        if removed {
            warn!(
                user = %user_id,
                connection = %entry.connection_id(),
                "Evicting stale connection"
            );
        }
        entry.close(self.write_wait).await;
        removed
    }
}
