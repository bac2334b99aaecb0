//! Space broadcast routing.
//!
//! The router is the hub's registry: it owns every registered
//! [`ClientSession`] and knows which sessions belong to which space. It is
//! only ever touched from inside the hub loop, so it needs no locking.

use bytes::Bytes;
use spacecast_protocol::SpaceId;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace, warn};

use crate::session::{ClientSession, SessionId};

/// Outcome of one fan-out.
#[derive(Debug, Default)]
pub struct Delivery {
    /// Number of queues that accepted the frame.
    pub delivered: usize,
    /// Sessions removed because their queue was full or closed. Their
    /// queues close once these are dropped; the hub announces each one to
    /// its space as a `leave`.
    pub evicted: Vec<ClientSession>,
}

/// Registry of sessions indexed by space.
#[derive(Debug, Default)]
pub struct SpaceRouter {
    /// Sessions by id.
    sessions: HashMap<SessionId, ClientSession>,
    /// Space -> member session ids.
    spaces: HashMap<SpaceId, HashSet<SessionId>>,
}

impl SpaceRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session.
    ///
    /// Returns `false` (and drops `session`) if its id is already registered.
    pub fn insert(&mut self, session: ClientSession) -> bool {
        if self.sessions.contains_key(&session.id) {
            warn!(session = %session.id, "Session already registered");
            return false;
        }

        self.spaces
            .entry(session.space_id.clone())
            .or_default()
            .insert(session.id.clone());

        debug!(
            session = %session.id,
            user = %session.user_id,
            space = %session.space_id,
            "Session registered"
        );
        self.sessions.insert(session.id.clone(), session);
        true
    }

    /// Remove a session, returning it if it was registered.
    ///
    /// Dropping the returned session closes its outbound queue.
    pub fn remove(&mut self, id: &SessionId) -> Option<ClientSession> {
        let session = self.sessions.remove(id)?;

        if let Some(members) = self.spaces.get_mut(&session.space_id) {
            members.remove(id);
            if members.is_empty() {
                self.spaces.remove(&session.space_id);
                trace!(space = %session.space_id, "Space emptied");
            }
        }

        debug!(session = %id, space = %session.space_id, "Session removed");
        Some(session)
    }

    /// Check if a session is registered.
    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of spaces with at least one session.
    #[must_use]
    pub fn space_count(&self) -> usize {
        self.spaces.len()
    }

    /// Number of sessions in a space.
    #[must_use]
    pub fn space_size(&self, space_id: &str) -> usize {
        self.spaces.get(space_id).map_or(0, HashSet::len)
    }

    /// Enqueue a frame to every session in `space_id`.
    pub fn deliver_to_space(&mut self, space_id: &str, frame: &Bytes) -> Delivery {
        let targets: Vec<SessionId> = match self.spaces.get(space_id) {
            Some(members) => members.iter().cloned().collect(),
            None => {
                trace!(space = %space_id, "Broadcast to empty space");
                return Delivery::default();
            }
        };
        self.deliver(targets, frame)
    }

    /// Enqueue a frame to every registered session.
    pub fn deliver_all(&mut self, frame: &Bytes) -> Delivery {
        let targets: Vec<SessionId> = self.sessions.keys().cloned().collect();
        self.deliver(targets, frame)
    }

    fn deliver(&mut self, targets: Vec<SessionId>, frame: &Bytes) -> Delivery {
        let mut delivery = Delivery::default();
        let mut unresponsive = Vec::new();

        for id in targets {
            let Some(session) = self.sessions.get(&id) else {
                continue;
            };
            match session.try_enqueue(frame.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(reason) => {
                    warn!(
                        session = %id,
                        user = %session.user_id,
                        space = %session.space_id,
                        reason = %reason,
                        "Evicting unresponsive session"
                    );
                    unresponsive.push(id);
                }
            }
        }

        for id in unresponsive {
            if let Some(session) = self.remove(&id) {
                delivery.evicted.push(session);
            }
        }

        delivery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spacecast_transport::ConnectionId;

    fn session(space: &str, capacity: usize) -> (ClientSession, tokio::sync::mpsc::Receiver<Bytes>) {
        ClientSession::new(ConnectionId::generate(), "u", "user", space, capacity)
    }

    #[test]
    fn test_router_insert_remove() {
        let mut router = SpaceRouter::new();
        let (s1, _rx1) = session("42", 4);
        let id = s1.id.clone();

        assert!(router.insert(s1));
        assert!(router.contains(&id));
        assert_eq!(router.space_size("42"), 1);

        assert!(router.remove(&id).is_some());
        assert!(router.remove(&id).is_none());
        // Empty space is dropped
        assert_eq!(router.space_count(), 0);
    }

    #[test]
    fn test_router_duplicate_id() {
        let mut router = SpaceRouter::new();
        let (s1, _rx1) = session("42", 4);
        let (mut s2, _rx2) = session("7", 4);
        s2.id = s1.id.clone();

        assert!(router.insert(s1));
        assert!(!router.insert(s2));
        assert_eq!(router.len(), 1);
        assert_eq!(router.space_size("7"), 0);
    }

    #[test]
    fn test_deliver_to_space() {
        let mut router = SpaceRouter::new();
        let (s1, mut rx1) = session("42", 4);
        let (s2, mut rx2) = session("42", 4);
        let (s3, mut rx3) = session("7", 4);
        router.insert(s1);
        router.insert(s2);
        router.insert(s3);

        let delivery = router.deliver_to_space("42", &Bytes::from_static(b"hi"));
        assert_eq!(delivery.delivered, 2);
        assert!(delivery.evicted.is_empty());

        assert_eq!(rx1.try_recv().unwrap(), Bytes::from_static(b"hi"));
        assert_eq!(rx2.try_recv().unwrap(), Bytes::from_static(b"hi"));
        assert!(rx3.try_recv().is_err());
    }

    #[test]
    fn test_deliver_all() {
        let mut router = SpaceRouter::new();
        let (s1, mut rx1) = session("42", 4);
        let (s2, mut rx2) = session("7", 4);
        router.insert(s1);
        router.insert(s2);

        assert_eq!(router.deliver_all(&Bytes::from_static(b"x")).delivered, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_full_queue_is_evicted() {
        let mut router = SpaceRouter::new();
        let (slow, mut slow_rx) = session("42", 1);
        let (fast, mut fast_rx) = session("42", 8);
        let slow_id = slow.id.clone();
        router.insert(slow);
        router.insert(fast);

        let frame = Bytes::from_static(b"x");
        assert_eq!(router.deliver_to_space("42", &frame).delivered, 2);

        let delivery = router.deliver_to_space("42", &frame);
        assert_eq!(delivery.delivered, 1);
        assert_eq!(delivery.evicted.len(), 1);
        assert!(!router.contains(&slow_id));
        drop(delivery);

        // The evicted queue drains what it had, then reports closed
        assert!(slow_rx.try_recv().is_ok());
        assert_eq!(
            slow_rx.try_recv(),
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
        );
        assert_eq!(fast_rx.len(), 2);
    }
}
