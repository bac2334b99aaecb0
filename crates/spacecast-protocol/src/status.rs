//! Messages pushed over the global (non-space) connections.

use serde::{Deserialize, Serialize};

use crate::envelope::{now_millis, UserId};

/// Online state of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// A presence transition for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    /// Always `"status"`.
    #[serde(rename = "type")]
    pub kind: String,
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub timestamp: u64,
}

impl StatusMessage {
    pub const KIND: &'static str = "status";

    /// Create a status message stamped with the current time.
    #[must_use]
    pub fn new(user_id: impl Into<UserId>, status: PresenceStatus) -> Self {
        Self {
            kind: Self::KIND.to_string(),
            user_id: user_id.into(),
            status,
            timestamp: now_millis(),
        }
    }

    #[must_use]
    pub fn online(user_id: impl Into<UserId>) -> Self {
        Self::new(user_id, PresenceStatus::Online)
    }

    #[must_use]
    pub fn offline(user_id: impl Into<UserId>) -> Self {
        Self::new(user_id, PresenceStatus::Offline)
    }
}

/// An out-of-band notification for a single user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Unique notification id.
    pub id: String,
    /// Notification kind, e.g. `comment_created`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Recipient.
    pub user_id: UserId,
    /// User whose action produced the notification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<UserId>,
    /// Kind-specific details.
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: u64,
}

impl Notification {
    /// Create a notification stamped with the current time.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        user_id: impl Into<UserId>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            user_id: user_id.into(),
            actor_id: None,
            data,
            timestamp: now_millis(),
        }
    }

    #[must_use]
    pub fn with_actor(mut self, actor_id: impl Into<UserId>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_wire_format() {
        let value = serde_json::to_value(StatusMessage::online("9")).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["user_id"], "9");
        assert_eq!(value["status"], "online");
    }

    #[test]
    fn test_notification_actor_is_optional() {
        let n = Notification::new("n1", "comment_created", "3", json!({"post_id": "p1"}));
        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(value["type"], "comment_created");
        assert!(value.get("actor_id").is_none());

        let n = n.with_actor("5");
        assert_eq!(n.actor_id.as_deref(), Some("5"));
    }
}
