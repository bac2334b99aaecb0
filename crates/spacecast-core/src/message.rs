//! Chat message types and content validation.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use spacecast_protocol::{now_millis, ChatPayload, SpaceId, UserId};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Default maximum chat content length, in characters.
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 1000;

/// Atomic counter for ensuring unique IDs even within the same millisecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique identifier with the given prefix.
#[must_use]
pub fn generate_id(prefix: &str) -> String {
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}_{:x}{:04x}", prefix, now_millis(), counter & 0xffff)
}

/// Rejected chat content.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Content is empty or only whitespace.
    #[error("Message content cannot be empty")]
    Empty,

    /// Content exceeds the configured maximum.
    #[error("Message content is {length} characters, maximum is {max}")]
    TooLong { length: usize, max: usize },
}

/// Validate chat content against the configured maximum length.
///
/// # Errors
///
/// Returns an error if the content is blank or longer than `max` characters.
pub fn validate_content(content: &str, max: usize) -> Result<(), ValidationError> {
    if content.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    let length = content.chars().count();
    if length > max {
        return Err(ValidationError::TooLong { length, max });
    }
    Ok(())
}

/// A chat message as persisted and broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub content: String,
    pub user_id: UserId,
    pub username: String,
    pub space_id: SpaceId,
    /// Unix milliseconds.
    pub timestamp: u64,
}

impl ChatMessage {
    /// Create a new message with a fresh id and timestamp.
    #[must_use]
    pub fn new(
        content: impl Into<String>,
        user_id: impl Into<UserId>,
        username: impl Into<String>,
        space_id: impl Into<SpaceId>,
    ) -> Self {
        Self {
            id: generate_id("msg"),
            content: content.into(),
            user_id: user_id.into(),
            username: username.into(),
            space_id: space_id.into(),
            timestamp: now_millis(),
        }
    }
}

impl From<&ChatMessage> for ChatPayload {
    fn from(message: &ChatMessage) -> Self {
        ChatPayload {
            id: message.id.clone(),
            content: message.content.clone(),
            user_id: message.user_id.clone(),
            username: message.username.clone(),
            space_id: message.space_id.clone(),
            timestamp: message.timestamp,
        }
    }
}

/// An encoded frame addressed to every session in one space.
#[derive(Debug, Clone)]
pub struct SpaceMessage {
    pub space_id: SpaceId,
    pub payload: Bytes,
}

impl SpaceMessage {
    #[must_use]
    pub fn new(space_id: impl Into<SpaceId>, payload: Bytes) -> Self {
        Self {
            space_id: space_id.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_content() {
        assert!(validate_content("hi", DEFAULT_MAX_CONTENT_LENGTH).is_ok());
        assert_eq!(
            validate_content("", DEFAULT_MAX_CONTENT_LENGTH),
            Err(ValidationError::Empty)
        );
        assert_eq!(validate_content("  \n\t", 10), Err(ValidationError::Empty));
    }

    #[test]
    fn test_validate_content_length_is_in_characters() {
        let at_limit = "é".repeat(DEFAULT_MAX_CONTENT_LENGTH);
        assert!(validate_content(&at_limit, DEFAULT_MAX_CONTENT_LENGTH).is_ok());

        let over = "a".repeat(DEFAULT_MAX_CONTENT_LENGTH + 1);
        assert_eq!(
            validate_content(&over, DEFAULT_MAX_CONTENT_LENGTH),
            Err(ValidationError::TooLong {
                length: DEFAULT_MAX_CONTENT_LENGTH + 1,
                max: DEFAULT_MAX_CONTENT_LENGTH
            })
        );
    }

    #[test]
    fn test_unique_ids() {
        let a = generate_id("msg");
        let b = generate_id("msg");
        assert_ne!(a, b);
        assert!(a.starts_with("msg_"));
    }

    #[test]
    fn test_message_payload() {
        let message = ChatMessage::new("hi", "7", "alice", "42");
        let payload = ChatPayload::from(&message);
        assert_eq!(payload.id, message.id);
        assert_eq!(payload.space_id, "42");
        assert_eq!(payload.content, "hi");
    }
}
