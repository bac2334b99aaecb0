//! Chat persistence interface.
//!
//! The hub never stores anything itself; chat messages are handed to a
//! [`ChatStore`] before they are broadcast.

use async_trait::async_trait;
use dashmap::DashMap;
use spacecast_protocol::SpaceId;
use thiserror::Error;
use tracing::trace;

use crate::message::ChatMessage;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence for chat messages.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Persist a message. Called before the message is broadcast.
    async fn save_chat_message(&self, message: &ChatMessage) -> Result<(), StoreError>;
}

/// A chat store that keeps messages in memory, grouped by space.
#[derive(Debug, Default)]
pub struct MemoryChatStore {
    messages: DashMap<SpaceId, Vec<ChatMessage>>,
}

impl MemoryChatStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages stored for a space, oldest first.
    #[must_use]
    pub fn messages(&self, space_id: &str) -> Vec<ChatMessage> {
        self.messages
            .get(space_id)
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Total number of stored messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.iter().map(|m| m.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn save_chat_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        trace!(space = %message.space_id, id = %message.id, "Storing chat message");
        self.messages
            .entry(message.space_id.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }
}
