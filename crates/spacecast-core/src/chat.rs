//! Chat posting: validate, persist, then broadcast to the space.

use spacecast_protocol::{codec, ChatPayload, Envelope};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::hub::{HubError, HubHandle};
use crate::message::{validate_content, ChatMessage, ValidationError};
use crate::store::{ChatStore, StoreError};

/// Counter of chat posts from every entry point, labelled by `outcome`.
pub const CHAT_POSTS_METRIC: &str = "spacecast_chat_posts_total";

/// Errors from posting a chat message.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Content was rejected; nothing was stored or sent.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The store failed; the message was not broadcast.
    #[error("Failed to persist message: {0}")]
    Persistence(#[from] StoreError),

    /// The message was stored but could not be handed to the hub.
    #[error(transparent)]
    Hub(#[from] HubError),
}

impl ChatError {
    /// Metric label for a post that failed this way.
    #[must_use]
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid",
            Self::Persistence(_) => "persistence_failed",
            Self::Hub(_) => "hub_unavailable",
        }
    }
}

/// Posts chat messages on behalf of space sessions and the REST endpoint.
#[derive(Clone)]
pub struct ChatService {
    hub: HubHandle,
    store: Arc<dyn ChatStore>,
    max_content_length: usize,
}

impl ChatService {
    #[must_use]
    pub fn new(hub: HubHandle, store: Arc<dyn ChatStore>, max_content_length: usize) -> Self {
        Self {
            hub,
            store,
            max_content_length,
        }
    }

    /// The hub this service broadcasts through.
    #[must_use]
    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Validate, persist and broadcast a chat message.
    ///
    /// Every call is counted under [`CHAT_POSTS_METRIC`].
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Validation`] for blank or over-long content and
    /// [`ChatError::Persistence`] if the store fails. In both cases nothing
    /// is broadcast.
    pub async fn post(
        &self,
        user_id: &str,
        username: &str,
        space_id: &str,
        content: &str,
    ) -> Result<ChatMessage, ChatError> {
        let result = self.publish(user_id, username, space_id, content).await;
        let outcome = result.as_ref().map_or_else(ChatError::outcome, |_| "created");
        metrics::counter!(CHAT_POSTS_METRIC, "outcome" => outcome).increment(1);
        result
    }

    async fn publish(
        &self,
        user_id: &str,
        username: &str,
        space_id: &str,
        content: &str,
    ) -> Result<ChatMessage, ChatError> {
        validate_content(content, self.max_content_length)?;

        let message = ChatMessage::new(content, user_id, username, space_id);

        if let Err(e) = self.store.save_chat_message(&message).await {
            warn!(space = %space_id, user = %user_id, error = %e, "Chat persistence failed");
            return Err(e.into());
        }

        let frame = codec::encode(&Envelope::chat(&ChatPayload::from(&message)))
            .map_err(HubError::from)?;
        self.hub.space_broadcast(space_id, frame).await?;

        debug!(space = %space_id, user = %user_id, id = %message.id, "Chat posted");
        Ok(message)
    }
}
