//! Envelope types for the spacecast protocol.
//!
//! An envelope is the unit exchanged over a space connection. Its `data`
//! field carries a type-specific payload encoded as JSON.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a platform user, as supplied by the upgrade layer.
pub type UserId = String;

/// Identifier of a space (chat room).
pub type SpaceId = String;

/// Current time as unix milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Envelope type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeType {
    Chat,
    Join,
    Leave,
    Ping,
    Pong,
    Error,
}

impl EnvelopeType {
    /// Wire name of the type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeType::Chat => "chat",
            EnvelopeType::Join => "join",
            EnvelopeType::Leave => "leave",
            EnvelopeType::Ping => "ping",
            EnvelopeType::Pong => "pong",
            EnvelopeType::Error => "error",
        }
    }
}

impl FromStr for EnvelopeType {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(EnvelopeType::Chat),
            "join" => Ok(EnvelopeType::Join),
            "leave" => Ok(EnvelopeType::Leave),
            "ping" => Ok(EnvelopeType::Ping),
            "pong" => Ok(EnvelopeType::Pong),
            "error" => Ok(EnvelopeType::Error),
            _ => Err("Invalid envelope type"),
        }
    }
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error codes carried in `error` envelopes.
pub mod error_code {
    pub const INVALID_MESSAGE: &str = "invalid_message";
    pub const UNKNOWN_TYPE: &str = "unknown_type";
    pub const UNSUPPORTED_TYPE: &str = "unsupported_type";
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const PERSISTENCE_FAILED: &str = "persistence_failed";
}

/// A protocol envelope.
///
/// Every field except `type` may be omitted by clients; the server always
/// fills them in on the way out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Envelope type.
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    /// Type-specific payload.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Unix milliseconds when the envelope was created.
    #[serde(default)]
    pub timestamp: u64,
    /// Originating user.
    #[serde(default)]
    pub user_id: UserId,
    /// Space the envelope belongs to.
    #[serde(default)]
    pub space_id: SpaceId,
}

/// Payload of a `chat` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub id: String,
    pub content: String,
    pub user_id: UserId,
    pub username: String,
    pub space_id: SpaceId,
    pub timestamp: u64,
}

/// The part of a `chat` payload a client is expected to send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatInput {
    #[serde(default)]
    pub content: String,
}

/// Payload of an `error` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Payload of `join` and `leave` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipPayload {
    pub user_id: UserId,
    pub username: String,
}

impl Envelope {
    /// Create an envelope stamped with the current time.
    #[must_use]
    pub fn new(
        kind: EnvelopeType,
        data: serde_json::Value,
        user_id: impl Into<UserId>,
        space_id: impl Into<SpaceId>,
    ) -> Self {
        Self {
            kind,
            data,
            timestamp: now_millis(),
            user_id: user_id.into(),
            space_id: space_id.into(),
        }
    }

    /// Create a `chat` envelope from a stored message payload.
    #[must_use]
    pub fn chat(payload: &ChatPayload) -> Self {
        Self {
            kind: EnvelopeType::Chat,
            data: serde_json::to_value(payload).unwrap_or_default(),
            timestamp: payload.timestamp,
            user_id: payload.user_id.clone(),
            space_id: payload.space_id.clone(),
        }
    }

    /// Create a `join` envelope.
    #[must_use]
    pub fn join(
        user_id: impl Into<UserId>,
        username: impl Into<String>,
        space_id: impl Into<SpaceId>,
    ) -> Self {
        Self::membership(EnvelopeType::Join, user_id.into(), username.into(), space_id)
    }

    /// Create a `leave` envelope.
    #[must_use]
    pub fn leave(
        user_id: impl Into<UserId>,
        username: impl Into<String>,
        space_id: impl Into<SpaceId>,
    ) -> Self {
        Self::membership(EnvelopeType::Leave, user_id.into(), username.into(), space_id)
    }

    fn membership(
        kind: EnvelopeType,
        user_id: UserId,
        username: String,
        space_id: impl Into<SpaceId>,
    ) -> Self {
        let payload = MembershipPayload {
            user_id: user_id.clone(),
            username,
        };
        let data = serde_json::to_value(&payload).unwrap_or_default();
        Self::new(kind, data, user_id, space_id)
    }

    /// Create a `ping` envelope.
    #[must_use]
    pub fn ping() -> Self {
        Self::new(EnvelopeType::Ping, serde_json::Value::Null, "", "")
    }

    /// Create a `pong` envelope addressed to a session.
    #[must_use]
    pub fn pong(user_id: impl Into<UserId>, space_id: impl Into<SpaceId>) -> Self {
        Self::new(EnvelopeType::Pong, serde_json::Value::Null, user_id, space_id)
    }

    /// Create an `error` envelope.
    #[must_use]
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        let data = serde_json::json!({ "code": code, "message": message.into() });
        Self::new(EnvelopeType::Error, data, "", "")
    }

    /// Interpret `data` as a typed payload.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` does not match `T`.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}
