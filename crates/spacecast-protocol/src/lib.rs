//! # spacecast-protocol
//!
//! Wire protocol definitions for spacecast.
//!
//! Space connections exchange [`Envelope`]s; the global notification and
//! presence connections receive [`Notification`]s and [`StatusMessage`]s.
//! Everything is JSON.
//!
//! ## Envelope Types
//!
//! - `chat` - A message posted to a space
//! - `join` / `leave` - Space membership changes
//! - `ping` / `pong` - Application-level keepalive
//! - `error` - Rejected client input
//!
//! ## Example
//!
//! ```rust
//! use spacecast_protocol::{codec, Envelope};
//!
//! let envelope = Envelope::join("7", "alice", "42");
//!
//! let encoded = codec::encode(&envelope).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(envelope, decoded);
//! ```

pub mod codec;
pub mod envelope;
pub mod status;

pub use codec::{decode, encode, ProtocolError};
pub use envelope::{
    error_code, now_millis, ChatInput, ChatPayload, Envelope, EnvelopeType, ErrorPayload,
    MembershipPayload, SpaceId, UserId,
};
pub use status::{Notification, PresenceStatus, StatusMessage};
