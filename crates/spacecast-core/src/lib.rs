//! # spacecast-core
//!
//! Connection registry and fan-out engine for spacecast.
//!
//! - **Hub** - Single control loop owning every space session
//! - **Session** - Per-connection read/write pumps with bounded queues
//! - **Chat** - Validate, persist and broadcast chat messages
//! - **Notification** - One push connection per user, fire-and-forget
//! - **Presence** - One status connection per user, online/offline fan-out
//! - **Events** - In-process bus turning domain events into notifications
//!
//! ## Architecture
//!
//! ```text
//!  space conn ──▶ read pump ──▶ ChatService ──▶ store
//!                                   │
//!                                   ▼
//!                                  Hub ──▶ session queue ──▶ write pump ──▶ space conn
//!
//!  EventBus ──▶ NotificationEventHandler ──▶ NotificationManager ──▶ user conn
//!  PresenceManager ──▶ every presence conn
//! ```

pub mod chat;
pub mod events;
pub mod hub;
mod liveness;
pub mod message;
pub mod notification;
pub mod presence;
pub mod registry;
pub mod router;
pub mod session;
pub mod store;

pub use chat::{ChatError, ChatService, CHAT_POSTS_METRIC};
pub use events::{
    DomainEvent, EventBus, EventEmitter, EventHandler, HandlerError, NotificationEventHandler,
};
pub use hub::{Hub, HubConfig, HubError, HubHandle, HubStats};
pub use message::{validate_content, ChatMessage, SpaceMessage, ValidationError};
pub use notification::NotificationManager;
pub use presence::PresenceManager;
pub use registry::{ManagerConfig, ManagerError, UserEntry, UserRegistry};
pub use router::{Delivery, SpaceRouter};
pub use session::{
    serve_session, ClientSession, EnqueueError, SessionConfig, SessionId, SessionIdentity,
};
pub use store::{ChatStore, MemoryChatStore, StoreError};
