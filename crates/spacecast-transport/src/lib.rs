//! # spacecast-transport
//!
//! Connection abstraction for spacecast.
//!
//! - **WebSocket** - An upgraded axum socket, used in production
//! - **Memory** - An in-process pair, used by tests
//!
//! ## Connection Abstraction
//!
//! Both implement the [`Connection`] trait, so pumps and managers are
//! transport-agnostic.
//!
//! ```rust,ignore
//! use spacecast_transport::Connection;
//!
//! async fn drain(conn: &dyn Connection) {
//!     while let Ok(frame) = conn.read_frame().await {
//!         // Process frame
//!     }
//! }
//! ```

pub mod memory;
mod state;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{MemoryConnection, MemoryPeer};
pub use traits::{Connection, ConnectionError, ConnectionId, Frame, FrameKind, LivenessHandler};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnection;
