//! Core relay engine: connections, rooms, routing and delivery

pub mod connection;
pub mod direct;
pub mod dispatcher;
pub mod engine;
pub mod message_types;
pub mod presence;
pub mod rate_limiter;
pub mod registry;
pub mod room;

/// Stable user identifier issued by the auth provider
pub type UserId = u64;
/// Room identifier shared with the membership oracle
pub type RoomId = u64;
/// Identifier assigned by the persistence adapter
pub type MessageId = u64;

// Re-export main components for convenience
pub use connection::{BackpressurePolicy, CloseCode, Connection, ConnectionIo, ConnectionPhase};
pub use dispatcher::{decode_frame, Dispatcher};
pub use engine::{Collaborators, ConnectParams, Engine, SharedEngine};
pub use message_types::{ClientMessage, ServerMessage};
pub use registry::ConnectionRegistry;
pub use room::{Room, RoomManager};
