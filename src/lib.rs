//! Rusty Relay - a real-time chat relay core implemented in Rust
//!
//! This library authenticates WebSocket sessions, tracks room membership and
//! the live connections of each user, and routes room broadcasts and direct
//! messages. Membership truth and durable storage are delegated to the
//! collaborators in [`storage`] and [`auth`].

pub mod auth;
pub mod config;
pub mod constants;
pub mod core;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod storage;

// Re-export main components
pub use config::{EngineConfig, RoomSeed, ServerConfig, StorageFailurePolicy};
pub use constants::*;
pub use error::{RelayError, Result};
