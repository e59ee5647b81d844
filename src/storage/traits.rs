//! Collaborator interfaces for membership truth and durable storage
//!
//! The relay consumes these; it never decides membership on its own and
//! never keeps messages after handing them to the persistence adapter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{MessageId, RoomId, UserId};
use crate::error::Result;

/// Kind of row written to a room's history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomMessageKind {
    Text,
    SystemJoin,
    SystemLeave,
}

impl RoomMessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomMessageKind::Text => "text",
            RoomMessageKind::SystemJoin => "system_join",
            RoomMessageKind::SystemLeave => "system_leave",
        }
    }
}

/// Binary presence flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Online,
    Offline,
}

/// Answers room membership and user directory questions
#[async_trait]
pub trait MembershipOracle: Send + Sync {
    /// Whether the user may participate in the room. Unknown rooms answer `false`.
    async fn is_room_member(&self, user_id: UserId, room_id: RoomId) -> Result<bool>;

    /// Whether the user id belongs to a known account
    async fn user_exists(&self, user_id: UserId) -> Result<bool>;

    /// Display name of the room, `RelayError::RoomNotFound` if it does not exist
    async fn room_display_name(&self, room_id: RoomId) -> Result<String>;
}

/// Durable record of messages and presence transitions
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Store a room message or system event and return its identifier
    async fn persist_room_message(
        &self,
        room_id: RoomId,
        user_id: UserId,
        kind: RoomMessageKind,
        content: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<MessageId>;

    /// Store a direct message and return its identifier
    async fn persist_direct_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: &str,
    ) -> Result<MessageId>;

    /// Record a presence transition
    async fn set_presence(&self, user_id: UserId, presence: Presence) -> Result<()>;

    /// Cheap reachability probe run before a connection is admitted
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
