//! Message types for room-based communication

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{MessageId, RoomId, UserId};
use crate::error::RelayError;

/// Client-to-server message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Join a room
    #[serde(rename = "join_room")]
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: RoomId,
    },

    /// Leave the current room
    #[serde(rename = "leave_room")]
    LeaveRoom,

    /// Send message to the current room
    #[serde(rename = "room_message")]
    RoomMessage { text: String },

    /// Send a direct message to a user
    #[serde(rename = "direct_message")]
    DirectMessage {
        #[serde(rename = "receiverId")]
        receiver_id: UserId,
        text: String,
    },
}

impl ClientMessage {
    /// Wire names of every known inbound type
    pub const KNOWN_TYPES: [&'static str; 4] =
        ["join_room", "leave_room", "room_message", "direct_message"];
}

/// Server-to-client message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Handshake accepted
    #[serde(rename = "auth_success")]
    AuthSuccess {
        #[serde(rename = "userId")]
        user_id: UserId,
        username: String,
    },

    /// Error report, the connection stays open unless a close frame follows
    #[serde(rename = "error")]
    Error {
        code: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<String>,
        #[serde(rename = "roomId", default, skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
    },

    /// Informational notice from the server
    #[serde(rename = "server_message")]
    Notice {
        text: String,
        #[serde(rename = "roomId", default, skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
    },

    /// Room broadcast. `messageId` is absent when the message was not persisted.
    #[serde(rename = "room_message")]
    RoomMessage {
        #[serde(rename = "messageId", default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        #[serde(rename = "senderId")]
        sender_id: UserId,
        #[serde(rename = "senderName")]
        sender_name: String,
        #[serde(rename = "roomId")]
        room_id: RoomId,
        text: String,
        timestamp: DateTime<Utc>,
    },

    /// Direct message, sent to the receiver and echoed to the sender
    #[serde(rename = "direct_message")]
    DirectMessage {
        #[serde(rename = "messageId", default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        #[serde(rename = "senderId")]
        sender_id: UserId,
        #[serde(rename = "senderName")]
        sender_name: String,
        #[serde(rename = "receiverId")]
        receiver_id: UserId,
        text: String,
        timestamp: DateTime<Utc>,
    },

    /// User joined room
    #[serde(rename = "userJoined")]
    UserJoined {
        #[serde(rename = "roomId")]
        room_id: RoomId,
        #[serde(rename = "userId")]
        user_id: UserId,
        username: String,
    },

    /// User left room
    #[serde(rename = "userLeft")]
    UserLeft {
        #[serde(rename = "roomId")]
        room_id: RoomId,
        #[serde(rename = "userId")]
        user_id: UserId,
        username: String,
    },
}

impl ServerMessage {
    /// Build an error frame from a relay error
    pub fn error(err: &RelayError, context: Option<&str>, room_id: Option<RoomId>) -> Self {
        ServerMessage::Error {
            code: err.code().to_string(),
            text: err.to_string(),
            context: context.map(str::to_string),
            room_id,
        }
    }

    pub fn notice(text: impl Into<String>, room_id: Option<RoomId>) -> Self {
        ServerMessage::Notice {
            text: text.into(),
            room_id,
        }
    }
}
