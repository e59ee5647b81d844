use std::error::Error;
use std::fmt;

use crate::core::{RoomId, UserId};

#[derive(Debug, Clone, PartialEq)]
pub enum RelayError {
    // Protocol errors
    MalformedFrame(String),
    UnknownMessageType(String),
    InvalidField(String),
    MessageTooLarge(usize),
    RateLimited,

    // Auth errors
    MissingToken,
    AuthError(String),
    NotRoomMember(RoomId),

    // Room and direct message state errors
    AlreadyInRoom(RoomId),
    NotInRoom,
    RoomNotFound(RoomId),
    SelfMessage,
    ReceiverNotFound(UserId),
    NotAuthenticated,

    // Storage errors
    StorageError(String),
    ServiceUnavailable(String),

    // Connection errors
    ConnectionClosed,
    ConnectionError(String),

    // System errors
    ConfigError(String),
    Internal(String),
}

impl RelayError {
    /// Stable code carried in outbound `error` frames
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedFrame(_) => "malformed_frame",
            Self::UnknownMessageType(_) => "unknown_type",
            Self::InvalidField(_) => "invalid_field",
            Self::MessageTooLarge(_) => "message_too_large",
            Self::RateLimited => "rate_limited",
            Self::MissingToken | Self::AuthError(_) => "auth_failed",
            Self::NotRoomMember(_) => "not_room_member",
            Self::AlreadyInRoom(_) => "already_in_room",
            Self::NotInRoom => "not_in_room",
            Self::RoomNotFound(_) => "room_not_found",
            Self::SelfMessage => "invalid_receiver",
            Self::ReceiverNotFound(_) => "receiver_not_found",
            Self::NotAuthenticated => "not_authenticated",
            Self::StorageError(_) => "storage_failure",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::ConnectionClosed | Self::ConnectionError(_) => "connection_error",
            Self::ConfigError(_) | Self::Internal(_) => "server_error",
        }
    }

    /// Whether the connection stays open after this error is reported
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::ConnectionClosed
                | Self::ConnectionError(_)
                | Self::ConfigError(_)
                | Self::Internal(_)
        )
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedFrame(msg) => write!(f, "Malformed frame: {}", msg),
            Self::UnknownMessageType(kind) => write!(f, "Unknown message type: {}", kind),
            Self::InvalidField(msg) => write!(f, "Invalid field: {}", msg),
            Self::MessageTooLarge(size) => write!(f, "Message too large: {} bytes", size),
            Self::RateLimited => write!(f, "Rate limit exceeded, please slow down"),
            Self::MissingToken => write!(f, "Authentication token is required"),
            Self::AuthError(msg) => write!(f, "Authentication error: {}", msg),
            Self::NotRoomMember(room_id) => write!(f, "Not a member of room {}", room_id),
            Self::AlreadyInRoom(room_id) => {
                write!(f, "Already in room {}, leave it before joining another", room_id)
            }
            Self::NotInRoom => write!(f, "Not in a room"),
            Self::RoomNotFound(room_id) => write!(f, "Room not found: {}", room_id),
            Self::SelfMessage => write!(f, "Cannot send a direct message to yourself"),
            Self::ReceiverNotFound(user_id) => write!(f, "Receiver user not found: {}", user_id),
            Self::NotAuthenticated => write!(f, "Connection is not authenticated"),
            Self::StorageError(msg) => write!(f, "Storage error: {}", msg),
            Self::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::ConnectionError(msg) => write!(f, "Connection error: {}", msg),
            Self::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl Error for RelayError {}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::MalformedFrame(err.to_string())
    }
}

// Generic result type for the relay
pub type Result<T> = std::result::Result<T, RelayError>;
