//! Inbound frame decoding and routing
//!
//! Frames are decoded once into a `ClientMessage` and routed to the room
//! manager or direct messenger. Every recoverable failure is reported to the
//! sender as an `error` frame and the connection stays open.

use log::{debug, warn};
use serde_json::Value;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::core::connection::Connection;
use crate::core::direct::DirectMessenger;
use crate::core::message_types::{ClientMessage, ServerMessage};
use crate::core::rate_limiter::MessageRateLimiter;
use crate::core::room::RoomManager;
use crate::core::{RoomId, UserId};
use crate::error::{RelayError, Result};
use crate::metrics::SharedMetrics;

/// Decode and validate one inbound text frame
pub fn decode_frame(raw: &str, max_frame_bytes: usize, max_message_chars: usize) -> Result<ClientMessage> {
    if raw.len() > max_frame_bytes {
        return Err(RelayError::MessageTooLarge(raw.len()));
    }

    let value: Value = serde_json::from_str(raw)?;
    let kind = match value.get("type").and_then(Value::as_str) {
        Some(kind) => kind.to_string(),
        None => {
            return Err(RelayError::MalformedFrame(
                "expected a JSON object with a string 'type' field".to_string(),
            ))
        }
    };

    if !ClientMessage::KNOWN_TYPES.contains(&kind.as_str()) {
        return Err(RelayError::UnknownMessageType(kind));
    }

    let message: ClientMessage = serde_json::from_value(value)
        .map_err(|e| RelayError::InvalidField(format!("{}: {}", kind, e)))?;
    validate(&message, max_message_chars)?;
    Ok(message)
}

fn validate(message: &ClientMessage, max_message_chars: usize) -> Result<()> {
    match message {
        ClientMessage::JoinRoom { room_id } => positive_id(*room_id, "roomId"),
        ClientMessage::LeaveRoom => Ok(()),
        ClientMessage::RoomMessage { text } => validate_text(text, max_message_chars),
        ClientMessage::DirectMessage { receiver_id, text } => {
            positive_id(*receiver_id, "receiverId")?;
            validate_text(text, max_message_chars)
        }
    }
}

fn positive_id(id: u64, field: &str) -> Result<()> {
    if id == 0 {
        return Err(RelayError::InvalidField(format!("{} must be a positive integer", field)));
    }
    Ok(())
}

fn validate_text(text: &str, max_message_chars: usize) -> Result<()> {
    if text.trim().is_empty() {
        return Err(RelayError::InvalidField("text must not be empty".to_string()));
    }
    let chars = text.chars().count();
    if chars > max_message_chars {
        return Err(RelayError::InvalidField(format!(
            "text is {} characters, the limit is {}",
            chars, max_message_chars
        )));
    }
    Ok(())
}

/// Where a failed request came from, echoed in the error frame
struct Failure {
    context: &'static str,
    room_id: Option<RoomId>,
    error: RelayError,
}

impl Failure {
    fn new(context: &'static str, room_id: Option<RoomId>, error: RelayError) -> Self {
        Self {
            context,
            room_id,
            error,
        }
    }
}

pub struct Dispatcher {
    rooms: Arc<RoomManager>,
    direct: DirectMessenger,
    limiter: Arc<MessageRateLimiter>,
    metrics: SharedMetrics,
    config: EngineConfig,
}

impl Dispatcher {
    pub fn new(
        rooms: Arc<RoomManager>,
        direct: DirectMessenger,
        limiter: Arc<MessageRateLimiter>,
        metrics: SharedMetrics,
        config: EngineConfig,
    ) -> Self {
        Self {
            rooms,
            direct,
            limiter,
            metrics,
            config,
        }
    }

    /// Handle one inbound frame from an authenticated connection.
    ///
    /// Recoverable errors are reported to the sender and swallowed. Only
    /// unrecoverable ones are returned, for the engine's error path.
    pub async fn dispatch(&self, conn: &Arc<Connection>, raw: &str) -> Result<()> {
        self.metrics.frame_received();

        match self.route(conn, raw).await {
            Ok(()) => Ok(()),
            Err(failure) if failure.error.is_recoverable() => {
                debug!(
                    "Client {} {} failed: {}",
                    conn.id, failure.context, failure.error
                );
                conn.send(&ServerMessage::error(
                    &failure.error,
                    Some(failure.context),
                    failure.room_id,
                ));
                Ok(())
            }
            // Closed underneath us by a supersede or slow-consumer close
            Err(failure) if failure.error == RelayError::ConnectionClosed => Ok(()),
            Err(failure) => Err(failure.error),
        }
    }

    async fn route(&self, conn: &Arc<Connection>, raw: &str) -> std::result::Result<(), Failure> {
        let message = match decode_frame(raw, self.config.max_frame_bytes, self.config.max_message_chars) {
            Ok(message) => message,
            Err(RelayError::MalformedFrame(reason)) if self.config.legacy_plaintext => {
                return match conn.room_id() {
                    Some(room_id) => self.legacy_room_message(conn, room_id, raw).await,
                    None => Err(self.protocol_failure(RelayError::MalformedFrame(reason))),
                };
            }
            Err(e) => return Err(self.protocol_failure(e)),
        };

        match message {
            ClientMessage::JoinRoom { room_id } => self
                .rooms
                .join(conn, room_id)
                .await
                .map_err(|e| Failure::new("room_join", Some(room_id), e)),

            ClientMessage::LeaveRoom => self
                .rooms
                .leave(conn)
                .await
                .map(|_| ())
                .map_err(|e| Failure::new("room_leave", conn.room_id(), e)),

            ClientMessage::RoomMessage { text } => {
                let room_id = conn.room_id();
                self.room_message(conn, &text)
                    .await
                    .map_err(|e| Failure::new("room_message", room_id, e))
            }

            ClientMessage::DirectMessage { receiver_id, text } => self
                .direct_message(conn, receiver_id, &text)
                .await
                .map_err(|e| Failure::new("direct_message", None, e)),
        }
    }

    fn protocol_failure(&self, error: RelayError) -> Failure {
        self.metrics.protocol_error();
        Failure::new("protocol", None, error)
    }

    async fn check_rate(&self, conn: &Connection) -> Result<()> {
        let identity = conn.identity().ok_or(RelayError::NotAuthenticated)?;
        if self.limiter.allow_message(identity.user_id).await {
            Ok(())
        } else {
            debug!("User {} hit the message rate limit", identity.user_id);
            Err(RelayError::RateLimited)
        }
    }

    async fn room_message(&self, conn: &Arc<Connection>, text: &str) -> Result<()> {
        if conn.room_id().is_none() {
            return Err(RelayError::NotInRoom);
        }
        self.check_rate(conn).await?;
        self.rooms.send_room_message(conn, text).await.map(|_| ())
    }

    async fn direct_message(&self, conn: &Arc<Connection>, receiver_id: UserId, text: &str) -> Result<()> {
        self.check_rate(conn).await?;
        self.direct.send(conn, receiver_id, text).await.map(|_| ())
    }

    /// Bare text sent by an old client while in a room
    async fn legacy_room_message(
        &self,
        conn: &Arc<Connection>,
        room_id: RoomId,
        raw: &str,
    ) -> std::result::Result<(), Failure> {
        // Can leak malformed client data into room history
        warn!(
            "Client {} sent a non-JSON frame, relaying it to room {} as plain text",
            conn.id, room_id
        );
        let text = raw.trim();
        validate_text(text, self.config.max_message_chars)
            .map_err(|e| Failure::new("room_message", Some(room_id), e))?;
        self.room_message(conn, text)
            .await
            .map_err(|e| Failure::new("room_message", Some(room_id), e))
    }
}
