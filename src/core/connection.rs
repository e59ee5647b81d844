//! WebSocket connection management
//! Handles the lifecycle state and outbound side of one client session

use log::{debug, warn};
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::auth::provider::Identity;
use crate::core::message_types::ServerMessage;
use crate::core::RoomId;
use crate::error::{RelayError, Result};

/// Application-level close codes sent in the WebSocket close frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal,
    ServerError,
    ProtocolError,
    AuthFailed,
    Forbidden,
    Superseded,
    ServiceUnavailable,
    SlowConsumer,
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::ServerError => 1011,
            CloseCode::ProtocolError => 4000,
            CloseCode::AuthFailed => 4001,
            CloseCode::Forbidden => 4003,
            CloseCode::Superseded => 4008,
            CloseCode::ServiceUnavailable => 4013,
            CloseCode::SlowConsumer => 4029,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: CloseCode,
    pub reason: String,
}

/// What to do when a recipient's outbound queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Drop the frame for that recipient only
    Drop,
    /// Close the stalled recipient with `CloseCode::SlowConsumer`
    Disconnect,
}

impl FromStr for BackpressurePolicy {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "drop" => Ok(BackpressurePolicy::Drop),
            "disconnect" => Ok(BackpressurePolicy::Disconnect),
            other => Err(RelayError::ConfigError(format!(
                "Unknown backpressure policy '{}', expected 'drop' or 'disconnect'",
                other
            ))),
        }
    }
}

/// Result of queueing one outbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Queue full, frame discarded
    Dropped,
    /// Queue full, connection closed as a slow consumer
    Disconnected,
    /// Connection already closing or its writer is gone
    Closed,
}

impl SendOutcome {
    pub fn is_queued(self) -> bool {
        self == SendOutcome::Queued
    }
}

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Authenticating,
    Authenticated,
    InRoom(RoomId),
    Closed,
}

#[derive(Debug)]
struct ConnectionState {
    phase: ConnectionPhase,
    identity: Option<Identity>,
}

/// Transport-facing ends of a connection's channels
pub struct ConnectionIo {
    /// Serialized frames waiting to be written to the socket
    pub frames: mpsc::Receiver<String>,
    /// Fires once when the engine decides the connection must close
    pub shutdown: watch::Receiver<Option<CloseFrame>>,
}

/// Represents the state of a single client session
pub struct Connection {
    pub id: String,
    pub connected_at: Instant,
    sender: mpsc::Sender<String>,
    shutdown: watch::Sender<Option<CloseFrame>>,
    backpressure: BackpressurePolicy,
    state: Mutex<ConnectionState>,
}

impl Connection {
    /// Create a new connection with a unique ID and a bounded outbound queue
    pub fn new(capacity: usize, backpressure: BackpressurePolicy) -> (Self, ConnectionIo) {
        let (sender, frames) = mpsc::channel(capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(None);

        let connection = Self {
            id: Uuid::new_v4().to_string(),
            connected_at: Instant::now(),
            sender,
            shutdown,
            backpressure,
            state: Mutex::new(ConnectionState {
                phase: ConnectionPhase::Connecting,
                identity: None,
            }),
        };

        (
            connection,
            ConnectionIo {
                frames,
                shutdown: shutdown_rx,
            },
        )
    }

    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        // State updates are single assignments, a poisoned guard is still consistent
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state().phase
    }

    pub fn identity(&self) -> Option<Identity> {
        self.state().identity.clone()
    }

    pub fn room_id(&self) -> Option<RoomId> {
        match self.state().phase {
            ConnectionPhase::InRoom(room_id) => Some(room_id),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.phase(),
            ConnectionPhase::Authenticated | ConnectionPhase::InRoom(_)
        )
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == ConnectionPhase::Closed
    }

    /// Connecting -> Authenticating
    pub fn begin_authentication(&self) -> Result<()> {
        let mut state = self.state();
        match state.phase {
            ConnectionPhase::Connecting => {
                state.phase = ConnectionPhase::Authenticating;
                Ok(())
            }
            ConnectionPhase::Closed => Err(RelayError::ConnectionClosed),
            other => Err(RelayError::Internal(format!(
                "authentication started twice (phase {:?})",
                other
            ))),
        }
    }

    /// Authenticating -> Authenticated, binding the identity for good
    pub fn authenticate(&self, identity: Identity) -> Result<()> {
        let mut state = self.state();
        match state.phase {
            ConnectionPhase::Authenticating => {
                state.phase = ConnectionPhase::Authenticated;
                state.identity = Some(identity);
                Ok(())
            }
            ConnectionPhase::Closed => Err(RelayError::ConnectionClosed),
            other => Err(RelayError::Internal(format!(
                "identity bound outside authentication (phase {:?})",
                other
            ))),
        }
    }

    /// Authenticated -> InRoom. Joining while in a room is an error, never a switch.
    pub fn enter_room(&self, room_id: RoomId) -> Result<()> {
        let mut state = self.state();
        match state.phase {
            ConnectionPhase::Authenticated => {
                state.phase = ConnectionPhase::InRoom(room_id);
                Ok(())
            }
            ConnectionPhase::InRoom(current) => Err(RelayError::AlreadyInRoom(current)),
            ConnectionPhase::Closed => Err(RelayError::ConnectionClosed),
            _ => Err(RelayError::NotAuthenticated),
        }
    }

    /// InRoom -> Authenticated, returning the room that was left
    pub fn exit_room(&self) -> Result<RoomId> {
        let mut state = self.state();
        match state.phase {
            ConnectionPhase::InRoom(room_id) => {
                state.phase = ConnectionPhase::Authenticated;
                Ok(room_id)
            }
            ConnectionPhase::Closed => Err(RelayError::ConnectionClosed),
            _ => Err(RelayError::NotInRoom),
        }
    }

    /// Move to Closed. Returns the phase it left, or `None` if it was already closed.
    pub fn mark_closed(&self) -> Option<ConnectionPhase> {
        let mut state = self.state();
        if state.phase == ConnectionPhase::Closed {
            return None;
        }
        Some(std::mem::replace(&mut state.phase, ConnectionPhase::Closed))
    }

    /// Ask the transport to close the socket. Only the first request wins.
    pub fn close(&self, code: CloseCode, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.shutdown.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(CloseFrame { code, reason });
            true
        })
    }

    /// Close frame requested so far, if any
    pub fn close_frame(&self) -> Option<CloseFrame> {
        self.shutdown.borrow().clone()
    }

    /// Subscribe to the close request
    pub fn closed_signal(&self) -> watch::Receiver<Option<CloseFrame>> {
        self.shutdown.subscribe()
    }

    /// Serialize and queue a server message
    pub fn send(&self, message: &ServerMessage) -> SendOutcome {
        match serde_json::to_string(message) {
            Ok(text) => self.send_text(text),
            Err(e) => {
                warn!("Failed to serialize message for client {}: {}", self.id, e);
                SendOutcome::Closed
            }
        }
    }

    /// Queue a text frame without waiting
    pub fn send_text(&self, text: String) -> SendOutcome {
        if self.shutdown.borrow().is_some() {
            return SendOutcome::Closed;
        }

        match self.sender.try_send(text) {
            Ok(()) => SendOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => match self.backpressure {
                BackpressurePolicy::Drop => {
                    debug!("Outbound queue full for client {}, frame dropped", self.id);
                    SendOutcome::Dropped
                }
                BackpressurePolicy::Disconnect => {
                    warn!("Outbound queue full for client {}, disconnecting", self.id);
                    self.close(CloseCode::SlowConsumer, "outbound queue full");
                    SendOutcome::Disconnected
                }
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Writer gone for client {}", self.id);
                SendOutcome::Closed
            }
        }
    }

    /// Calculate the connection duration
    pub fn connection_duration(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticated() -> (Connection, ConnectionIo) {
        let (conn, io) = Connection::new(4, BackpressurePolicy::Drop);
        conn.begin_authentication().unwrap();
        conn.authenticate(Identity::new(1, "alice")).unwrap();
        (conn, io)
    }

    #[test]
    fn test_state_machine_happy_path() {
        let (conn, _io) = authenticated();
        assert_eq!(conn.phase(), ConnectionPhase::Authenticated);

        conn.enter_room(5).unwrap();
        assert_eq!(conn.room_id(), Some(5));
        assert_eq!(conn.enter_room(6), Err(RelayError::AlreadyInRoom(5)));

        assert_eq!(conn.exit_room(), Ok(5));
        assert_eq!(conn.exit_room(), Err(RelayError::NotInRoom));
    }

    #[test]
    fn test_mark_closed_is_idempotent() {
        let (conn, _io) = authenticated();
        conn.enter_room(5).unwrap();

        assert_eq!(conn.mark_closed(), Some(ConnectionPhase::InRoom(5)));
        assert_eq!(conn.mark_closed(), None);
        assert_eq!(conn.enter_room(5), Err(RelayError::ConnectionClosed));
    }

    #[test]
    fn test_first_close_wins() {
        let (conn, io) = authenticated();
        assert!(conn.close(CloseCode::Superseded, "replaced"));
        assert!(!conn.close(CloseCode::Normal, "bye"));

        let frame = io.shutdown.borrow().clone().unwrap();
        assert_eq!(frame.code, CloseCode::Superseded);
        assert_eq!(conn.send_text("late".to_string()), SendOutcome::Closed);
    }

    #[test]
    fn test_backpressure_policies() {
        let (conn, _io) = Connection::new(1, BackpressurePolicy::Drop);
        assert_eq!(conn.send_text("a".to_string()), SendOutcome::Queued);
        assert_eq!(conn.send_text("b".to_string()), SendOutcome::Dropped);
        assert!(conn.close_frame().is_none());

        let (conn, _io) = Connection::new(1, BackpressurePolicy::Disconnect);
        assert_eq!(conn.send_text("a".to_string()), SendOutcome::Queued);
        assert_eq!(conn.send_text("b".to_string()), SendOutcome::Disconnected);
        assert_eq!(conn.close_frame().unwrap().code, CloseCode::SlowConsumer);
    }
}
