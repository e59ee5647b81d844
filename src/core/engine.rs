//! Connection lifecycle engine
//!
//! The only component the transport talks to. It authenticates new
//! connections, enforces one live session per user, feeds frames to the
//! dispatcher and runs the disconnect cleanup exactly once per connection.

use log::{debug, error, info, warn};
use std::sync::Arc;

use crate::auth::provider::AuthValidator;
use crate::config::EngineConfig;
use crate::core::connection::{CloseCode, Connection, ConnectionIo, ConnectionPhase};
use crate::core::direct::DirectMessenger;
use crate::core::dispatcher::Dispatcher;
use crate::core::message_types::ServerMessage;
use crate::core::presence::PresenceTracker;
use crate::core::rate_limiter::MessageRateLimiter;
use crate::core::registry::ConnectionRegistry;
use crate::core::room::RoomManager;
use crate::core::RoomId;
use crate::error::{RelayError, Result};
use crate::metrics::{RelayMetrics, SharedMetrics};
use crate::storage::traits::{MembershipOracle, PersistenceAdapter};

/// External services the engine consults
#[derive(Clone)]
pub struct Collaborators {
    pub auth: Arc<dyn AuthValidator>,
    pub membership: Arc<dyn MembershipOracle>,
    pub persistence: Arc<dyn PersistenceAdapter>,
}

/// Credentials and options carried by the upgrade request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    pub token: Option<String>,
    /// Raw `roomId` as received, validated during connect
    pub room_id: Option<String>,
}

impl ConnectParams {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            room_id: None,
        }
    }

    pub fn with_room(mut self, room_id: impl ToString) -> Self {
        self.room_id = Some(room_id.to_string());
        self
    }
}

fn parse_room_id(raw: &str) -> Result<RoomId> {
    match raw.trim().parse::<RoomId>() {
        Ok(room_id) if room_id > 0 => Ok(room_id),
        _ => Err(RelayError::InvalidField(format!(
            "roomId must be a positive integer, got '{}'",
            raw
        ))),
    }
}

pub struct Engine {
    config: EngineConfig,
    auth: Arc<dyn AuthValidator>,
    persistence: Arc<dyn PersistenceAdapter>,
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomManager>,
    presence: PresenceTracker,
    dispatcher: Dispatcher,
    limiter: Arc<MessageRateLimiter>,
    metrics: SharedMetrics,
}

pub type SharedEngine = Arc<Engine>;

impl Engine {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            auth,
            membership,
            persistence,
        } = collaborators;

        let metrics: SharedMetrics = Arc::new(RelayMetrics::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomManager::new(
            Arc::clone(&membership),
            Arc::clone(&persistence),
            config.room_persistence,
            Arc::clone(&metrics),
        ));
        let direct = DirectMessenger::new(
            Arc::clone(&registry),
            membership,
            Arc::clone(&persistence),
            config.direct_persistence,
            Arc::clone(&metrics),
        );
        let limiter = Arc::new(MessageRateLimiter::new(config.messages_per_minute));
        let presence = PresenceTracker::new(
            Arc::clone(&persistence),
            Arc::clone(&registry),
            Arc::clone(&metrics),
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&rooms),
            direct,
            Arc::clone(&limiter),
            Arc::clone(&metrics),
            config.clone(),
        );

        Self {
            config,
            auth,
            persistence,
            registry,
            rooms,
            presence,
            dispatcher,
            limiter,
            metrics,
        }
    }

    /// Spawn background housekeeping. Requires a running tokio runtime.
    pub fn start_background_tasks(&self) {
        Arc::clone(&self.limiter).start_cleanup_task();
    }

    /// Allocate a connection for a freshly accepted socket
    pub fn open_connection(&self) -> (Arc<Connection>, ConnectionIo) {
        let (conn, io) = Connection::new(self.config.outbound_buffer, self.config.backpressure);
        self.metrics.connection_opened();
        debug!("Connection {} opened", conn.id);
        (Arc::new(conn), io)
    }

    /// Report a failure that ends the handshake and close the connection
    fn reject(&self, conn: &Connection, err: RelayError, code: CloseCode) -> RelayError {
        conn.send(&ServerMessage::error(&err, Some("connect"), None));
        conn.close(code, err.to_string());
        err
    }

    /// Authenticate a new connection, register it and join the requested room.
    ///
    /// On `Err` the connection has been told why and asked to close. It was
    /// never registered, and the caller still runs `disconnect`.
    pub async fn connect(&self, conn: &Arc<Connection>, params: ConnectParams) -> Result<()> {
        conn.begin_authentication()?;

        let token = match params.token.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => token.to_string(),
            _ => {
                self.metrics.auth_failed();
                info!("Connection {} rejected: no token", conn.id);
                return Err(self.reject(conn, RelayError::MissingToken, CloseCode::AuthFailed));
            }
        };

        let requested_room = match params.room_id.as_deref() {
            Some(raw) => match parse_room_id(raw) {
                Ok(room_id) => Some(room_id),
                Err(e) => {
                    self.metrics.protocol_error();
                    info!("Connection {} rejected: {}", conn.id, e);
                    return Err(self.reject(conn, e, CloseCode::ProtocolError));
                }
            },
            None => None,
        };

        if let Err(e) = self.persistence.health_check().await {
            warn!("Persistence unavailable, refusing connection {}: {}", conn.id, e);
            let err = RelayError::ServiceUnavailable(e.to_string());
            return Err(self.reject(conn, err, CloseCode::ServiceUnavailable));
        }

        let identity = match self.auth.validate_token(&token).await {
            Ok(identity) => identity,
            Err(RelayError::ServiceUnavailable(reason)) => {
                warn!(
                    "Auth provider {} unreachable, refusing connection {}: {}",
                    self.auth.provider_name(),
                    conn.id,
                    reason
                );
                let err = RelayError::ServiceUnavailable(reason);
                return Err(self.reject(conn, err, CloseCode::ServiceUnavailable));
            }
            Err(e) => {
                self.metrics.auth_failed();
                info!("Connection {} failed authentication: {}", conn.id, e);
                let err = match e {
                    RelayError::AuthError(_) | RelayError::MissingToken => e,
                    other => RelayError::AuthError(other.to_string()),
                };
                return Err(self.reject(conn, err, CloseCode::AuthFailed));
            }
        };

        conn.authenticate(identity.clone())?;
        let registration = self.registry.register(conn).await?;

        for old in registration.displaced {
            self.metrics.session_superseded();
            info!(
                "Connection {} of user {} superseded by {}",
                old.id, identity.user_id, conn.id
            );
            old.send(&ServerMessage::Error {
                code: "superseded".to_string(),
                text: "Your account was opened in another session".to_string(),
                context: Some("session".to_string()),
                room_id: None,
            });
            old.close(CloseCode::Superseded, "superseded by a newer session");
            self.disconnect(&old).await;
        }

        if registration.came_online {
            self.presence.sync(identity.user_id).await;
        }

        info!(
            "User {} ({}) authenticated on connection {}",
            identity.username, identity.user_id, conn.id
        );
        conn.send(&ServerMessage::AuthSuccess {
            user_id: identity.user_id,
            username: identity.username.clone(),
        });

        if let Some(room_id) = requested_room {
            if let Err(e) = self.rooms.join(conn, room_id).await {
                info!(
                    "Connect-time join of room {} failed for user {}: {}",
                    room_id, identity.user_id, e
                );
                conn.send(&ServerMessage::error(&e, Some("room_join"), Some(room_id)));

                if self.config.strict_connect_join {
                    let code = match e {
                        RelayError::ServiceUnavailable(_) | RelayError::StorageError(_) => {
                            CloseCode::ServiceUnavailable
                        }
                        _ => CloseCode::Forbidden,
                    };
                    conn.close(code, e.to_string());
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Handle one inbound text frame
    pub async fn on_frame(&self, conn: &Arc<Connection>, raw: &str) {
        if !conn.is_authenticated() {
            debug!("Ignoring frame from unauthenticated connection {}", conn.id);
            return;
        }

        if let Err(e) = self.dispatcher.dispatch(conn, raw).await {
            self.on_error(conn, &e).await;
        }
    }

    /// Report a protocol violation detected by the transport, such as a binary frame
    pub fn on_protocol_violation(&self, conn: &Connection, err: &RelayError) {
        self.metrics.protocol_error();
        conn.send(&ServerMessage::error(err, Some("protocol"), None));
    }

    /// Tear down a connection. Safe to call any number of times, only the
    /// first call has side effects.
    pub async fn disconnect(&self, conn: &Connection) {
        let Some(previous) = conn.mark_closed() else {
            return;
        };
        conn.close(CloseCode::Normal, "connection closed");

        if let Some(identity) = conn.identity() {
            let was_last = self.registry.unregister(conn).await;

            if let ConnectionPhase::InRoom(room_id) = previous {
                self.rooms.depart(conn, &identity, room_id).await;
            }

            if was_last {
                self.presence.sync(identity.user_id).await;
            }

            info!(
                "User {} disconnected from connection {} after {:?}",
                identity.username,
                conn.id,
                conn.connection_duration()
            );
        } else {
            debug!("Unauthenticated connection {} closed", conn.id);
        }

        self.metrics.connection_closed();
    }

    /// Last-resort handler for unexpected failures. Never propagates.
    pub async fn on_error(&self, conn: &Connection, err: &RelayError) {
        error!("Connection {} failed: {}", conn.id, err);
        conn.send(&ServerMessage::Error {
            code: "server_error".to_string(),
            text: "Internal server error".to_string(),
            context: None,
            room_id: None,
        });
        conn.close(CloseCode::ServerError, "internal error");
        self.disconnect(conn).await;
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
