//! Live room membership and fan-out
//!
//! Rooms exist only while someone is joined. Membership checks and durable
//! history are delegated to the collaborators.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::auth::provider::Identity;
use crate::config::StorageFailurePolicy;
use crate::core::connection::Connection;
use crate::core::message_types::ServerMessage;
use crate::core::RoomId;
use crate::error::{RelayError, Result};
use crate::metrics::SharedMetrics;
use crate::storage::traits::{MembershipOracle, PersistenceAdapter, RoomMessageKind};

/// Live participation in a chat room
///
/// Exists only while at least one connection is joined. The room's durable
/// identity and name belong to the membership oracle.
#[derive(Debug, Clone)]
pub struct Room {
    /// Room identifier shared with the membership oracle
    pub id: RoomId,
    /// Joined connections keyed by connection ID
    members: HashMap<String, Arc<Connection>>,
    /// When the first member joined
    pub created_at: DateTime<Utc>,
}

impl Room {
    fn new(id: RoomId) -> Self {
        Self {
            id,
            members: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Returns the number of members in the room
    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

/// Manages all rooms with live members
pub struct RoomManager {
    /// Map of room ID to live room. An entry never has an empty member set.
    rooms: RwLock<HashMap<RoomId, Room>>,
    membership: Arc<dyn MembershipOracle>,
    persistence: Arc<dyn PersistenceAdapter>,
    persistence_policy: StorageFailurePolicy,
    metrics: SharedMetrics,
}

impl RoomManager {
    pub fn new(
        membership: Arc<dyn MembershipOracle>,
        persistence: Arc<dyn PersistenceAdapter>,
        persistence_policy: StorageFailurePolicy,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            membership,
            persistence,
            persistence_policy,
            metrics,
        }
    }

    /// Join a connection to a room after the membership oracle approves.
    ///
    /// Rejected if the connection is already in a room. On success the join is
    /// persisted as a `system_join` event and announced to the whole room,
    /// joiner included.
    pub async fn join(&self, conn: &Arc<Connection>, room_id: RoomId) -> Result<()> {
        let identity = conn.identity().ok_or(RelayError::NotAuthenticated)?;
        if let Some(current) = conn.room_id() {
            return Err(RelayError::AlreadyInRoom(current));
        }

        // No lock is held while the oracle is consulted
        if !self
            .membership
            .is_room_member(identity.user_id, room_id)
            .await?
        {
            info!(
                "User {} denied access to room {}",
                identity.user_id, room_id
            );
            return Err(RelayError::NotRoomMember(room_id));
        }

        {
            // Hold the map lock across the state change so the connection's
            // room field and the member set never disagree
            let mut rooms = self.rooms.write().await;
            conn.enter_room(room_id)?;
            rooms
                .entry(room_id)
                .or_insert_with(|| Room::new(room_id))
                .members
                .insert(conn.id.clone(), Arc::clone(conn));
        }

        info!("User {} joined room {}", identity.username, room_id);

        self.persist_system_event(room_id, &identity, RoomMessageKind::SystemJoin)
            .await;

        let notification = ServerMessage::UserJoined {
            room_id,
            user_id: identity.user_id,
            username: identity.username.clone(),
        };
        self.broadcast(room_id, &notification, None).await;

        let name = self.display_name(room_id).await;
        conn.send(&ServerMessage::notice(
            format!("You joined {}", name),
            Some(room_id),
        ));

        Ok(())
    }

    /// Remove a connection from its current room
    pub async fn leave(&self, conn: &Arc<Connection>) -> Result<RoomId> {
        let identity = conn.identity().ok_or(RelayError::NotAuthenticated)?;

        let room_id = {
            let mut rooms = self.rooms.write().await;
            let room_id = conn.exit_room()?;
            Self::detach(&mut rooms, &conn.id, room_id);
            room_id
        };

        self.announce_departure(room_id, &identity).await;
        let name = self.display_name(room_id).await;
        conn.send(&ServerMessage::notice(
            format!("You left {}", name),
            Some(room_id),
        ));

        Ok(room_id)
    }

    async fn display_name(&self, room_id: RoomId) -> String {
        match self.membership.room_display_name(room_id).await {
            Ok(name) => name,
            Err(e) => {
                debug!("No display name for room {}: {}", room_id, e);
                format!("Room {}", room_id)
            }
        }
    }

    /// Remove a connection that is already closed from the room it was in
    pub async fn depart(&self, conn: &Connection, identity: &Identity, room_id: RoomId) {
        let removed = {
            let mut rooms = self.rooms.write().await;
            Self::detach(&mut rooms, &conn.id, room_id)
        };

        if removed {
            self.announce_departure(room_id, identity).await;
        }
    }

    /// Drop a member and delete the room once it is empty
    fn detach(rooms: &mut HashMap<RoomId, Room>, connection_id: &str, room_id: RoomId) -> bool {
        let Some(room) = rooms.get_mut(&room_id) else {
            return false;
        };
        let removed = room.members.remove(connection_id).is_some();
        if room.members.is_empty() {
            rooms.remove(&room_id);
            debug!("Room {} is empty and was removed", room_id);
        }
        removed
    }

    async fn announce_departure(&self, room_id: RoomId, identity: &Identity) {
        info!("User {} left room {}", identity.username, room_id);

        self.persist_system_event(room_id, identity, RoomMessageKind::SystemLeave)
            .await;

        let notification = ServerMessage::UserLeft {
            room_id,
            user_id: identity.user_id,
            username: identity.username.clone(),
        };
        self.broadcast(room_id, &notification, None).await;
    }

    async fn persist_system_event(&self, room_id: RoomId, identity: &Identity, kind: RoomMessageKind) {
        let content = match kind {
            RoomMessageKind::SystemJoin => format!("{} joined the room", identity.username),
            RoomMessageKind::SystemLeave => format!("{} left the room", identity.username),
            RoomMessageKind::Text => return,
        };
        let metadata = json!({ "username": identity.username });

        if let Err(e) = self
            .persistence
            .persist_room_message(room_id, identity.user_id, kind, &content, Some(metadata))
            .await
        {
            self.metrics.persistence_failed();
            warn!(
                "Failed to persist {} for user {} in room {}: {}",
                kind.as_str(),
                identity.user_id,
                room_id,
                e
            );
        }
    }

    /// Send a message to every connection in the room except `exclude`.
    ///
    /// A room without live members silently drops the message. Members are
    /// snapshotted first so sends never run under the map lock.
    pub async fn broadcast(
        &self,
        room_id: RoomId,
        message: &ServerMessage,
        exclude: Option<&str>,
    ) -> usize {
        let members: Vec<Arc<Connection>> = {
            let rooms = self.rooms.read().await;
            match rooms.get(&room_id) {
                Some(room) => room.members.values().cloned().collect(),
                None => return 0,
            }
        };

        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize broadcast for room {}: {}", room_id, e);
                return 0;
            }
        };

        let mut delivered = 0;
        for member in members {
            if exclude == Some(member.id.as_str()) {
                continue;
            }
            let outcome = member.send_text(text.clone());
            self.metrics.record_send(outcome);
            if outcome.is_queued() {
                delivered += 1;
            }
        }

        log::trace!("Broadcast to {} members of room {}", delivered, room_id);
        delivered
    }

    /// Persist and broadcast a text message from a joined connection.
    ///
    /// With the best-effort policy a storage failure still broadcasts, minus
    /// the message id. With the reject policy the failure is returned and
    /// nothing is sent.
    pub async fn send_room_message(&self, conn: &Arc<Connection>, text: &str) -> Result<ServerMessage> {
        let identity = conn.identity().ok_or(RelayError::NotAuthenticated)?;
        let room_id = conn.room_id().ok_or(RelayError::NotInRoom)?;

        let message_id = match self
            .persistence
            .persist_room_message(room_id, identity.user_id, RoomMessageKind::Text, text, None)
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                self.metrics.persistence_failed();
                match self.persistence_policy {
                    StorageFailurePolicy::BestEffort => {
                        warn!(
                            "Room {} message from user {} not persisted, broadcasting without id: {}",
                            room_id, identity.user_id, e
                        );
                        None
                    }
                    StorageFailurePolicy::Reject => return Err(e),
                }
            }
        };

        let message = ServerMessage::RoomMessage {
            message_id,
            sender_id: identity.user_id,
            sender_name: identity.username,
            room_id,
            text: text.to_string(),
            timestamp: Utc::now(),
        };

        self.metrics.room_message();
        let delivered = self.broadcast(room_id, &message, None).await;
        debug!("Room message delivered to {} members of room {}", delivered, room_id);

        Ok(message)
    }

    pub async fn room_exists(&self, room_id: RoomId) -> bool {
        self.rooms.read().await.contains_key(&room_id)
    }

    /// Gets the connection IDs joined to a room
    pub async fn get_room_members(&self, room_id: RoomId) -> Vec<String> {
        self.rooms
            .read()
            .await
            .get(&room_id)
            .map(|room| room.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn member_count(&self, room_id: RoomId) -> usize {
        self.rooms
            .read()
            .await
            .get(&room_id)
            .map(Room::member_count)
            .unwrap_or(0)
    }

    /// IDs of all rooms with live members
    pub async fn active_rooms(&self) -> Vec<RoomId> {
        self.rooms.read().await.keys().copied().collect()
    }
}
