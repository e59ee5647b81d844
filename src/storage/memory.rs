//! In-memory collaborator backend for development and testing
//!
//! Implements all three collaborator interfaces (token validation,
//! membership, persistence) on top of plain maps. Nothing survives a
//! restart. Outages can be simulated with `set_offline` and
//! `set_failing_writes`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::traits::*;
use crate::auth::provider::{AuthValidator, Identity};
use crate::constants::SESSION_TOKEN_TTL_DAYS;
use crate::core::{MessageId, RoomId, UserId};
use crate::error::{RelayError, Result};

/// Presence transitions kept for inspection, oldest dropped first
const PRESENCE_LOG_CAPACITY: usize = 1024;

/// Room history row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRoomMessage {
    pub id: MessageId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub kind: RoomMessageKind,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Direct message row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDirectMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredRoom {
    name: String,
    members: HashSet<UserId>,
}

#[derive(Debug, Clone)]
struct SessionRecord {
    identity: Identity,
    expires_at: DateTime<Utc>,
}

pub struct MemoryStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    rooms: RwLock<HashMap<RoomId, StoredRoom>>,
    room_messages: RwLock<Vec<StoredRoomMessage>>,
    direct_messages: RwLock<Vec<StoredDirectMessage>>,
    presence: RwLock<HashMap<UserId, Presence>>,
    presence_log: RwLock<VecDeque<(UserId, Presence)>>,
    /// Accounts seen through tokens, room membership or presence
    users: RwLock<HashSet<UserId>>,
    next_id: AtomicU64,
    /// Every room id is joinable by every user
    open_rooms: bool,
    offline: AtomicBool,
    failing_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            room_messages: RwLock::new(Vec::new()),
            direct_messages: RwLock::new(Vec::new()),
            presence: RwLock::new(HashMap::new()),
            presence_log: RwLock::new(VecDeque::new()),
            users: RwLock::new(HashSet::new()),
            next_id: AtomicU64::new(1),
            open_rooms: false,
            offline: AtomicBool::new(false),
            failing_writes: AtomicBool::new(false),
        }
    }

    /// A store where membership checks always pass
    pub fn with_open_rooms() -> Self {
        Self {
            open_rooms: true,
            ..Self::new()
        }
    }

    fn generate_id(&self) -> MessageId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(RelayError::ServiceUnavailable(
                "memory store is offline".to_string(),
            ));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_online()?;
        if self.failing_writes.load(Ordering::Relaxed) {
            return Err(RelayError::StorageError("write rejected".to_string()));
        }
        Ok(())
    }

    /// Simulate the whole backend being unreachable
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    /// Simulate message writes failing while reads keep working
    pub fn set_failing_writes(&self, failing: bool) {
        self.failing_writes.store(failing, Ordering::Relaxed);
    }

    /// Mint an opaque session token for a user
    pub async fn issue_token(&self, identity: Identity) -> String {
        self.issue_token_with_ttl(identity, Duration::days(SESSION_TOKEN_TTL_DAYS))
            .await
    }

    pub async fn issue_token_with_ttl(&self, identity: Identity, ttl: Duration) -> String {
        self.register_user(identity.user_id).await;
        let token = Uuid::new_v4().simple().to_string();
        self.sessions.write().await.insert(
            token.clone(),
            SessionRecord {
                identity,
                expires_at: Utc::now() + ttl,
            },
        );
        token
    }

    pub async fn revoke_token(&self, token: &str) -> bool {
        self.sessions.write().await.remove(token).is_some()
    }

    /// Record an account so it can receive direct messages
    pub async fn register_user(&self, user_id: UserId) {
        self.users.write().await.insert(user_id);
    }

    /// Register a room and its display name
    pub async fn create_room(&self, room_id: RoomId, name: impl Into<String>) {
        self.rooms.write().await.insert(
            room_id,
            StoredRoom {
                name: name.into(),
                members: HashSet::new(),
            },
        );
    }

    pub async fn add_member(&self, room_id: RoomId, user_id: UserId) -> Result<()> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .get_mut(&room_id)
            .ok_or(RelayError::RoomNotFound(room_id))?;
        room.members.insert(user_id);
        drop(rooms);

        self.register_user(user_id).await;
        Ok(())
    }

    /// History of a room, oldest first
    pub async fn room_messages(&self, room_id: RoomId) -> Vec<StoredRoomMessage> {
        self.room_messages
            .read()
            .await
            .iter()
            .filter(|msg| msg.room_id == room_id)
            .cloned()
            .collect()
    }

    pub async fn direct_messages(&self) -> Vec<StoredDirectMessage> {
        self.direct_messages.read().await.clone()
    }

    pub async fn presence(&self, user_id: UserId) -> Option<Presence> {
        self.presence.read().await.get(&user_id).copied()
    }

    /// Recent presence transitions recorded for a user, in order
    pub async fn presence_log(&self, user_id: UserId) -> Vec<Presence> {
        self.presence_log
            .read()
            .await
            .iter()
            .filter(|(id, _)| *id == user_id)
            .map(|(_, presence)| *presence)
            .collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthValidator for MemoryStore {
    async fn validate_token(&self, token: &str) -> Result<Identity> {
        self.ensure_online()?;

        let sessions = self.sessions.read().await;
        let record = sessions
            .get(token)
            .ok_or_else(|| RelayError::AuthError("Unknown session token".to_string()))?;

        if record.expires_at <= Utc::now() {
            return Err(RelayError::AuthError("Session expired".to_string()));
        }

        Ok(record.identity.clone())
    }

    fn provider_name(&self) -> &'static str {
        "memory-session"
    }
}

#[async_trait]
impl MembershipOracle for MemoryStore {
    async fn is_room_member(&self, user_id: UserId, room_id: RoomId) -> Result<bool> {
        self.ensure_online()?;
        if self.open_rooms {
            return Ok(true);
        }

        let rooms = self.rooms.read().await;
        Ok(rooms
            .get(&room_id)
            .map(|room| room.members.contains(&user_id))
            .unwrap_or(false))
    }

    async fn room_display_name(&self, room_id: RoomId) -> Result<String> {
        self.ensure_online()?;

        match self.rooms.read().await.get(&room_id) {
            Some(room) => Ok(room.name.clone()),
            None if self.open_rooms => Ok(format!("Room {}", room_id)),
            None => Err(RelayError::RoomNotFound(room_id)),
        }
    }

    async fn user_exists(&self, user_id: UserId) -> Result<bool> {
        self.ensure_online()?;
        Ok(self.users.read().await.contains(&user_id))
    }
}

#[async_trait]
impl PersistenceAdapter for MemoryStore {
    async fn persist_room_message(
        &self,
        room_id: RoomId,
        user_id: UserId,
        kind: RoomMessageKind,
        content: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<MessageId> {
        self.ensure_writable()?;

        let id = self.generate_id();
        self.room_messages.write().await.push(StoredRoomMessage {
            id,
            room_id,
            user_id,
            kind,
            content: content.to_string(),
            metadata,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn persist_direct_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: &str,
    ) -> Result<MessageId> {
        self.ensure_writable()?;

        let id = self.generate_id();
        self.direct_messages.write().await.push(StoredDirectMessage {
            id,
            sender_id,
            receiver_id,
            content: content.to_string(),
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn set_presence(&self, user_id: UserId, presence: Presence) -> Result<()> {
        self.ensure_online()?;

        self.presence.write().await.insert(user_id, presence);
        self.register_user(user_id).await;

        let mut log = self.presence_log.write().await;
        if log.len() == PRESENCE_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back((user_id, presence));
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        self.ensure_online()
    }
}
