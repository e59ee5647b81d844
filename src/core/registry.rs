//! User-to-connection registry
//!
//! Tracks the live connections of every authenticated user. Used for direct
//! message delivery and to enforce one active session per user. Independent
//! of room membership.

use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::connection::Connection;
use crate::core::UserId;
use crate::error::{RelayError, Result};

/// Outcome of registering a connection
#[derive(Debug)]
pub struct Registration {
    /// Older connections of the same user, removed from the registry.
    /// The caller notifies and closes them.
    pub displaced: Vec<Arc<Connection>>,
    /// The user had no live connection before this one
    pub came_online: bool,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    users: RwLock<HashMap<UserId, HashMap<String, Arc<Connection>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated connection, displacing the user's previous ones.
    ///
    /// A connection already closed by `disconnect` is refused. The check runs
    /// under the write lock, so a close racing with this call either sees the
    /// entry and removes it or makes this call fail.
    pub async fn register(&self, conn: &Arc<Connection>) -> Result<Registration> {
        let identity = conn.identity().ok_or(RelayError::NotAuthenticated)?;

        let mut users = self.users.write().await;
        if conn.is_closed() {
            debug!("Refusing to register closed connection {}", conn.id);
            return Err(RelayError::ConnectionClosed);
        }
        let previous = users.insert(
            identity.user_id,
            HashMap::from([(conn.id.clone(), Arc::clone(conn))]),
        );

        let displaced: Vec<Arc<Connection>> = previous
            .map(|set| {
                set.into_values()
                    .filter(|other| other.id != conn.id)
                    .collect()
            })
            .unwrap_or_default();

        if !displaced.is_empty() {
            info!(
                "User {} opened a new session, displacing {} connection(s)",
                identity.user_id,
                displaced.len()
            );
        }

        Ok(Registration {
            came_online: displaced.is_empty(),
            displaced,
        })
    }

    /// Remove a connection. Returns true only for the call that removed the
    /// user's last live connection.
    pub async fn unregister(&self, conn: &Connection) -> bool {
        let Some(identity) = conn.identity() else {
            return false;
        };

        let mut users = self.users.write().await;
        let Some(set) = users.get_mut(&identity.user_id) else {
            return false;
        };

        if set.remove(&conn.id).is_none() {
            debug!("Connection {} was already unregistered", conn.id);
            return false;
        }

        if set.is_empty() {
            users.remove(&identity.user_id);
            true
        } else {
            false
        }
    }

    /// Snapshot of a user's live connections
    pub async fn connections_for(&self, user_id: UserId) -> Vec<Arc<Connection>> {
        self.users
            .read()
            .await
            .get(&user_id)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.users.read().await.contains_key(&user_id)
    }

    pub async fn is_registered(&self, conn: &Connection) -> bool {
        let Some(identity) = conn.identity() else {
            return false;
        };
        self.users
            .read()
            .await
            .get(&identity.user_id)
            .map(|set| set.contains_key(&conn.id))
            .unwrap_or(false)
    }

    pub async fn connection_count(&self) -> usize {
        self.users.read().await.values().map(HashMap::len).sum()
    }
}
