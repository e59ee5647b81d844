//! Presence synchronization
//!
//! Presence is derived from the registry: a user is online while they hold
//! at least one registered connection. Writes for the same user are
//! serialized through a per-user gate and always record the registry's
//! current answer, so a racing connect and disconnect cannot leave the
//! stored flag inverted. A write identical to the last successful one for
//! that user is skipped; users start out offline.

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::core::registry::ConnectionRegistry;
use crate::core::UserId;
use crate::metrics::SharedMetrics;
use crate::storage::traits::{PersistenceAdapter, Presence};

type Gate = Arc<tokio::sync::Mutex<Presence>>;

pub struct PresenceTracker {
    persistence: Arc<dyn PersistenceAdapter>,
    registry: Arc<ConnectionRegistry>,
    metrics: SharedMetrics,
    gates: Mutex<HashMap<UserId, Gate>>,
}

impl PresenceTracker {
    pub fn new(
        persistence: Arc<dyn PersistenceAdapter>,
        registry: Arc<ConnectionRegistry>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            persistence,
            registry,
            metrics,
            gates: Mutex::new(HashMap::new()),
        }
    }

    fn gate(&self, user_id: UserId) -> Gate {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            gates
                .entry(user_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(Presence::Offline))),
        )
    }

    /// Drop the gate once the user is offline and nobody else is waiting on it
    fn release_gate(&self, user_id: UserId, gate: Gate) {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        drop(gate);
        if let Some(existing) = gates.get(&user_id) {
            if Arc::strong_count(existing) == 1 {
                gates.remove(&user_id);
            }
        }
    }

    /// Record the user's current presence. Storage failures are logged, never raised.
    pub async fn sync(&self, user_id: UserId) {
        let gate = self.gate(user_id);
        let settled_offline = {
            let mut last_written = gate.lock().await;

            let presence = if self.registry.is_online(user_id).await {
                Presence::Online
            } else {
                Presence::Offline
            };

            if *last_written != presence {
                match self.persistence.set_presence(user_id, presence).await {
                    Ok(()) => {
                        debug!("Presence of user {} set to {:?}", user_id, presence);
                        *last_written = presence;
                    }
                    Err(e) => {
                        self.metrics.persistence_failed();
                        warn!("Failed to record presence for user {}: {}", user_id, e);
                    }
                }
            }

            *last_written == Presence::Offline
        };

        if settled_offline {
            self.release_gate(user_id, gate);
        }
    }

    /// Number of users with a presence gate held, for diagnostics
    pub fn tracked_users(&self) -> usize {
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
