//! Point-to-point delivery between users

use chrono::Utc;
use log::{debug, warn};
use std::sync::Arc;

use crate::config::StorageFailurePolicy;
use crate::core::connection::Connection;
use crate::core::message_types::ServerMessage;
use crate::core::registry::ConnectionRegistry;
use crate::core::UserId;
use crate::error::{RelayError, Result};
use crate::metrics::SharedMetrics;
use crate::storage::traits::{MembershipOracle, PersistenceAdapter};

pub struct DirectMessenger {
    registry: Arc<ConnectionRegistry>,
    directory: Arc<dyn MembershipOracle>,
    persistence: Arc<dyn PersistenceAdapter>,
    persistence_policy: StorageFailurePolicy,
    metrics: SharedMetrics,
}

impl DirectMessenger {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        directory: Arc<dyn MembershipOracle>,
        persistence: Arc<dyn PersistenceAdapter>,
        persistence_policy: StorageFailurePolicy,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            registry,
            directory,
            persistence,
            persistence_policy,
            metrics,
        }
    }

    /// Persist a direct message, deliver it to every live connection of the
    /// receiver and echo it to the sender.
    ///
    /// An offline receiver is not an error: the message is stored and the
    /// sender still gets the echo. An unknown receiver is rejected before
    /// anything is stored. Returns the number of receiver connections
    /// the message was queued on.
    pub async fn send(&self, from: &Arc<Connection>, receiver_id: UserId, text: &str) -> Result<usize> {
        let sender = from.identity().ok_or(RelayError::NotAuthenticated)?;
        if sender.user_id == receiver_id {
            return Err(RelayError::SelfMessage);
        }
        if !self.directory.user_exists(receiver_id).await? {
            debug!("User {} sent a direct message to unknown user {}", sender.user_id, receiver_id);
            return Err(RelayError::ReceiverNotFound(receiver_id));
        }

        let message_id = match self
            .persistence
            .persist_direct_message(sender.user_id, receiver_id, text)
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                self.metrics.persistence_failed();
                match self.persistence_policy {
                    StorageFailurePolicy::Reject => {
                        warn!(
                            "Direct message from {} to {} aborted, not persisted: {}",
                            sender.user_id, receiver_id, e
                        );
                        return Err(e);
                    }
                    StorageFailurePolicy::BestEffort => {
                        warn!(
                            "Direct message from {} to {} not persisted, delivering without id: {}",
                            sender.user_id, receiver_id, e
                        );
                        None
                    }
                }
            }
        };

        let payload = ServerMessage::DirectMessage {
            message_id,
            sender_id: sender.user_id,
            sender_name: sender.username,
            receiver_id,
            text: text.to_string(),
            timestamp: Utc::now(),
        };
        self.metrics.direct_message();

        let mut delivered = 0;
        for receiver in self.registry.connections_for(receiver_id).await {
            let outcome = receiver.send(&payload);
            self.metrics.record_send(outcome);
            if outcome.is_queued() {
                delivered += 1;
            }
        }

        if delivered == 0 {
            debug!("User {} is offline, direct message stored only", receiver_id);
        }

        self.metrics.record_send(from.send(&payload));
        Ok(delivered)
    }
}
