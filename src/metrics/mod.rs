//! Relay counters
//!
//! Lock-free counters bumped on the hot path and exported as a JSON
//! snapshot on the `/metrics` route.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::connection::SendOutcome;

/// Point-in-time view of the counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub auth_failures: u64,
    pub sessions_superseded: u64,
    pub frames_received: u64,
    pub protocol_errors: u64,
    pub room_messages: u64,
    pub direct_messages: u64,
    pub deliveries: u64,
    pub dropped_sends: u64,
    pub slow_consumer_disconnects: u64,
    pub persistence_failures: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct RelayMetrics {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    auth_failures: AtomicU64,
    sessions_superseded: AtomicU64,
    frames_received: AtomicU64,
    protocol_errors: AtomicU64,
    room_messages: AtomicU64,
    direct_messages: AtomicU64,
    deliveries: AtomicU64,
    dropped_sends: AtomicU64,
    slow_consumer_disconnects: AtomicU64,
    persistence_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        bump(&self.connections_opened);
    }

    pub fn connection_closed(&self) {
        bump(&self.connections_closed);
    }

    pub fn auth_failed(&self) {
        bump(&self.auth_failures);
    }

    pub fn session_superseded(&self) {
        bump(&self.sessions_superseded);
    }

    pub fn frame_received(&self) {
        bump(&self.frames_received);
    }

    pub fn protocol_error(&self) {
        bump(&self.protocol_errors);
    }

    pub fn room_message(&self) {
        bump(&self.room_messages);
    }

    pub fn direct_message(&self) {
        bump(&self.direct_messages);
    }

    pub fn persistence_failed(&self) {
        bump(&self.persistence_failures);
    }

    /// Account for the outcome of one outbound send
    pub fn record_send(&self, outcome: SendOutcome) {
        match outcome {
            SendOutcome::Queued => bump(&self.deliveries),
            SendOutcome::Dropped => bump(&self.dropped_sends),
            SendOutcome::Disconnected => {
                bump(&self.dropped_sends);
                bump(&self.slow_consumer_disconnects);
            }
            SendOutcome::Closed => {}
        }
    }

    pub fn active_connections(&self) -> u64 {
        let opened = self.connections_opened.load(Ordering::Relaxed);
        let closed = self.connections_closed.load(Ordering::Relaxed);
        opened.saturating_sub(closed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            connections_opened: load(&self.connections_opened),
            connections_closed: load(&self.connections_closed),
            auth_failures: load(&self.auth_failures),
            sessions_superseded: load(&self.sessions_superseded),
            frames_received: load(&self.frames_received),
            protocol_errors: load(&self.protocol_errors),
            room_messages: load(&self.room_messages),
            direct_messages: load(&self.direct_messages),
            deliveries: load(&self.deliveries),
            dropped_sends: load(&self.dropped_sends),
            slow_consumer_disconnects: load(&self.slow_consumer_disconnects),
            persistence_failures: load(&self.persistence_failures),
            timestamp: Utc::now(),
        }
    }
}

pub type SharedMetrics = Arc<RelayMetrics>;
