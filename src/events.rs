//! Coordination Events
//!
//! One broadcast channel per event category. Emitting never waits for
//! subscribers; a lagging subscriber loses the oldest events.

use serde::Serialize;
use tokio::sync::broadcast;

/// Capacity of each category channel
const CHANNEL_CAPACITY: usize = 256;

/// Election progress
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElectionEvent {
    ElectionStarted { node_id: String, election_id: u64 },
    CoordinatorElected { coordinator: String, election_id: u64 },
    CoordinatorAnnounced {
        coordinator: String,
        delivered: usize,
        failed: usize,
    },
}

/// Resource lock activity
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LockEvent {
    Acquired { resource_id: String, holder: String },
    Released { resource_id: String, holder: String },
    ForceReleased {
        resource_id: String,
        holder: String,
        held_for_ms: u64,
    },
    RequestTimedOut { resource_id: String, requester: String },
}

/// Replication progress
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplicationEvent {
    UpdateInitiated { update_id: String, resource_id: String },
    PeerAcknowledged {
        update_id: String,
        peer_id: String,
        acks: usize,
    },
    UpdateCompleted {
        update_id: String,
        resource_id: String,
        acks: Vec<String>,
    },
    UpdateCollected { update_id: String },
    DivergenceDetected {
        resource_id: String,
        replicas: Vec<String>,
    },
}

/// Clock synchronization activity
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    RoundCompleted {
        mean: f64,
        adjustments: Vec<(String, i64)>,
    },
    Adjusted { delta: i64, logical_time: i64 },
    Aligned { delta: i64, logical_time: i64 },
    CoordinatorTime {
        coordinator_id: String,
        coordinator_time: i64,
    },
}

/// Fan-out point for every event category
#[derive(Debug, Clone)]
pub struct EventBus {
    election: broadcast::Sender<ElectionEvent>,
    lock: broadcast::Sender<LockEvent>,
    replication: broadcast::Sender<ReplicationEvent>,
    sync: broadcast::Sender<SyncEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (election, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (lock, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (replication, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (sync, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            election,
            lock,
            replication,
            sync,
        }
    }

    // Send errors only mean nobody is subscribed right now.
    pub fn election(&self, event: ElectionEvent) {
        let _ = self.election.send(event);
    }

    pub fn lock(&self, event: LockEvent) {
        let _ = self.lock.send(event);
    }

    pub fn replication(&self, event: ReplicationEvent) {
        let _ = self.replication.send(event);
    }

    pub fn sync(&self, event: SyncEvent) {
        let _ = self.sync.send(event);
    }

    pub fn subscribe_election(&self) -> broadcast::Receiver<ElectionEvent> {
        self.election.subscribe()
    }

    pub fn subscribe_lock(&self) -> broadcast::Receiver<LockEvent> {
        self.lock.subscribe()
    }

    pub fn subscribe_replication(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.replication.subscribe()
    }

    pub fn subscribe_sync(&self) -> broadcast::Receiver<SyncEvent> {
        self.sync.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.lock(LockEvent::Released {
            resource_id: "r".into(),
            holder: "a".into(),
        });
    }

    #[tokio::test]
    async fn test_categories_are_independent() {
        let bus = EventBus::new();
        let mut election_rx = bus.subscribe_election();
        let mut sync_rx = bus.subscribe_sync();

        bus.election(ElectionEvent::ElectionStarted {
            node_id: "node-1".into(),
            election_id: 1,
        });

        assert_eq!(
            election_rx.recv().await.unwrap(),
            ElectionEvent::ElectionStarted {
                node_id: "node-1".into(),
                election_id: 1
            }
        );
        assert!(sync_rx.try_recv().is_err());
    }
}
