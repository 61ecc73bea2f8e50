//! Replication Coordinator
//!
//! Fans local writes out to every known peer and tracks acknowledgments
//! toward a quorum. The write path never waits for this: callers see the
//! write accepted before any peer has acknowledged it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::replica::{ConsistencyReport, ReplicaHealth, ReplicaSet, ReplicaSummary};
use crate::config::WolfCoordConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, ReplicationEvent};
use crate::state::{ClusterMembership, NodeState};
use crate::time::WallClock;
use crate::transport::{PeerTransport, ReplicateRequest};

/// Replication settings
#[derive(Debug, Clone)]
pub struct ReplicationSettings {
    /// Number of local replica slots; also sets the quorum
    pub replication_factor: usize,
    /// Delay between attempts to an unresponsive peer
    pub retry_backoff: Duration,
    /// How long a completed update stays tracked
    pub gc_grace: Duration,
    /// Timeout for a single replicate call
    pub rpc_timeout: Duration,
}

impl ReplicationSettings {
    /// Acknowledgments needed to complete an update
    pub fn quorum(&self) -> usize {
        self.replication_factor.div_ceil(2)
    }
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            retry_backoff: Duration::from_millis(2000),
            gc_grace: Duration::from_millis(30000),
            rpc_timeout: Duration::from_millis(3000),
        }
    }
}

impl From<&WolfCoordConfig> for ReplicationSettings {
    fn from(config: &WolfCoordConfig) -> Self {
        Self {
            replication_factor: config.replication.replication_factor,
            retry_backoff: config.retry_backoff(),
            gc_grace: config.gc_grace(),
            rpc_timeout: config.rpc_timeout(),
        }
    }
}

/// Progress of a replicated update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpdateStatus {
    Pending,
    Completed,
}

/// A write being propagated to peers
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationUpdate {
    pub id: String,
    pub resource_id: String,
    pub payload: Value,
    pub origin: String,
    /// Wall-clock milliseconds at the origin
    pub created_at: i64,
    pub status: UpdateStatus,
    /// Distinct peers that acknowledged the update
    pub acks: HashSet<String>,
}

/// Replication status for display
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationStatus {
    pub node_id: String,
    pub replication_factor: usize,
    pub quorum: usize,
    pub replicas: Vec<ReplicaSummary>,
    pub pending_updates: usize,
    pub tracked_updates: usize,
    pub completed_total: u64,
}

/// Replication coordinator for this node
pub struct ReplicationCoordinator {
    node_id: String,
    settings: ReplicationSettings,
    cluster: Arc<ClusterMembership>,
    transport: Arc<dyn PeerTransport>,
    clock: Arc<dyn WallClock>,
    events: EventBus,
    /// Tracked updates by ID
    updates: RwLock<HashMap<String, ReplicationUpdate>>,
    /// Local replica slots
    replicas: RwLock<ReplicaSet>,
    completed_total: AtomicU64,
    /// Stops retry and collection tasks
    shutdown: CancellationToken,
}

impl ReplicationCoordinator {
    /// Create a new replication coordinator
    pub fn new(
        cluster: Arc<ClusterMembership>,
        transport: Arc<dyn PeerTransport>,
        clock: Arc<dyn WallClock>,
        settings: ReplicationSettings,
        events: EventBus,
        shutdown: CancellationToken,
    ) -> Self {
        tracing::info!(
            "Initialized {} replica slots (quorum {})",
            settings.replication_factor,
            settings.quorum()
        );
        Self {
            node_id: cluster.node_id().to_string(),
            replicas: RwLock::new(ReplicaSet::new(settings.replication_factor)),
            settings,
            cluster,
            transport,
            clock,
            events,
            updates: RwLock::new(HashMap::new()),
            completed_total: AtomicU64::new(0),
            shutdown,
        }
    }

    /// Apply a write to the local replica slots and start shipping it to
    /// every known peer. Returns the update ID without waiting for acks.
    pub async fn replicate(self: &Arc<Self>, resource_id: &str, payload: Value) -> Result<String> {
        let Value::Object(fields) = &payload else {
            return Err(Error::InvalidPayload("payload must be a JSON object".into()));
        };

        let update = ReplicationUpdate {
            id: Uuid::new_v4().to_string(),
            resource_id: resource_id.to_string(),
            payload: payload.clone(),
            origin: self.node_id.clone(),
            created_at: self.clock.now_millis(),
            status: UpdateStatus::Pending,
            acks: HashSet::new(),
        };

        let applied = self
            .replicas
            .write()
            .await
            .apply(resource_id, fields, update.created_at);
        self.updates
            .write()
            .await
            .insert(update.id.clone(), update.clone());

        tracing::info!(
            "Replicating update {} for {} ({} local replicas)",
            update.id,
            resource_id,
            applied
        );
        self.events.replication(ReplicationEvent::UpdateInitiated {
            update_id: update.id.clone(),
            resource_id: resource_id.to_string(),
        });

        let request = ReplicateRequest {
            update_id: update.id.clone(),
            resource_id: update.resource_id,
            payload: update.payload,
            timestamp: update.created_at,
            origin: update.origin,
        };
        for peer in self.cluster.peers().await {
            let coordinator = Arc::clone(self);
            let request = request.clone();
            tokio::spawn(async move { coordinator.deliver(peer, request).await });
        }

        Ok(update.id)
    }

    /// Keep sending `request` to `peer` until it acknowledges, the update
    /// is collected, or the node shuts down
    async fn deliver(self: Arc<Self>, peer: NodeState, request: ReplicateRequest) {
        loop {
            if !self.updates.read().await.contains_key(&request.update_id) {
                return;
            }

            match self
                .transport
                .replicate_update(&peer, &request, self.settings.rpc_timeout)
                .await
            {
                Ok(response) if response.ok => {
                    self.cluster.record_seen(&peer.id).await;
                    self.record_ack(&request.update_id, &peer.id).await;
                    return;
                }
                Ok(response) => {
                    tracing::warn!(
                        "Peer {} rejected update {}: {}",
                        peer.id,
                        request.update_id,
                        response.error.unwrap_or_default()
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "Replication of {} to {} failed: {}",
                        request.update_id,
                        peer.id,
                        e
                    );
                    if e.is_transient() {
                        self.cluster.mark_unreachable(&peer.id).await;
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.settings.retry_backoff) => {}
            }
        }
    }

    /// Record `peer_id`'s acknowledgment of an update. Returns true only
    /// for the ack that brings the update to quorum.
    pub async fn record_ack(self: &Arc<Self>, update_id: &str, peer_id: &str) -> bool {
        let quorum = self.settings.quorum();
        let completed = {
            let mut updates = self.updates.write().await;
            let Some(update) = updates.get_mut(update_id) else {
                tracing::debug!("Ack from {} for untracked update {}", peer_id, update_id);
                return false;
            };

            if !update.acks.insert(peer_id.to_string()) {
                tracing::debug!("Duplicate ack from {} for {}", peer_id, update_id);
                return false;
            }
            self.events.replication(ReplicationEvent::PeerAcknowledged {
                update_id: update_id.to_string(),
                peer_id: peer_id.to_string(),
                acks: update.acks.len(),
            });

            if update.status != UpdateStatus::Pending || update.acks.len() < quorum {
                return false;
            }
            update.status = UpdateStatus::Completed;

            let mut acks: Vec<String> = update.acks.iter().cloned().collect();
            acks.sort();
            (update.resource_id.clone(), acks)
        };

        let (resource_id, acks) = completed;
        tracing::info!(
            "Replication completed for update {} ({}/{} acks)",
            update_id,
            acks.len(),
            quorum
        );
        self.completed_total.fetch_add(1, Ordering::Relaxed);
        self.events.replication(ReplicationEvent::UpdateCompleted {
            update_id: update_id.to_string(),
            resource_id,
            acks,
        });

        let coordinator = Arc::clone(self);
        let update_id = update_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = coordinator.shutdown.cancelled() => {}
                _ = tokio::time::sleep(coordinator.settings.gc_grace) => {
                    coordinator.collect(&update_id).await;
                }
            }
        });
        true
    }

    async fn collect(&self, update_id: &str) {
        if self.updates.write().await.remove(update_id).is_some() {
            tracing::debug!("Cleaned up completed update {}", update_id);
            self.events.replication(ReplicationEvent::UpdateCollected {
                update_id: update_id.to_string(),
            });
        }
    }

    /// Get a tracked update
    pub async fn get_update(&self, update_id: &str) -> Option<ReplicationUpdate> {
        self.updates.read().await.get(update_id).cloned()
    }

    /// Updates still short of quorum. These are never collected.
    pub async fn pending_count(&self) -> usize {
        self.updates
            .read()
            .await
            .values()
            .filter(|u| u.status == UpdateStatus::Pending)
            .count()
    }

    /// Compare the local replicas' copies of a resource. Divergence is
    /// reported and logged, never repaired.
    pub async fn check_consistency(&self, resource_id: &str) -> ConsistencyReport {
        let report = self.replicas.read().await.check(resource_id);
        if let Err(e) = report.clone().into_result() {
            tracing::warn!("{}", e);
            self.events.replication(ReplicationEvent::DivergenceDetected {
                resource_id: resource_id.to_string(),
                replicas: report.divergent.clone(),
            });
        }
        report
    }

    /// Check every resource held by any replica; returns the divergent ones
    pub async fn perform_consistency_check(&self) -> Vec<ConsistencyReport> {
        tracing::info!("Performing consistency check across all replicas");
        let resources = self.replicas.read().await.resources();

        let mut divergent = Vec::new();
        for resource_id in resources {
            let report = self.check_consistency(&resource_id).await;
            if !report.consistent {
                divergent.push(report);
            }
        }
        divergent
    }

    /// Stop applying writes to a replica slot
    pub async fn fail_replica(&self, replica_id: &str) -> Result<()> {
        self.replicas
            .write()
            .await
            .set_health(replica_id, ReplicaHealth::Failed)?;
        tracing::warn!("Replica {} failed", replica_id);
        Ok(())
    }

    /// Bring a replica slot back and check every resource
    pub async fn recover_replica(&self, replica_id: &str) -> Result<Vec<ConsistencyReport>> {
        self.replicas
            .write()
            .await
            .set_health(replica_id, ReplicaHealth::Active)?;
        tracing::info!("Replica {} recovered", replica_id);
        Ok(self.perform_consistency_check().await)
    }

    /// Get replication status
    pub async fn status(&self) -> ReplicationStatus {
        let updates = self.updates.read().await;
        ReplicationStatus {
            node_id: self.node_id.clone(),
            replication_factor: self.settings.replication_factor,
            quorum: self.settings.quorum(),
            replicas: self.replicas.read().await.summaries(),
            pending_updates: updates
                .values()
                .filter(|u| u.status == UpdateStatus::Pending)
                .count(),
            tracked_updates: updates.len(),
            completed_total: self.completed_total.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::time::ManualClock;
    use crate::transport::memory::{LinkState, MemoryNetwork, StubPeer};

    fn settings() -> ReplicationSettings {
        ReplicationSettings {
            replication_factor: 3,
            retry_backoff: Duration::from_millis(2000),
            gc_grace: Duration::from_millis(30000),
            rpc_timeout: Duration::from_millis(500),
        }
    }

    async fn coordinator(
        network: &Arc<MemoryNetwork>,
        peers: &[&str],
    ) -> (Arc<ReplicationCoordinator>, CancellationToken) {
        let cluster = ClusterMembership::new("origin".into(), "origin:7000".into(), 1);
        for peer in peers {
            cluster
                .add_peer(peer.to_string(), format!("{}:7000", peer), 1)
                .await
                .unwrap();
            network.register(peer, StubPeer::new(peer)).await;
        }
        let shutdown = CancellationToken::new();
        let coordinator = Arc::new(ReplicationCoordinator::new(
            Arc::new(cluster),
            network.transport(),
            Arc::new(ManualClock::new(1_700_000_000_000)),
            settings(),
            EventBus::new(),
            shutdown.clone(),
        ));
        (coordinator, shutdown)
    }

    #[tokio::test(start_paused = true)]
    async fn test_quorum_reached_on_second_distinct_ack() {
        let network = MemoryNetwork::new();
        let (replication, _shutdown) = coordinator(&network, &[]).await;
        let mut events = replication.events.subscribe_replication();

        let id = replication.replicate("p1", json!({"a": 1})).await.unwrap();
        assert_eq!(replication.pending_count().await, 1);

        assert!(!replication.record_ack(&id, "n2").await);
        assert_eq!(replication.get_update(&id).await.unwrap().status, UpdateStatus::Pending);

        // A repeated ack does not count twice
        assert!(!replication.record_ack(&id, "n2").await);
        let update = replication.get_update(&id).await.unwrap();
        assert_eq!(update.acks.len(), 1);
        assert_eq!(update.status, UpdateStatus::Pending);

        assert!(replication.record_ack(&id, "n3").await);
        assert_eq!(replication.get_update(&id).await.unwrap().status, UpdateStatus::Completed);

        assert!(!replication.record_ack(&id, "n4").await);
        assert_eq!(replication.get_update(&id).await.unwrap().acks.len(), 3);

        let mut completions = 0;
        while let Ok(event) = events.try_recv() {
            if let ReplicationEvent::UpdateCompleted { acks, .. } = event {
                assert_eq!(acks, vec!["n2".to_string(), "n3".to_string()]);
                completions += 1;
            }
        }
        assert_eq!(completions, 1);
        assert_eq!(replication.status().await.completed_total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_completes_and_collects() {
        let network = MemoryNetwork::new();
        let (replication, _shutdown) = coordinator(&network, &["n2", "n3"]).await;
        let mut events = replication.events.subscribe_replication();

        let id = replication.replicate("p1", json!({"a": 1})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let update = replication.get_update(&id).await.unwrap();
        assert_eq!(update.status, UpdateStatus::Completed);
        assert_eq!(update.origin, "origin");
        assert_eq!(replication.pending_count().await, 0);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(replication.get_update(&id).await.is_none());
        assert_eq!(replication.status().await.tracked_updates, 0);

        let mut collected = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ReplicationEvent::UpdateCollected { .. }) {
                collected = true;
            }
        }
        assert!(collected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_peer_retried_after_backoff() {
        let network = MemoryNetwork::new();
        let (replication, _shutdown) = coordinator(&network, &["n2", "n3"]).await;
        network.set_link("n2", LinkState::Down).await;

        let id = replication.replicate("p1", json!({"a": 1})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let update = replication.get_update(&id).await.unwrap();
        assert_eq!(update.status, UpdateStatus::Pending);
        assert!(update.acks.contains("n3"));

        network.set_link("n2", LinkState::Up).await;
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let update = replication.get_update(&id).await.unwrap();
        assert_eq!(update.status, UpdateStatus::Completed);
        assert_eq!(network.calls_to("n2", "replicate").await, 2);
        assert_eq!(network.calls_to("n3", "replicate").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_without_quorum_is_never_collected() {
        let network = MemoryNetwork::new();
        let (replication, shutdown) = coordinator(&network, &["n2", "n3"]).await;
        network.set_link("n2", LinkState::Down).await;
        network.set_link("n3", LinkState::Down).await;

        let id = replication.replicate("p1", json!({"a": 1})).await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(replication.pending_count().await, 1);
        assert!(replication.get_update(&id).await.is_some());

        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let attempts = network.calls("replicate").await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(network.calls("replicate").await, attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replica_failure_and_recovery() {
        let network = MemoryNetwork::new();
        let (replication, _shutdown) = coordinator(&network, &[]).await;
        let mut events = replication.events.subscribe_replication();

        replication.replicate("p1", json!({"a": 1})).await.unwrap();
        replication.fail_replica("replica-1").await.unwrap();
        replication.replicate("p1", json!({"b": 2})).await.unwrap();

        let report = replication.check_consistency("p1").await;
        assert!(!report.consistent);
        assert_eq!(report.divergent, vec!["replica-1".to_string()]);

        let divergent = replication.recover_replica("replica-1").await.unwrap();
        assert_eq!(divergent.len(), 1);
        assert_eq!(divergent[0].resource_id, "p1");

        let status = replication.status().await;
        assert!(status
            .replicas
            .iter()
            .all(|r| r.health == ReplicaHealth::Active));

        let mut detected = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ReplicationEvent::DivergenceDetected { .. }) {
                detected += 1;
            }
        }
        assert_eq!(detected, 2);
        assert!(matches!(
            replication.fail_replica("replica-7").await,
            Err(Error::ReplicaNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_object_payload_rejected() {
        let network = MemoryNetwork::new();
        let (replication, _shutdown) = coordinator(&network, &[]).await;

        let err = replication.replicate("p1", json!([1, 2])).await.unwrap_err();
        assert!(matches!(err, Error::InvalidPayload(_)));
        assert_eq!(replication.status().await.tracked_updates, 0);
    }
}
