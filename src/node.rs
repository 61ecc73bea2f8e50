//! Cluster Node
//!
//! Wires membership, election, locking, replication and clock sync into a
//! single node, serves the peer protocol, and owns the periodic loops that
//! drive everything. Every loop stops when the node's shutdown token is
//! cancelled.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{PeerConfig, WolfCoordConfig};
use crate::error::{Error, Result};
use crate::events::{ElectionEvent, EventBus};
use crate::lock::{LockOutcome, LockStatus, ResourceLock};
use crate::replication::{ReplicationCoordinator, ReplicationSettings, ReplicationStatus};
use crate::state::{
    ClusterMembership, ClusterSummary, ElectionConfig, ElectionCoordinator, ElectionStatus,
    NodeState,
};
use crate::store::{InMemoryRecordStore, RecordStore};
use crate::time::{SystemClock, WallClock};
use crate::timesync::{ClockSettings, ClockStatus, ClockSync, SyncOutcome};
use crate::transport::{
    AckResponse, AnnounceRequest, ClockAdjustment, ClockReading, CoordinatorTime, HttpTransport,
    PeerService, PeerTransport, PingResponse, ReplicateRequest, ReplicateResponse,
    SolicitRequest,
};

/// Result of an accepted write
#[derive(Debug, Clone, Serialize)]
pub struct WriteOutcome {
    pub resource_id: String,
    pub record: Value,
    pub update_id: String,
}

/// Everything `GET /status` reports
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub node_id: String,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub cluster: ClusterSummary,
    pub election: ElectionStatus,
    pub locks: LockStatus,
    pub replication: ReplicationStatus,
    pub clock: ClockStatus,
}

/// A coordination node
pub struct ClusterNode {
    config: WolfCoordConfig,
    cluster: Arc<ClusterMembership>,
    election: Arc<ElectionCoordinator>,
    locks: Arc<ResourceLock>,
    replication: Arc<ReplicationCoordinator>,
    clock: Arc<ClockSync>,
    store: Arc<dyn RecordStore>,
    events: EventBus,
    shutdown: CancellationToken,
    started_at: DateTime<Utc>,
}

impl ClusterNode {
    /// Build a node from explicit collaborators
    pub async fn new(
        config: WolfCoordConfig,
        transport: Arc<dyn PeerTransport>,
        store: Arc<dyn RecordStore>,
        wall: Arc<dyn WallClock>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let cluster = Arc::new(ClusterMembership::new(
            config.node.id.clone(),
            config.advertise_address().to_string(),
            config.node.priority,
        ));
        for peer in &config.cluster.peers {
            cluster
                .add_peer(peer.id.clone(), peer.address.clone(), peer.priority)
                .await?;
        }
        tracing::info!("Cluster initialized with {} nodes", cluster.size().await);

        let events = EventBus::new();
        let shutdown = CancellationToken::new();

        let election = Arc::new(ElectionCoordinator::new(
            Arc::clone(&cluster),
            Arc::clone(&transport),
            ElectionConfig::from(&config),
            events.clone(),
        ));
        let locks = Arc::new(ResourceLock::new(events.clone()));
        let replication = Arc::new(ReplicationCoordinator::new(
            Arc::clone(&cluster),
            Arc::clone(&transport),
            Arc::clone(&wall),
            ReplicationSettings::from(&config),
            events.clone(),
            shutdown.child_token(),
        ));
        let clock = Arc::new(ClockSync::new(
            Arc::clone(&cluster),
            transport,
            wall,
            ClockSettings::from(&config),
            events.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            cluster,
            election,
            locks,
            replication,
            clock,
            store,
            events,
            shutdown,
            started_at: Utc::now(),
        }))
    }

    /// Build a node that talks HTTP to its peers and keeps records in memory
    pub async fn from_config(config: WolfCoordConfig) -> Result<Arc<Self>> {
        let transport = Arc::new(HttpTransport::new(config.rpc_timeout())?);
        Self::new(
            config,
            transport,
            Arc::new(InMemoryRecordStore::new()),
            Arc::new(SystemClock),
        )
        .await
    }

    pub fn node_id(&self) -> &str {
        &self.config.node.id
    }

    pub fn config(&self) -> &WolfCoordConfig {
        &self.config
    }

    pub fn cluster(&self) -> &Arc<ClusterMembership> {
        &self.cluster
    }

    pub fn election(&self) -> &Arc<ElectionCoordinator> {
        &self.election
    }

    pub fn locks(&self) -> &Arc<ResourceLock> {
        &self.locks
    }

    pub fn replication(&self) -> &Arc<ReplicationCoordinator> {
        &self.replication
    }

    pub fn clock(&self) -> &Arc<ClockSync> {
        &self.clock
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Write to a resource: lock, apply locally, replicate, unlock.
    ///
    /// Replication is started but not awaited; the write is accepted as
    /// soon as the local store has it.
    pub async fn write(&self, resource_id: &str, requester: &str, payload: Value) -> Result<WriteOutcome> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        let Value::Object(fields) = &payload else {
            return Err(Error::InvalidPayload("payload must be a JSON object".into()));
        };

        let outcome = self
            .locks
            .acquire(resource_id, requester, self.config.lock_request_timeout())
            .await;
        if outcome == LockOutcome::Denied {
            return Err(Error::ResourceConflict {
                resource_id: resource_id.to_string(),
                requester: requester.to_string(),
            });
        }

        let result = async {
            let record = self.store.apply(resource_id, fields).await?;
            let update_id = self.replication.replicate(resource_id, payload.clone()).await?;
            Ok::<_, Error>((record, update_id))
        }
        .await;

        if let Err(e) = self.locks.release(resource_id, requester).await {
            tracing::warn!("Failed to release {} after write: {}", resource_id, e);
        }

        let (record, update_id) = result?;
        Ok(WriteOutcome {
            resource_id: resource_id.to_string(),
            record,
            update_id,
        })
    }

    /// Add a peer at runtime
    pub async fn add_peer(&self, peer: PeerConfig) -> Result<()> {
        if peer.id.is_empty() || peer.address.is_empty() {
            return Err(Error::InvalidPayload("peer needs both id and address".into()));
        }
        self.cluster.add_peer(peer.id, peer.address, peer.priority).await
    }

    /// Remove a peer at runtime. Removing the coordinator starts an election.
    pub async fn remove_peer(&self, peer_id: &str) -> Result<NodeState> {
        let removed = self.cluster.remove_peer(peer_id).await?;
        if self.election.current_coordinator().await.as_deref() == Some(peer_id) {
            tracing::info!("Removed peer {} was the coordinator", peer_id);
            self.trigger_election();
        }
        Ok(removed)
    }

    /// Start an election in the background
    pub fn trigger_election(&self) {
        let election = Arc::clone(&self.election);
        tokio::spawn(async move { election.start_election().await });
    }

    /// Manual clock sync
    pub async fn request_sync(&self) -> Result<SyncOutcome> {
        self.clock.request_sync().await
    }

    /// Full node status
    pub async fn report(&self) -> NodeReport {
        NodeReport {
            node_id: self.node_id().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            cluster: self.cluster.summary().await,
            election: self.election.status().await,
            locks: self.locks.status().await,
            replication: self.replication.status().await,
            clock: self.clock.status().await,
        }
    }

    /// Start every background loop
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.spawn_role_bridge(), self.spawn_startup_election()];

        handles.push(self.spawn_periodic("probe", self.config.probe_interval(), |node| async move {
            node.election.check_coordinator().await;
        }));

        handles.push(self.spawn_periodic("sweep", self.config.sweep_interval(), |node| async move {
            let max_hold = node.config.max_lock_hold();
            node.locks.sweep_expired(max_hold).await;
        }));

        handles.push(self.spawn_periodic("sync", self.config.sync_interval(), |node| async move {
            if node.clock.is_coordinator().await {
                if let Err(e) = node.clock.run_round().await {
                    tracing::warn!("Berkeley round failed: {}", e);
                }
            }
        }));

        handles.push(self.spawn_periodic(
            "broadcast",
            self.config.broadcast_interval(),
            |node| async move {
                node.clock.broadcast_time().await;
            },
        ));

        handles.push(self.spawn_periodic(
            "consistency",
            self.config.consistency_check_interval(),
            |node| async move {
                node.replication.perform_consistency_check().await;
            },
        ));

        tracing::info!("Node {} started {} background tasks", self.node_id(), handles.len());
        handles
    }

    /// Stop every background loop
    pub fn shutdown(&self) {
        tracing::info!("Shutting down node {}", self.node_id());
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once [`shutdown`](Self::shutdown) has been called
    pub async fn cancelled(&self) {
        self.shutdown.cancelled().await
    }

    fn spawn_startup_election(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = node.shutdown.cancelled() => {}
                _ = tokio::time::sleep(node.config.startup_election_delay()) => {
                    node.election.start_election().await;
                }
            }
        })
    }

    fn spawn_periodic<F, Fut>(self: &Arc<Self>, name: &'static str, period: Duration, task: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = node.shutdown.cancelled() => {
                        tracing::debug!("{} loop stopped", name);
                        return;
                    }
                    _ = ticker.tick() => task(Arc::clone(&node)).await,
                }
            }
        })
    }

    /// Mirror election results into the clock's coordinator flag; a fresh
    /// coordinator runs a Berkeley round shortly after winning
    fn spawn_role_bridge(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        let mut elections = self.events.subscribe_election();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = node.shutdown.cancelled() => return,
                    event = elections.recv() => event,
                };

                let coordinator = match event {
                    Ok(ElectionEvent::CoordinatorElected { coordinator, .. }) => coordinator,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Role bridge missed {} election events", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => return,
                };

                let is_self = coordinator == node.node_id();
                node.clock.set_coordinator(is_self).await;
                if is_self {
                    let node = Arc::clone(&node);
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = node.shutdown.cancelled() => {}
                            _ = tokio::time::sleep(node.config.post_election_sync_delay()) => {
                                if node.clock.is_coordinator().await {
                                    if let Err(e) = node.clock.run_round().await {
                                        tracing::warn!("Post-election sync failed: {}", e);
                                    }
                                }
                            }
                        }
                    });
                }
            }
        })
    }
}

#[async_trait::async_trait]
impl PeerService for ClusterNode {
    async fn on_ping(&self) -> PingResponse {
        let me = self.cluster.get_self().await;
        PingResponse {
            alive: true,
            node_id: me.id,
            priority: me.priority,
            role: me.role,
        }
    }

    async fn on_solicit(&self, request: SolicitRequest) -> AckResponse {
        self.election.handle_solicitation(&request.from)
    }

    async fn on_announce(&self, request: AnnounceRequest) -> AckResponse {
        self.election.handle_announce(&request.coordinator_id).await;
        AckResponse::yes()
    }

    async fn on_replicate(&self, request: ReplicateRequest) -> Result<ReplicateResponse> {
        if request.resource_id.is_empty() {
            return Err(Error::InvalidPayload("resourceId is required".into()));
        }
        let Value::Object(fields) = &request.payload else {
            return Err(Error::InvalidPayload("payload must be a JSON object".into()));
        };

        let record = self.store.apply(&request.resource_id, fields).await?;
        tracing::info!(
            "Applied replicated update for {} from {}",
            request.resource_id,
            request.origin
        );
        Ok(ReplicateResponse {
            ok: true,
            result: Some(record),
            error: None,
        })
    }

    async fn on_read_clock(&self) -> ClockReading {
        self.clock.reading().await
    }

    async fn on_adjust_clock(&self, adjustment: ClockAdjustment) -> AckResponse {
        self.clock.handle_adjustment(&adjustment).await;
        AckResponse::yes()
    }

    async fn on_coordinator_time(&self, time: CoordinatorTime) -> AckResponse {
        self.clock.on_coordinator_time(&time).await;
        AckResponse::yes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::time::ManualClock;
    use crate::transport::memory::{LinkState, MemoryNetwork};

    const NODES: [(&str, i64); 3] = [("p1", 1), ("p2", 5), ("p3", 3)];

    fn node_config(id: &str) -> WolfCoordConfig {
        let priority = NODES.iter().find(|(n, _)| *n == id).map(|(_, p)| *p).unwrap();
        let peers: Vec<String> = NODES
            .iter()
            .filter(|(n, _)| *n != id)
            .map(|(n, p)| format!("{{ id = \"{}\", address = \"{}:7000\", priority = {} }}", n, n, p))
            .collect();
        let toml = format!(
            r#"
[node]
id = "{id}"
priority = {priority}
bind_address = "{id}:7000"

[cluster]
peers = [{peers}]

[lock]
request_timeout_ms = 200

[clock]
initial_skew_ms = 0
"#,
            id = id,
            priority = priority,
            peers = peers.join(", ")
        );
        WolfCoordConfig::from_str(&toml).unwrap()
    }

    async fn build_cluster(network: &Arc<MemoryNetwork>) -> Vec<Arc<ClusterNode>> {
        let wall = Arc::new(ManualClock::new(1_700_000_000_000));
        let mut nodes = Vec::new();
        for (id, _) in NODES {
            let node = ClusterNode::new(
                node_config(id),
                network.transport(),
                Arc::new(InMemoryRecordStore::new()),
                wall.clone(),
            )
            .await
            .unwrap();
            network.register(id, node.clone()).await;
            nodes.push(node);
        }
        nodes
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_applies_and_replicates() {
        let network = MemoryNetwork::new();
        let nodes = build_cluster(&network).await;

        let outcome = nodes[0]
            .write("patient-1", "doctor-7", json!({"diagnosis": "flu"}))
            .await
            .unwrap();
        assert_eq!(outcome.record, json!({"diagnosis": "flu"}));
        assert!(nodes[0].locks().holder("patient-1").await.is_none());

        tokio::time::sleep(Duration::from_millis(100)).await;
        for node in &nodes[1..] {
            assert_eq!(
                node.store().get("patient-1").await,
                Some(json!({"diagnosis": "flu"}))
            );
        }
        let update = nodes[0]
            .replication()
            .get_update(&outcome.update_id)
            .await
            .unwrap();
        assert_eq!(update.acks.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_denied_while_locked() {
        let network = MemoryNetwork::new();
        let nodes = build_cluster(&network).await;
        let node = &nodes[0];

        let long = Duration::from_secs(60);
        assert!(node.locks().acquire("patient-1", "other", long).await.is_granted());

        let err = node
            .write("patient-1", "doctor-7", json!({"a": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResourceConflict { .. }));
        assert!(node.store().get("patient-1").await.is_none());
        assert_eq!(node.locks().holder("patient-1").await.as_deref(), Some("other"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replicate_rejects_malformed_payload() {
        let network = MemoryNetwork::new();
        let nodes = build_cluster(&network).await;

        let request = ReplicateRequest {
            update_id: String::new(),
            resource_id: "patient-1".into(),
            payload: json!("not an object"),
            timestamp: 0,
            origin: "p2".into(),
        };
        let err = nodes[0].on_replicate(request.clone()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidPayload(_)));

        let missing_id = ReplicateRequest {
            resource_id: String::new(),
            payload: json!({"a": 1}),
            ..request
        };
        assert!(nodes[0].on_replicate(missing_id).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loops_elect_and_hand_over_clock_role() {
        let network = MemoryNetwork::new();
        let nodes = build_cluster(&network).await;
        let mut handles = Vec::new();
        for node in &nodes {
            handles.extend(node.start());
        }

        tokio::time::sleep(Duration::from_secs(10)).await;
        for node in &nodes {
            assert_eq!(
                node.election().current_coordinator().await.as_deref(),
                Some("p2")
            );
        }
        assert!(nodes[1].clock().is_coordinator().await);
        assert!(!nodes[0].clock().is_coordinator().await);
        assert!(nodes[1].clock().status().await.last_sync.is_some());
        assert!(nodes[0].clock().status().await.last_coordinator_time.is_some());

        // Losing the coordinator hands both roles to the next in line
        network.set_link("p2", LinkState::Down).await;
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(
            nodes[0].election().current_coordinator().await.as_deref(),
            Some("p3")
        );
        assert!(nodes[2].clock().is_coordinator().await);

        for node in &nodes {
            node.shutdown();
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_coordinator_loss_announced_once() {
        let network = MemoryNetwork::new();
        let nodes = build_cluster(&network).await;
        let mut handles = Vec::new();
        for node in &nodes {
            handles.extend(node.start());
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(nodes[1].election().is_coordinator().await);

        let mut events = nodes[2].events().subscribe_election();
        network.set_link("p2", LinkState::Down).await;
        // Long enough for p1 to notice too and solicit p3
        tokio::time::sleep(Duration::from_secs(30)).await;

        let mut announced = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ElectionEvent::CoordinatorAnnounced { .. }) {
                announced += 1;
            }
        }
        assert_eq!(announced, 1);
        assert!(nodes[2].election().is_coordinator().await);
        assert_eq!(
            nodes[0].election().current_coordinator().await.as_deref(),
            Some("p3")
        );

        for node in &nodes {
            node.shutdown();
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_refused_after_shutdown() {
        let network = MemoryNetwork::new();
        let nodes = build_cluster(&network).await;

        nodes[0].shutdown();
        let err = nodes[0]
            .write("patient-1", "doctor-7", json!({"a": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShuttingDown));
        assert!(nodes[0].locks().holder("patient-1").await.is_none());
        assert!(nodes[0].store().get("patient-1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_removing_coordinator_starts_election() {
        let network = MemoryNetwork::new();
        let nodes = build_cluster(&network).await;
        nodes[1].election().start_election().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            nodes[2].election().current_coordinator().await.as_deref(),
            Some("p2")
        );

        nodes[2].remove_peer("p2").await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(nodes[2].election().is_coordinator().await);
        assert!(matches!(
            nodes[2].remove_peer("p2").await,
            Err(Error::NodeNotFound(_))
        ));

        let report = nodes[2].report().await;
        assert_eq!(report.cluster.total_nodes, 2);
        assert_eq!(report.election.coordinator.as_deref(), Some("p3"));
    }
}
