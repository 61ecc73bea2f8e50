//! Coordinator Election
//!
//! Bully-style election: the highest-priority reachable node becomes
//! coordinator. A node solicits every peer that outranks it; if none of
//! them answer it takes over, otherwise it waits for one of them to
//! announce itself. An incoming announcement is accepted unconditionally
//! and cancels whatever this node was doing, so two coordinators can
//! briefly coexist until the later announcement reaches everyone.

use std::sync::Arc;
use std::time::Duration;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};

use crate::config::WolfCoordConfig;
use crate::events::{ElectionEvent, EventBus};
use crate::state::{ClusterMembership, NodeRole, NodeState};
use crate::transport::{AckResponse, PeerTransport};

/// Election phase of this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionPhase {
    /// No election has run yet
    Idle,
    /// Waiting for higher-priority peers to answer
    Soliciting,
    /// A higher peer answered; waiting for its announcement
    AwaitingAnnouncement,
    /// This node won
    Coordinator,
    /// Following an announced coordinator
    Follower,
}

impl ElectionPhase {
    /// Whether an election round is currently running
    pub fn in_progress(&self) -> bool {
        matches!(
            self,
            ElectionPhase::Soliciting | ElectionPhase::AwaitingAnnouncement
        )
    }
}

/// Mutable election state
#[derive(Debug, Clone)]
pub struct ElectionState {
    /// Increases by one on every round this node starts
    pub election_id: u64,
    pub phase: ElectionPhase,
    pub current_coordinator: Option<String>,
}

/// Election timing
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// How long higher peers get to acknowledge a solicitation
    pub solicit_timeout: Duration,
    /// How long to wait for an announcement after an acknowledgment
    pub announce_timeout: Duration,
    /// Timeout for pings and announcements
    pub rpc_timeout: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            solicit_timeout: Duration::from_millis(2000),
            announce_timeout: Duration::from_millis(4000),
            rpc_timeout: Duration::from_millis(3000),
        }
    }
}

impl From<&WolfCoordConfig> for ElectionConfig {
    fn from(config: &WolfCoordConfig) -> Self {
        Self {
            solicit_timeout: config.solicit_timeout(),
            announce_timeout: config.announce_timeout(),
            rpc_timeout: config.rpc_timeout(),
        }
    }
}

/// Election status for display
#[derive(Debug, Clone, Serialize)]
pub struct ElectionStatus {
    pub node_id: String,
    pub phase: ElectionPhase,
    pub election_id: u64,
    pub coordinator: Option<String>,
    pub is_coordinator: bool,
    pub known_nodes: Vec<NodeState>,
}

enum RoundOutcome {
    Settled,
    Restart,
}

/// Election coordinator runs the Bully algorithm for this node
pub struct ElectionCoordinator {
    /// This node's ID
    node_id: String,
    /// Election timing
    config: ElectionConfig,
    /// Cluster membership
    cluster: Arc<ClusterMembership>,
    /// Outbound peer calls
    transport: Arc<dyn PeerTransport>,
    /// Event fan-out
    events: EventBus,
    /// Current state
    state: RwLock<ElectionState>,
    /// Bumped on every accepted announcement
    announcements: watch::Sender<u64>,
}

impl ElectionCoordinator {
    /// Create a new election coordinator
    pub fn new(
        cluster: Arc<ClusterMembership>,
        transport: Arc<dyn PeerTransport>,
        config: ElectionConfig,
        events: EventBus,
    ) -> Self {
        let (announcements, _) = watch::channel(0);
        Self {
            node_id: cluster.node_id().to_string(),
            config,
            cluster,
            transport,
            events,
            state: RwLock::new(ElectionState {
                election_id: 0,
                phase: ElectionPhase::Idle,
                current_coordinator: None,
            }),
            announcements,
        }
    }

    /// Get current phase
    pub async fn phase(&self) -> ElectionPhase {
        self.state.read().await.phase
    }

    /// Get the ID of the most recent round started here
    pub async fn election_id(&self) -> u64 {
        self.state.read().await.election_id
    }

    /// Get the coordinator this node currently believes in
    pub async fn current_coordinator(&self) -> Option<String> {
        self.state.read().await.current_coordinator.clone()
    }

    /// Check if this node is the coordinator
    pub async fn is_coordinator(&self) -> bool {
        self.state.read().await.phase == ElectionPhase::Coordinator
    }

    /// Run an election until this node wins, an announcement arrives, or
    /// another round supersedes this one. Returns at once if a round is
    /// already running.
    pub async fn start_election(&self) {
        let Some(mut election_id) = self.begin_round(None).await else {
            return;
        };

        loop {
            match self.run_round(election_id).await {
                RoundOutcome::Settled => return,
                RoundOutcome::Restart => match self.begin_round(Some(election_id)).await {
                    Some(next) => election_id = next,
                    None => return,
                },
            }
        }
    }

    /// Enter Soliciting with a fresh election ID.
    ///
    /// A fresh start is refused while a round is running; a restart is
    /// refused if anything touched the state since `previous` began.
    async fn begin_round(&self, previous: Option<u64>) -> Option<u64> {
        let mut state = self.state.write().await;
        match previous {
            None if state.phase.in_progress() => {
                tracing::debug!(
                    "Election {} already in progress on {}",
                    state.election_id,
                    self.node_id
                );
                return None;
            }
            Some(id)
                if state.election_id != id
                    || state.phase != ElectionPhase::AwaitingAnnouncement =>
            {
                return None;
            }
            _ => {}
        }

        state.election_id += 1;
        state.phase = ElectionPhase::Soliciting;
        Some(state.election_id)
    }

    async fn run_round(&self, election_id: u64) -> RoundOutcome {
        tracing::info!(
            "Starting election {} (node: {})",
            election_id,
            self.node_id
        );
        self.events.election(ElectionEvent::ElectionStarted {
            node_id: self.node_id.clone(),
            election_id,
        });

        let higher = self.cluster.higher_priority_peers().await;
        if higher.is_empty() {
            tracing::info!("No higher-priority peers known, taking over");
            self.take_over(election_id).await;
            return RoundOutcome::Settled;
        }

        self.cluster.set_self_role(NodeRole::Candidate).await;

        // Subscribe before soliciting so an announcement racing the
        // solicitations is not missed
        let mut announcements = self.announcements.subscribe();
        let acked = self.solicit(&higher).await;

        {
            let mut state = self.state.write().await;
            if state.election_id != election_id || state.phase != ElectionPhase::Soliciting {
                tracing::debug!("Election {} superseded during solicitation", election_id);
                return RoundOutcome::Settled;
            }
            if acked > 0 {
                state.phase = ElectionPhase::AwaitingAnnouncement;
            }
        }

        if acked == 0 {
            tracing::info!(
                "None of {} higher-priority peers answered, taking over",
                higher.len()
            );
            self.take_over(election_id).await;
            return RoundOutcome::Settled;
        }

        tracing::debug!(
            "{} higher-priority peers answered, awaiting announcement",
            acked
        );

        match tokio::time::timeout(self.config.announce_timeout, announcements.changed()).await {
            Ok(_) => RoundOutcome::Settled,
            Err(_) => {
                let state = self.state.read().await;
                if state.election_id == election_id
                    && state.phase == ElectionPhase::AwaitingAnnouncement
                {
                    tracing::warn!(
                        "No coordinator announced within {:?}, restarting election",
                        self.config.announce_timeout
                    );
                    RoundOutcome::Restart
                } else {
                    RoundOutcome::Settled
                }
            }
        }
    }

    /// Solicit every higher peer concurrently; returns the number of acks
    async fn solicit(&self, higher: &[NodeState]) -> usize {
        let calls = higher.iter().map(|peer| async move {
            let result = self
                .transport
                .solicit_election(peer, &self.node_id, self.config.solicit_timeout)
                .await;
            (peer, result)
        });

        let mut acked = 0;
        for (peer, result) in join_all(calls).await {
            match result {
                Ok(AckResponse { ack: true }) => {
                    self.cluster.record_seen(&peer.id).await;
                    acked += 1;
                }
                Ok(_) => {
                    self.cluster.record_seen(&peer.id).await;
                    tracing::debug!("Peer {} declined solicitation", peer.id);
                }
                Err(e) => {
                    tracing::warn!("Solicitation to {} failed: {}", peer.id, e);
                    self.cluster.mark_unreachable(&peer.id).await;
                }
            }
        }
        acked
    }

    /// Become coordinator and announce it to every known peer
    async fn take_over(&self, election_id: u64) {
        {
            let mut state = self.state.write().await;
            if state.election_id != election_id || !state.phase.in_progress() {
                tracing::debug!("Election {} superseded before takeover", election_id);
                return;
            }
            state.phase = ElectionPhase::Coordinator;
            state.current_coordinator = Some(self.node_id.clone());
        }

        self.cluster.set_coordinator(&self.node_id).await;
        tracing::info!(
            "Node {} is now the coordinator (election {})",
            self.node_id,
            election_id
        );
        self.events.election(ElectionEvent::CoordinatorElected {
            coordinator: self.node_id.clone(),
            election_id,
        });

        let peers = self.cluster.peers().await;
        let calls = peers.iter().map(|peer| async move {
            let result = self
                .transport
                .announce_coordinator(peer, &self.node_id, self.config.rpc_timeout)
                .await;
            (peer, result)
        });

        let mut delivered = 0;
        let mut failed = 0;
        for (peer, result) in join_all(calls).await {
            match result {
                Ok(_) => {
                    self.cluster.record_seen(&peer.id).await;
                    delivered += 1;
                }
                Err(e) => {
                    tracing::warn!("Announcement to {} failed: {}", peer.id, e);
                    self.cluster.mark_unreachable(&peer.id).await;
                    failed += 1;
                }
            }
        }

        self.events.election(ElectionEvent::CoordinatorAnnounced {
            coordinator: self.node_id.clone(),
            delivered,
            failed,
        });
    }

    /// Accept a coordinator announcement, whatever state this node is in
    pub async fn handle_announce(&self, coordinator_id: &str) {
        let election_id = {
            let mut state = self.state.write().await;
            state.phase = if coordinator_id == self.node_id {
                ElectionPhase::Coordinator
            } else {
                ElectionPhase::Follower
            };
            state.current_coordinator = Some(coordinator_id.to_string());
            state.election_id
        };

        self.cluster.set_coordinator(coordinator_id).await;
        self.cluster.record_seen(coordinator_id).await;
        self.announcements.send_modify(|count| *count += 1);

        tracing::info!("Accepted {} as coordinator", coordinator_id);
        self.events.election(ElectionEvent::CoordinatorElected {
            coordinator: coordinator_id.to_string(),
            election_id,
        });
    }

    /// Answer a solicitation from a lower-priority peer.
    ///
    /// A sitting coordinator re-announces itself to the requester alone;
    /// any other node runs its own election in the background.
    pub fn handle_solicitation(self: &Arc<Self>, from: &str) -> AckResponse {
        tracing::debug!("Election solicitation from {}", from);
        let election = Arc::clone(self);
        let from = from.to_string();
        tokio::spawn(async move {
            if election.is_coordinator().await {
                election.reannounce_to(&from).await;
            } else {
                election.start_election().await;
            }
        });
        AckResponse::yes()
    }

    async fn reannounce_to(&self, peer_id: &str) {
        let Some(peer) = self.cluster.get_node(peer_id).await else {
            tracing::warn!("Solicitation from unknown peer {}", peer_id);
            return;
        };

        match self
            .transport
            .announce_coordinator(&peer, &self.node_id, self.config.rpc_timeout)
            .await
        {
            Ok(_) => self.cluster.record_seen(peer_id).await,
            Err(e) => {
                tracing::warn!("Re-announcement to {} failed: {}", peer_id, e);
                self.cluster.mark_unreachable(peer_id).await;
            }
        }
    }

    /// Probe the current coordinator and start an election if it is gone
    pub async fn check_coordinator(&self) {
        let (coordinator, phase) = {
            let state = self.state.read().await;
            (state.current_coordinator.clone(), state.phase)
        };

        if phase.in_progress() {
            return;
        }

        let Some(coordinator_id) = coordinator else {
            tracing::info!("No coordinator known, starting election");
            self.start_election().await;
            return;
        };

        if coordinator_id == self.node_id {
            return;
        }

        let Some(node) = self.cluster.get_node(&coordinator_id).await else {
            tracing::warn!("Coordinator {} is no longer a known peer", coordinator_id);
            self.start_election().await;
            return;
        };

        match self.transport.ping(&node, self.config.rpc_timeout).await {
            Ok(_) => self.cluster.record_seen(&coordinator_id).await,
            Err(e) => {
                tracing::warn!("Coordinator {} unreachable: {}", coordinator_id, e);
                self.cluster.mark_unreachable(&coordinator_id).await;
                self.start_election().await;
            }
        }
    }

    /// Get election status
    pub async fn status(&self) -> ElectionStatus {
        let state = self.state.read().await.clone();
        ElectionStatus {
            node_id: self.node_id.clone(),
            phase: state.phase,
            election_id: state.election_id,
            is_coordinator: state.phase == ElectionPhase::Coordinator,
            coordinator: state.current_coordinator,
            known_nodes: self.cluster.all_nodes().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::time::Instant;

    use crate::error::Result;
    use crate::transport::memory::{LinkState, MemoryNetwork, StubPeer};
    use crate::transport::{
        AnnounceRequest, ClockAdjustment, ClockReading, CoordinatorTime, PeerService,
        PingResponse, ReplicateRequest, ReplicateResponse, SolicitRequest,
    };

    const NODES: [(&str, i64); 3] = [("p1", 1), ("p2", 5), ("p3", 3)];

    fn test_config() -> ElectionConfig {
        ElectionConfig {
            solicit_timeout: Duration::from_millis(2000),
            announce_timeout: Duration::from_millis(4000),
            rpc_timeout: Duration::from_millis(1000),
        }
    }

    /// Serves only the election side of the peer protocol
    struct ElectionPeer {
        election: Arc<ElectionCoordinator>,
    }

    #[async_trait::async_trait]
    impl PeerService for ElectionPeer {
        async fn on_ping(&self) -> PingResponse {
            let me = self.election.cluster.get_self().await;
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

        async fn on_replicate(&self, _request: ReplicateRequest) -> Result<ReplicateResponse> {
            Ok(ReplicateResponse {
                ok: true,
                result: None,
                error: None,
            })
        }

        async fn on_read_clock(&self) -> ClockReading {
            ClockReading {
                node_id: self.election.node_id.clone(),
                logical_time: 0,
            }
        }

        async fn on_adjust_clock(&self, _adjustment: ClockAdjustment) -> AckResponse {
            AckResponse::yes()
        }

        async fn on_coordinator_time(&self, _time: CoordinatorTime) -> AckResponse {
            AckResponse::yes()
        }
    }

    async fn membership(id: &str, nodes: &[(&str, i64)]) -> Arc<ClusterMembership> {
        let priority = nodes.iter().find(|(n, _)| *n == id).map(|(_, p)| *p).unwrap();
        let cluster = ClusterMembership::new(id.to_string(), format!("{}:7000", id), priority);
        for (peer, peer_priority) in nodes.iter().filter(|(n, _)| *n != id) {
            cluster
                .add_peer(peer.to_string(), format!("{}:7000", peer), *peer_priority)
                .await
                .unwrap();
        }
        Arc::new(cluster)
    }

    async fn build_cluster(
        network: &Arc<MemoryNetwork>,
    ) -> HashMap<&'static str, Arc<ElectionCoordinator>> {
        let mut nodes = HashMap::new();
        for (id, _) in NODES {
            let election = Arc::new(ElectionCoordinator::new(
                membership(id, &NODES).await,
                network.transport(),
                test_config(),
                EventBus::new(),
            ));
            network
                .register(
                    id,
                    Arc::new(ElectionPeer {
                        election: Arc::clone(&election),
                    }),
                )
                .await;
            nodes.insert(id, election);
        }
        nodes
    }

    fn count_announced(rx: &mut tokio::sync::broadcast::Receiver<ElectionEvent>) -> usize {
        let mut count = 0;
        loop {
            match rx.try_recv() {
                Ok(ElectionEvent::CoordinatorAnnounced { .. }) => count += 1,
                Ok(_) => {}
                Err(TryRecvError::Lagged(_)) => {}
                Err(_) => return count,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lone_node_self_promotes() {
        let network = MemoryNetwork::new();
        let election = ElectionCoordinator::new(
            membership("solo", &[("solo", 1)]).await,
            network.transport(),
            test_config(),
            EventBus::new(),
        );

        assert_eq!(election.phase().await, ElectionPhase::Idle);
        election.start_election().await;

        assert_eq!(election.phase().await, ElectionPhase::Coordinator);
        assert_eq!(election.current_coordinator().await.as_deref(), Some("solo"));
        assert_eq!(election.election_id().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_election_converges_to_highest_priority() {
        let network = MemoryNetwork::new();
        let nodes = build_cluster(&network).await;

        nodes["p1"].start_election().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        for (id, _) in NODES {
            assert_eq!(
                nodes[id].current_coordinator().await.as_deref(),
                Some("p2"),
                "{} disagrees",
                id
            );
        }
        assert_eq!(nodes["p2"].phase().await, ElectionPhase::Coordinator);
        assert_eq!(nodes["p1"].phase().await, ElectionPhase::Follower);
        assert_eq!(nodes["p3"].phase().await, ElectionPhase::Follower);
        assert!(!nodes["p3"].is_coordinator().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_coordinator_replaced_within_bound() {
        let network = MemoryNetwork::new();
        let nodes = build_cluster(&network).await;
        nodes["p1"].start_election().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(nodes["p3"].current_coordinator().await.as_deref(), Some("p2"));

        network.set_link("p2", LinkState::Blackhole).await;
        let mut events = nodes["p3"].events.subscribe_election();

        let p3 = Arc::clone(&nodes["p3"]);
        let detected = Instant::now();
        tokio::spawn(async move { p3.start_election().await });

        let promoted_after = loop {
            match events.recv().await.unwrap() {
                ElectionEvent::CoordinatorElected { coordinator, .. } if coordinator == "p3" => {
                    break detected.elapsed();
                }
                _ => {}
            }
        };
        let config = test_config();
        assert!(promoted_after <= config.solicit_timeout + config.announce_timeout);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count_announced(&mut events), 1);
        assert_eq!(nodes["p1"].current_coordinator().await.as_deref(), Some("p3"));
        assert!(nodes["p3"].is_coordinator().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reachability_check_triggers_election_only_on_failure() {
        let network = MemoryNetwork::new();
        let nodes = build_cluster(&network).await;
        nodes["p1"].start_election().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        let before = nodes["p3"].election_id().await;
        nodes["p3"].check_coordinator().await;
        assert_eq!(nodes["p3"].election_id().await, before);

        network.set_link("p2", LinkState::Down).await;
        nodes["p3"].check_coordinator().await;
        assert_eq!(nodes["p3"].election_id().await, before + 1);
        assert!(nodes["p3"].is_coordinator().await);

        // Peers that fail a call stay in the known set
        let p2 = nodes["p3"].cluster.get_node("p2").await.unwrap();
        assert_eq!(p2.status, crate::state::NodeStatus::Unreachable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_announce_cancels_solicitation() {
        let network = MemoryNetwork::new();
        let nodes = build_cluster(&network).await;
        network.set_link("p2", LinkState::Blackhole).await;
        network.set_link("p3", LinkState::Blackhole).await;
        let mut events = nodes["p1"].events.subscribe_election();

        let p1 = Arc::clone(&nodes["p1"]);
        let handle = tokio::spawn(async move { p1.start_election().await });
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(nodes["p1"].phase().await, ElectionPhase::Soliciting);

        nodes["p1"].handle_announce("p3").await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(handle.is_finished());
        assert_eq!(nodes["p1"].phase().await, ElectionPhase::Follower);
        assert_eq!(nodes["p1"].current_coordinator().await.as_deref(), Some("p3"));
        assert_eq!(count_announced(&mut events), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_announcement_restarts_round() {
        let network = MemoryNetwork::new();
        let nodes = [("p1", 1), ("p2", 5)];
        let p1 = Arc::new(ElectionCoordinator::new(
            membership("p1", &nodes).await,
            network.transport(),
            test_config(),
            EventBus::new(),
        ));
        network.register("p2", StubPeer::new("p2")).await;

        let runner = Arc::clone(&p1);
        let handle = tokio::spawn(async move { runner.start_election().await });

        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert!(p1.election_id().await >= 2);
        assert!(p1.phase().await.in_progress());
        assert!(!handle.is_finished());

        p1.handle_announce("p2").await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(handle.is_finished());
        assert_eq!(p1.phase().await, ElectionPhase::Follower);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coordinator_answers_solicitation_without_new_round() {
        let network = MemoryNetwork::new();
        let nodes = build_cluster(&network).await;
        nodes["p1"].start_election().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(nodes["p2"].is_coordinator().await);

        let before = nodes["p2"].election_id().await;
        let announces_to_p1 = network.calls_to("p1", "announce").await;
        let mut events = nodes["p2"].events.subscribe_election();

        nodes["p1"].handle_announce("p3").await;
        nodes["p1"].start_election().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(nodes["p2"].election_id().await, before);
        assert_eq!(count_announced(&mut events), 0);
        // One direct reply per solicitation, no cluster-wide broadcast
        assert_eq!(network.calls_to("p1", "announce").await, announces_to_p1 + 1);
        assert_eq!(nodes["p1"].current_coordinator().await.as_deref(), Some("p2"));
        assert_eq!(nodes["p3"].current_coordinator().await.as_deref(), Some("p2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_ignored_while_running() {
        let network = MemoryNetwork::new();
        let nodes = build_cluster(&network).await;
        network.set_link("p2", LinkState::Blackhole).await;
        network.set_link("p3", LinkState::Blackhole).await;

        let p1 = Arc::clone(&nodes["p1"]);
        tokio::spawn(async move { p1.start_election().await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        nodes["p1"].start_election().await;
        assert_eq!(nodes["p1"].election_id().await, 1);

        let status = nodes["p1"].status().await;
        assert_eq!(status.phase, ElectionPhase::Soliciting);
        assert_eq!(status.known_nodes.len(), 3);
    }
}
