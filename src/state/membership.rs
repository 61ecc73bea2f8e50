//! Cluster Membership Management
//!
//! Tracks the statically configured nodes, their priorities, roles and
//! reachability. A failed call against a peer only marks it unreachable;
//! peers leave the known set solely through an explicit `remove_peer`.

use std::collections::HashMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// Reachability of a node as last observed by this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Never contacted
    Unknown,
    /// Answered the most recent call
    Reachable,
    /// Failed the most recent call
    Unreachable,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Unknown => write!(f, "UNKNOWN"),
            NodeStatus::Reachable => write!(f, "REACHABLE"),
            NodeStatus::Unreachable => write!(f, "UNREACHABLE"),
        }
    }
}

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Following a known or unknown coordinator
    Follower,
    /// Soliciting higher-priority peers
    Candidate,
    /// Cluster coordinator
    Coordinator,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Follower => write!(f, "FOLLOWER"),
            NodeRole::Candidate => write!(f, "CANDIDATE"),
            NodeRole::Coordinator => write!(f, "COORDINATOR"),
        }
    }
}

/// State of a single node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// Unique node identifier
    pub id: String,
    /// Node address (host:port)
    pub address: String,
    /// Election priority
    pub priority: i64,
    /// Current role
    pub role: NodeRole,
    /// Last observed reachability
    pub status: NodeStatus,
    /// Last time the node answered a call
    pub last_seen: Option<DateTime<Utc>>,
}

impl NodeState {
    /// Create a new node state
    pub fn new(id: String, address: String, priority: i64) -> Self {
        Self {
            id,
            address,
            priority,
            role: NodeRole::Follower,
            status: NodeStatus::Unknown,
            last_seen: None,
        }
    }

    /// Whether this node beats `(priority, id)` in an election.
    ///
    /// Equal priorities fall back to comparing node ids, so exactly one node
    /// in any set outranks all the others.
    pub fn outranks(&self, priority: i64, id: &str) -> bool {
        (self.priority, self.id.as_str()) > (priority, id)
    }

    /// Mark the node as having answered a call
    pub fn touch(&mut self) {
        self.status = NodeStatus::Reachable;
        self.last_seen = Some(Utc::now());
    }
}

/// Cluster membership tracker
pub struct ClusterMembership {
    /// This node's ID
    node_id: String,
    /// This node's own state
    self_node: RwLock<NodeState>,
    /// Known peers (excluding self)
    peers: RwLock<HashMap<String, NodeState>>,
}

impl ClusterMembership {
    /// Create a new cluster membership tracker
    pub fn new(node_id: String, address: String, priority: i64) -> Self {
        let mut self_node = NodeState::new(node_id.clone(), address, priority);
        self_node.touch();

        Self {
            node_id,
            self_node: RwLock::new(self_node),
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Get this node's ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Add a peer node, or update its address and priority if already known
    pub async fn add_peer(&self, id: String, address: String, priority: i64) -> Result<()> {
        if id == self.node_id {
            return Err(Error::Config(format!("cannot add self ({}) as a peer", id)));
        }

        let mut peers = self.peers.write().await;
        match peers.get_mut(&id) {
            Some(existing) => {
                existing.address = address;
                existing.priority = priority;
            }
            None => {
                tracing::info!("Added peer {} at {} (priority {})", id, address, priority);
                peers.insert(id.clone(), NodeState::new(id, address, priority));
            }
        }
        Ok(())
    }

    /// Remove a peer node
    pub async fn remove_peer(&self, id: &str) -> Result<NodeState> {
        let mut peers = self.peers.write().await;
        let removed = peers
            .remove(id)
            .ok_or_else(|| Error::NodeNotFound(id.to_string()))?;
        tracing::info!("Removed peer {} ({} peers remain)", id, peers.len());
        Ok(removed)
    }

    /// Get a node's state (self included)
    pub async fn get_node(&self, id: &str) -> Option<NodeState> {
        if id == self.node_id {
            return Some(self.get_self().await);
        }
        self.peers.read().await.get(id).cloned()
    }

    /// Get this node's state
    pub async fn get_self(&self) -> NodeState {
        self.self_node.read().await.clone()
    }

    /// Get all peer nodes (excluding self), highest priority first
    pub async fn peers(&self) -> Vec<NodeState> {
        let peers = self.peers.read().await;
        let mut list: Vec<NodeState> = peers.values().cloned().collect();
        list.sort_by(|a, b| (b.priority, &b.id).cmp(&(a.priority, &a.id)));
        list
    }

    /// Get all nodes including self, highest priority first
    pub async fn all_nodes(&self) -> Vec<NodeState> {
        let mut nodes = self.peers().await;
        nodes.push(self.get_self().await);
        nodes.sort_by(|a, b| (b.priority, &b.id).cmp(&(a.priority, &a.id)));
        nodes
    }

    /// Peers that outrank this node
    pub async fn higher_priority_peers(&self) -> Vec<NodeState> {
        let me = self.get_self().await;
        self.peers()
            .await
            .into_iter()
            .filter(|peer| peer.outranks(me.priority, &me.id))
            .collect()
    }

    /// Record a successful call to a peer
    pub async fn record_seen(&self, id: &str) {
        if let Some(node) = self.peers.write().await.get_mut(id) {
            node.touch();
        }
    }

    /// Record a failed call to a peer. The peer stays in the known set.
    pub async fn mark_unreachable(&self, id: &str) {
        if let Some(node) = self.peers.write().await.get_mut(id) {
            if node.status != NodeStatus::Unreachable {
                tracing::debug!("Peer {} marked unreachable", id);
            }
            node.status = NodeStatus::Unreachable;
        }
    }

    /// Set this node's role
    pub async fn set_self_role(&self, role: NodeRole) {
        self.self_node.write().await.role = role;
    }

    /// Make `coordinator_id` the only node with the Coordinator role
    pub async fn set_coordinator(&self, coordinator_id: &str) {
        {
            let mut peers = self.peers.write().await;
            for node in peers.values_mut() {
                node.role = if node.id == coordinator_id {
                    NodeRole::Coordinator
                } else {
                    NodeRole::Follower
                };
            }
        }

        let mut me = self.self_node.write().await;
        me.role = if coordinator_id == self.node_id {
            NodeRole::Coordinator
        } else {
            NodeRole::Follower
        };
    }

    /// Get the current coordinator (if known)
    pub async fn current_coordinator(&self) -> Option<NodeState> {
        let me = self.get_self().await;
        if me.role == NodeRole::Coordinator {
            return Some(me);
        }
        let peers = self.peers.read().await;
        peers.values().find(|n| n.role == NodeRole::Coordinator).cloned()
    }

    /// Get the cluster size (self included)
    pub async fn size(&self) -> usize {
        self.peers.read().await.len() + 1
    }

    /// Get cluster summary
    pub async fn summary(&self) -> ClusterSummary {
        let nodes = self.all_nodes().await;
        let mut summary = ClusterSummary {
            total_nodes: nodes.len(),
            reachable_nodes: 0,
            unreachable_nodes: 0,
            coordinator_id: None,
        };

        for node in nodes {
            match node.status {
                NodeStatus::Reachable => summary.reachable_nodes += 1,
                NodeStatus::Unreachable => summary.unreachable_nodes += 1,
                NodeStatus::Unknown => {}
            }

            if node.role == NodeRole::Coordinator {
                summary.coordinator_id = Some(node.id.clone());
            }
        }

        summary
    }
}

/// Cluster summary information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub total_nodes: usize,
    pub reachable_nodes: usize,
    pub unreachable_nodes: usize,
    pub coordinator_id: Option<String>,
}
