//! Cluster State Module
//!
//! Static cluster membership and the coordinator election built on it.

mod membership;
pub mod election;

pub use membership::{NodeState, NodeStatus, NodeRole, ClusterMembership, ClusterSummary};
pub use election::{ElectionCoordinator, ElectionConfig, ElectionPhase, ElectionState, ElectionStatus};
