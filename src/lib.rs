//! WolfCoord - Cluster Coordination Layer
//!
//! Coordination primitives for a small, statically configured cluster of
//! nodes that talk to each other over HTTP.
//!
//! # Architecture
//!
//! Every node runs the same components. A Bully election picks the
//! highest-priority reachable node as coordinator; that node also drives
//! Berkeley clock synchronization. Writes go through a per-resource lock
//! and are replicated to peers, completing once a quorum has acknowledged.
//!
//! # Features
//!
//! - Bully leader election with explicit priorities and failure probing
//! - Per-resource FIFO locks with request timeouts and a stale-lock sweep
//! - Quorum replication with retries and local replica consistency checks
//! - Berkeley clock sync with a fast align path between rounds
//! - Broadcast event channels for every component
//! - HTTP API for peers and operators

pub mod config;
pub mod error;
pub mod events;
pub mod time;
pub mod state;
pub mod lock;
pub mod replication;
pub mod timesync;
pub mod transport;
pub mod store;
pub mod node;
pub mod api;

pub use config::WolfCoordConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfCoordConfig;
    pub use crate::error::{Error, Result};
    pub use crate::events::EventBus;
    pub use crate::lock::{LockOutcome, ResourceLock};
    pub use crate::node::ClusterNode;
    pub use crate::replication::ReplicationCoordinator;
    pub use crate::state::{ClusterMembership, ElectionCoordinator, NodeState};
    pub use crate::store::{InMemoryRecordStore, RecordStore};
    pub use crate::timesync::ClockSync;
    pub use crate::transport::{HttpTransport, PeerService, PeerTransport};
}
