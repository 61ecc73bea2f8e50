//! Replication Module
//!
//! Quorum-acknowledged propagation of writes to peers, plus the local
//! replica slots used for consistency checking.

mod coordinator;
mod replica;

pub use coordinator::{
    ReplicationCoordinator, ReplicationSettings, ReplicationStatus, ReplicationUpdate,
    UpdateStatus,
};
pub use replica::{ConsistencyReport, ReplicaHealth, ReplicaSnapshot, ReplicaSummary};
