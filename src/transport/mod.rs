//! Peer Transport
//!
//! The RPC contract between nodes. [`PeerTransport`] is the calling side
//! used by election, replication and clock sync; [`PeerService`] is the
//! answering side implemented by the node and exposed over HTTP.
//!
//! Every call is bounded by a caller-supplied timeout and reports
//! unreachability as an error value. A failed call says nothing about the
//! peer beyond "unavailable for this call".

pub mod protocol;
mod http;
#[cfg(test)]
pub(crate) mod memory;

pub use http::HttpTransport;
pub use protocol::{
    AckResponse, AnnounceRequest, ClockAdjustment, ClockReading, CoordinatorTime, PingResponse,
    ReplicateRequest, ReplicateResponse, SolicitRequest,
};

use std::time::Duration;

use crate::error::Result;
use crate::state::NodeState;

/// Outbound peer RPCs
#[async_trait::async_trait]
pub trait PeerTransport: Send + Sync {
    /// Liveness probe
    async fn ping(&self, peer: &NodeState, timeout: Duration) -> Result<PingResponse>;

    /// Ask a higher-priority peer to take over the election
    async fn solicit_election(
        &self,
        peer: &NodeState,
        from: &str,
        timeout: Duration,
    ) -> Result<AckResponse>;

    /// Tell a peer who the coordinator is
    async fn announce_coordinator(
        &self,
        peer: &NodeState,
        coordinator_id: &str,
        timeout: Duration,
    ) -> Result<AckResponse>;

    /// Ship a replicated write to a peer
    async fn replicate_update(
        &self,
        peer: &NodeState,
        request: &ReplicateRequest,
        timeout: Duration,
    ) -> Result<ReplicateResponse>;

    /// Read a peer's logical clock
    async fn read_clock(&self, peer: &NodeState, timeout: Duration) -> Result<ClockReading>;

    /// Push a Berkeley correction to a peer
    async fn adjust_clock(
        &self,
        peer: &NodeState,
        adjustment: &ClockAdjustment,
        timeout: Duration,
    ) -> Result<AckResponse>;

    /// Publish the coordinator's current logical time
    async fn publish_coordinator_time(
        &self,
        peer: &NodeState,
        time: &CoordinatorTime,
        timeout: Duration,
    ) -> Result<AckResponse>;
}

/// Inbound peer RPCs
#[async_trait::async_trait]
pub trait PeerService: Send + Sync {
    async fn on_ping(&self) -> PingResponse;

    /// Acknowledge immediately; the election re-evaluation runs in the background
    async fn on_solicit(&self, request: SolicitRequest) -> AckResponse;

    async fn on_announce(&self, request: AnnounceRequest) -> AckResponse;

    async fn on_replicate(&self, request: ReplicateRequest) -> Result<ReplicateResponse>;

    async fn on_read_clock(&self) -> ClockReading;

    async fn on_adjust_clock(&self, adjustment: ClockAdjustment) -> AckResponse;

    async fn on_coordinator_time(&self, time: CoordinatorTime) -> AckResponse;
}
