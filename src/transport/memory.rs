//! In-memory peer network for tests
//!
//! Routes [`PeerTransport`] calls directly into other in-process nodes'
//! [`PeerService`]. Links can be taken down (calls fail at once) or
//! black-holed (calls hang until the caller's timeout), which is how tests
//! inject peer failures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use super::{
    AckResponse, AnnounceRequest, ClockAdjustment, ClockReading, CoordinatorTime, PeerService,
    PeerTransport, PingResponse, ReplicateRequest, ReplicateResponse, SolicitRequest,
};
use crate::error::{Error, Result};
use crate::state::{NodeRole, NodeState};

/// Behavior of calls addressed to a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkState {
    Up,
    Down,
    Blackhole,
}

#[derive(Default)]
pub(crate) struct MemoryNetwork {
    services: RwLock<HashMap<String, Arc<dyn PeerService>>>,
    links: RwLock<HashMap<String, LinkState>>,
    calls: Mutex<Vec<(String, &'static str)>>,
}

impl MemoryNetwork {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn transport(self: &Arc<Self>) -> Arc<dyn PeerTransport> {
        Arc::new(MemoryTransport {
            network: Arc::clone(self),
        })
    }

    pub(crate) async fn register(&self, id: &str, service: Arc<dyn PeerService>) {
        self.services.write().await.insert(id.to_string(), service);
    }

    pub(crate) async fn set_link(&self, id: &str, state: LinkState) {
        self.links.write().await.insert(id.to_string(), state);
    }

    /// Number of `method` calls addressed to `id` so far
    pub(crate) async fn calls_to(&self, id: &str, method: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|(target, m)| target == id && *m == method)
            .count()
    }

    /// Total number of `method` calls issued so far
    pub(crate) async fn calls(&self, method: &str) -> usize {
        self.calls.lock().await.iter().filter(|(_, m)| *m == method).count()
    }

    async fn route(
        &self,
        peer: &NodeState,
        method: &'static str,
        timeout: Duration,
    ) -> Result<Arc<dyn PeerService>> {
        self.calls.lock().await.push((peer.id.clone(), method));

        let link = self
            .links
            .read()
            .await
            .get(&peer.id)
            .copied()
            .unwrap_or(LinkState::Up);

        match link {
            LinkState::Down => Err(Error::ConnectionFailed {
                address: peer.address.clone(),
                reason: "link down".into(),
            }),
            LinkState::Blackhole => {
                tokio::time::sleep(timeout).await;
                Err(Error::ConnectionTimeout(peer.address.clone()))
            }
            LinkState::Up => self
                .services
                .read()
                .await
                .get(&peer.id)
                .cloned()
                .ok_or_else(|| Error::ConnectionFailed {
                    address: peer.address.clone(),
                    reason: "no such node".into(),
                }),
        }
    }
}

struct MemoryTransport {
    network: Arc<MemoryNetwork>,
}

#[async_trait::async_trait]
impl PeerTransport for MemoryTransport {
    async fn ping(&self, peer: &NodeState, timeout: Duration) -> Result<PingResponse> {
        let service = self.network.route(peer, "ping", timeout).await?;
        Ok(service.on_ping().await)
    }

    async fn solicit_election(
        &self,
        peer: &NodeState,
        from: &str,
        timeout: Duration,
    ) -> Result<AckResponse> {
        let service = self.network.route(peer, "solicit", timeout).await?;
        Ok(service
            .on_solicit(SolicitRequest {
                from: from.to_string(),
            })
            .await)
    }

    async fn announce_coordinator(
        &self,
        peer: &NodeState,
        coordinator_id: &str,
        timeout: Duration,
    ) -> Result<AckResponse> {
        let service = self.network.route(peer, "announce", timeout).await?;
        Ok(service
            .on_announce(AnnounceRequest {
                coordinator_id: coordinator_id.to_string(),
            })
            .await)
    }

    async fn replicate_update(
        &self,
        peer: &NodeState,
        request: &ReplicateRequest,
        timeout: Duration,
    ) -> Result<ReplicateResponse> {
        let service = self.network.route(peer, "replicate", timeout).await?;
        service.on_replicate(request.clone()).await
    }

    async fn read_clock(&self, peer: &NodeState, timeout: Duration) -> Result<ClockReading> {
        let service = self.network.route(peer, "read_clock", timeout).await?;
        Ok(service.on_read_clock().await)
    }

    async fn adjust_clock(
        &self,
        peer: &NodeState,
        adjustment: &ClockAdjustment,
        timeout: Duration,
    ) -> Result<AckResponse> {
        let service = self.network.route(peer, "adjust_clock", timeout).await?;
        Ok(service.on_adjust_clock(adjustment.clone()).await)
    }

    async fn publish_coordinator_time(
        &self,
        peer: &NodeState,
        time: &CoordinatorTime,
        timeout: Duration,
    ) -> Result<AckResponse> {
        let service = self.network.route(peer, "coordinator_time", timeout).await?;
        Ok(service.on_coordinator_time(time.clone()).await)
    }
}

/// Peer that acknowledges everything and never acts on it
pub(crate) struct StubPeer {
    pub(crate) id: String,
    pub(crate) logical_time: i64,
}

impl StubPeer {
    pub(crate) fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            logical_time: 0,
        })
    }
}

#[async_trait::async_trait]
impl PeerService for StubPeer {
    async fn on_ping(&self) -> PingResponse {
        PingResponse {
            alive: true,
            node_id: self.id.clone(),
            priority: 0,
            role: NodeRole::Follower,
        }
    }

    async fn on_solicit(&self, _request: SolicitRequest) -> AckResponse {
        AckResponse::yes()
    }

    async fn on_announce(&self, _request: AnnounceRequest) -> AckResponse {
        AckResponse::yes()
    }

    async fn on_replicate(&self, request: ReplicateRequest) -> Result<ReplicateResponse> {
        Ok(ReplicateResponse {
            ok: true,
            result: Some(request.payload),
            error: None,
        })
    }

    async fn on_read_clock(&self) -> ClockReading {
        ClockReading {
            node_id: self.id.clone(),
            logical_time: self.logical_time,
        }
    }

    async fn on_adjust_clock(&self, _adjustment: ClockAdjustment) -> AckResponse {
        AckResponse::yes()
    }

    async fn on_coordinator_time(&self, _time: CoordinatorTime) -> AckResponse {
        AckResponse::yes()
    }
}
