//! HTTP Peer Transport
//!
//! JSON over HTTP against the `/cluster/*` routes served by `api::http`.

use std::time::Duration;
use serde::{de::DeserializeOwned, Serialize};

use super::{
    AckResponse, AnnounceRequest, ClockAdjustment, ClockReading, CoordinatorTime, PeerTransport,
    PingResponse, ReplicateRequest, ReplicateResponse, SolicitRequest,
};
use crate::error::{Error, Result};
use crate::state::NodeState;

/// Peer transport backed by a shared `reqwest` client
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a new HTTP transport
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn url(peer: &NodeState, path: &str) -> String {
        format!("http://{}{}", peer.address, path)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        peer: &NodeState,
        path: &str,
        timeout: Duration,
    ) -> Result<T> {
        let response = self
            .client
            .get(Self::url(peer, path))
            .timeout(timeout)
            .send()
            .await?;
        Self::decode(peer, path, response).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        peer: &NodeState,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<T> {
        let response = self
            .client
            .post(Self::url(peer, path))
            .timeout(timeout)
            .json(body)
            .send()
            .await?;
        Self::decode(peer, path, response).await
    }

    async fn decode<T: DeserializeOwned>(
        peer: &NodeState,
        path: &str,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Network(format!(
                "{} {} returned {}",
                peer.id, path, status
            )));
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait::async_trait]
impl PeerTransport for HttpTransport {
    async fn ping(&self, peer: &NodeState, timeout: Duration) -> Result<PingResponse> {
        self.get(peer, "/cluster/ping", timeout).await
    }

    async fn solicit_election(
        &self,
        peer: &NodeState,
        from: &str,
        timeout: Duration,
    ) -> Result<AckResponse> {
        let body = SolicitRequest {
            from: from.to_string(),
        };
        self.post(peer, "/cluster/election", &body, timeout).await
    }

    async fn announce_coordinator(
        &self,
        peer: &NodeState,
        coordinator_id: &str,
        timeout: Duration,
    ) -> Result<AckResponse> {
        let body = AnnounceRequest {
            coordinator_id: coordinator_id.to_string(),
        };
        self.post(peer, "/cluster/announce", &body, timeout).await
    }

    async fn replicate_update(
        &self,
        peer: &NodeState,
        request: &ReplicateRequest,
        timeout: Duration,
    ) -> Result<ReplicateResponse> {
        self.post(peer, "/cluster/replicate", request, timeout).await
    }

    async fn read_clock(&self, peer: &NodeState, timeout: Duration) -> Result<ClockReading> {
        self.get(peer, "/cluster/clock", timeout).await
    }

    async fn adjust_clock(
        &self,
        peer: &NodeState,
        adjustment: &ClockAdjustment,
        timeout: Duration,
    ) -> Result<AckResponse> {
        self.post(peer, "/cluster/clock/adjust", adjustment, timeout).await
    }

    async fn publish_coordinator_time(
        &self,
        peer: &NodeState,
        time: &CoordinatorTime,
        timeout: Duration,
    ) -> Result<AckResponse> {
        self.post(peer, "/cluster/clock/coordinator-time", time, timeout).await
    }
}
