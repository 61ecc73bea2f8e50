//! Peer RPC Protocol
//!
//! Request and response bodies exchanged between nodes over `/cluster/*`.

use serde::{Deserialize, Serialize};

use crate::state::NodeRole;

/// `GET /cluster/ping`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    pub alive: bool,
    pub node_id: String,
    pub priority: i64,
    pub role: NodeRole,
}

/// `POST /cluster/election`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolicitRequest {
    pub from: String,
}

/// `POST /cluster/announce`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnounceRequest {
    pub coordinator_id: String,
}

/// Generic acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    pub ack: bool,
}

impl AckResponse {
    pub fn yes() -> Self {
        Self { ack: true }
    }
}

/// `POST /cluster/replicate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicateRequest {
    #[serde(default)]
    pub update_id: String,
    pub resource_id: String,
    pub payload: serde_json::Value,
    /// Creation time at the origin, wall-clock milliseconds
    pub timestamp: i64,
    pub origin: String,
}

/// Reply to `POST /cluster/replicate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicateResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `GET /cluster/clock`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockReading {
    pub node_id: String,
    pub logical_time: i64,
}

/// `POST /cluster/clock/adjust`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockAdjustment {
    pub from: String,
    pub round_id: u64,
    pub delta: i64,
}

/// `POST /cluster/clock/coordinator-time`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorTime {
    pub coordinator_id: String,
    pub coordinator_time: i64,
}
