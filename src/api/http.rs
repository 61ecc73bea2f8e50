//! HTTP API Server
//!
//! One listener serves both surfaces: the `/cluster/*` peer protocol that
//! other nodes call through `HttpTransport`, and the operator routes used
//! by `wolfcoordctl`. `[api] enabled = false` drops the operator routes
//! only; a node without the peer routes could not take part in the cluster.

use std::sync::Arc;
use axum::{
    extract::{rejection::JsonRejection, Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::{ApiConfig, PeerConfig};
use crate::error::{Error, Result};
use crate::node::ClusterNode;
use crate::transport::{
    AnnounceRequest, ClockAdjustment, CoordinatorTime, PeerService, ReplicateRequest,
    ReplicateResponse, SolicitRequest,
};

/// Shared application state
pub struct AppState {
    pub node: Arc<ClusterNode>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    bind_address: String,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a server for a node, listening on the node's bind address
    pub fn new(node: Arc<ClusterNode>) -> Self {
        let config = node.config().api.clone();
        let bind_address = node.config().node.bind_address.clone();
        Self {
            config,
            bind_address,
            state: Arc::new(AppState { node }),
        }
    }

    /// Get the state for sharing with other components
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Create the router
    fn create_router(config: &ApiConfig, state: Arc<AppState>) -> Router {
        let mut router = Router::new()
            // Peer protocol
            .route("/cluster/ping", get(handle_ping))
            .route("/cluster/election", post(handle_solicit))
            .route("/cluster/announce", post(handle_announce))
            .route("/cluster/replicate", post(handle_replicate))
            .route("/cluster/clock", get(handle_read_clock))
            .route("/cluster/clock/adjust", post(handle_adjust_clock))
            .route("/cluster/clock/coordinator-time", post(handle_coordinator_time));

        if config.enabled {
            router = router
                // Status and info
                .route("/status", get(handle_status))
                .route("/health", get(handle_health))
                .route("/cluster/nodes", get(handle_nodes))
                .route("/locks", get(handle_locks))
                .route("/replication", get(handle_replication))
                .route(
                    "/replication/consistency/:resource_id",
                    get(handle_consistency),
                )
                // Admin operations
                .route("/admin/peers", post(handle_add_peer))
                .route("/admin/peers/:node_id", axum::routing::delete(handle_remove_peer))
                .route("/admin/election", post(handle_election))
                .route("/admin/sync-time", post(handle_sync_time))
                .route("/locks/sweep", post(handle_sweep))
                .route("/admin/replicas/:replica_id/fail", post(handle_fail_replica))
                .route("/admin/replicas/:replica_id/recover", post(handle_recover_replica))
                // Records
                .route("/resources/:resource_id", post(handle_write).get(handle_read));
        }

        let router = router.with_state(state).layer(TraceLayer::new_for_http());
        if config.cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Start the HTTP server. Returns once the node shuts down.
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("Operator API disabled; serving peer protocol only");
        }

        let app = Self::create_router(&self.config, Arc::clone(&self.state));

        let listener = tokio::net::TcpListener::bind(&self.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.bind_address);

        let node = Arc::clone(&self.state.node);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { node.cancelled().await })
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        tracing::info!("HTTP API stopped");
        Ok(())
    }
}

// ============ Request/Response Types ============

/// Write request
#[derive(Debug, Deserialize, Serialize)]
pub struct WriteRequest {
    pub requester: String,
    pub payload: Value,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub is_coordinator: bool,
}

/// Generic admin action response
#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

impl ActionResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(e: Error) -> Response {
    let status = match &e {
        Error::InvalidPayload(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
        Error::PermissionDenied { .. } => StatusCode::FORBIDDEN,
        Error::ResourceConflict { .. } => StatusCode::CONFLICT,
        Error::NodeNotFound(_) | Error::ReplicaNotFound(_) => StatusCode::NOT_FOUND,
        Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: e.code().to_string(),
        }),
    )
        .into_response()
}

// ============ Peer Handlers ============

async fn handle_ping(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.node.on_ping().await)
}

async fn handle_solicit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SolicitRequest>,
) -> impl IntoResponse {
    Json(state.node.on_solicit(req).await)
}

async fn handle_announce(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AnnounceRequest>,
) -> impl IntoResponse {
    Json(state.node.on_announce(req).await)
}

async fn handle_replicate(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<ReplicateRequest>, JsonRejection>,
) -> impl IntoResponse {
    let rejected = |error: String| {
        (
            StatusCode::BAD_REQUEST,
            Json(ReplicateResponse {
                ok: false,
                result: None,
                error: Some(error),
            }),
        )
            .into_response()
    };

    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => {
            tracing::warn!("Rejected malformed replicate request: {}", rejection.body_text());
            return rejected(rejection.body_text());
        }
    };

    match state.node.on_replicate(req).await {
        Ok(response) => Json(response).into_response(),
        Err(Error::InvalidPayload(msg)) => {
            tracing::warn!("Rejected replicate request: {}", msg);
            rejected(msg)
        }
        Err(e) => error_response(e),
    }
}

async fn handle_read_clock(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.node.on_read_clock().await)
}

async fn handle_adjust_clock(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ClockAdjustment>,
) -> impl IntoResponse {
    Json(state.node.on_adjust_clock(req).await)
}

async fn handle_coordinator_time(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CoordinatorTime>,
) -> impl IntoResponse {
    Json(state.node.on_coordinator_time(req).await)
}

// ============ Operator Handlers ============

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.node.report().await)
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: !state.node.is_shutting_down(),
        node_id: state.node.node_id().to_string(),
        is_coordinator: state.node.election().is_coordinator().await,
    })
}

async fn handle_nodes(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.node.cluster().all_nodes().await)
}

async fn handle_locks(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.node.locks().status().await)
}

async fn handle_sweep(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let max_hold = state.node.config().max_lock_hold();
    let released = state.node.locks().sweep_expired(max_hold).await;
    Json(released)
}

async fn handle_replication(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.node.replication().status().await)
}

async fn handle_consistency(
    State(state): State<Arc<AppState>>,
    Path(resource_id): Path<String>,
) -> impl IntoResponse {
    Json(state.node.replication().check_consistency(&resource_id).await)
}

async fn handle_add_peer(
    State(state): State<Arc<AppState>>,
    Json(peer): Json<PeerConfig>,
) -> impl IntoResponse {
    let id = peer.id.clone();
    match state.node.add_peer(peer).await {
        Ok(()) => ActionResponse::ok(format!("Peer {} added", id)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_remove_peer(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> impl IntoResponse {
    match state.node.remove_peer(&node_id).await {
        Ok(removed) => Json(removed).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_election(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::info!("Election requested by operator");
    state.node.trigger_election();
    ActionResponse::ok("Election started")
}

async fn handle_sync_time(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.node.request_sync().await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_fail_replica(
    State(state): State<Arc<AppState>>,
    Path(replica_id): Path<String>,
) -> impl IntoResponse {
    match state.node.replication().fail_replica(&replica_id).await {
        Ok(()) => ActionResponse::ok(format!("Replica {} marked failed", replica_id)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_recover_replica(
    State(state): State<Arc<AppState>>,
    Path(replica_id): Path<String>,
) -> impl IntoResponse {
    match state.node.replication().recover_replica(&replica_id).await {
        Ok(reports) => Json(reports).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_write(
    State(state): State<Arc<AppState>>,
    Path(resource_id): Path<String>,
    Json(req): Json<WriteRequest>,
) -> impl IntoResponse {
    match state.node.write(&resource_id, &req.requester, req.payload).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_read(
    State(state): State<Arc<AppState>>,
    Path(resource_id): Path<String>,
) -> impl IntoResponse {
    match state.node.store().get(&resource_id).await {
        Some(record) => Json(record).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Resource {} not found", resource_id),
                code: "NOT_FOUND".to_string(),
            }),
        )
            .into_response(),
    }
}
