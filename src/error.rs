//! WolfCoord Error Types

use thiserror::Error;

/// Result type alias for WolfCoord operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfCoord error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Network errors (peer presumed unavailable for this call only)
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // Lock errors
    #[error("Resource {resource_id} is held by another requester; request from {requester} denied")]
    ResourceConflict { resource_id: String, requester: String },

    #[error("{requester} cannot release {resource_id}: current holder is {holder:?}")]
    PermissionDenied {
        resource_id: String,
        requester: String,
        holder: Option<String>,
    },

    // Replication errors
    #[error("Replica divergence on {resource_id}: {replicas:?} disagree with the reference snapshot")]
    DataDivergence {
        resource_id: String,
        replicas: Vec<String>,
    },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Replica not found: {0}")]
    ReplicaNotFound(String),

    // Cluster errors
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Not coordinator: current coordinator is {0:?}")]
    NotCoordinator(Option<String>),

    // Serialization / I/O errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is a transient network failure
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::ConnectionFailed { .. } | Error::ConnectionTimeout(_)
        )
    }

    /// Short machine-readable code used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) | Error::ConfigParse(_) => "CONFIG",
            Error::Network(_) | Error::ConnectionFailed { .. } | Error::ConnectionTimeout(_) => {
                "TRANSIENT_NETWORK"
            }
            Error::ResourceConflict { .. } => "RESOURCE_CONFLICT",
            Error::PermissionDenied { .. } => "PROTOCOL_VIOLATION",
            Error::DataDivergence { .. } => "DATA_DIVERGENCE",
            Error::InvalidPayload(_) | Error::Json(_) => "INVALID_PAYLOAD",
            Error::ReplicaNotFound(_) | Error::NodeNotFound(_) => "NOT_FOUND",
            Error::NotCoordinator(_) => "NOT_COORDINATOR",
            Error::Io(_) | Error::Internal(_) => "INTERNAL",
            Error::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            let address = e
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            Error::ConnectionTimeout(address)
        } else if e.is_connect() {
            Error::ConnectionFailed {
                address: e.url().map(|u| u.to_string()).unwrap_or_default(),
                reason: e.to_string(),
            }
        } else {
            Error::Network(e.to_string())
        }
    }
}
