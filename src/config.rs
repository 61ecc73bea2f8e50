//! WolfCoord Configuration
//!
//! This module provides configuration structures for the WolfCoord
//! cluster coordination layer. Membership is static: every peer is listed
//! up front with an explicit numeric priority.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Main WolfCoord configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfCoordConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster membership and election timing
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Resource lock configuration
    #[serde(default)]
    pub lock: LockConfig,

    /// Replication configuration
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Clock synchronization configuration
    #[serde(default)]
    pub clock: ClockConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Election priority (higher wins)
    pub priority: i64,

    /// Address to bind for the HTTP listener (peer RPC + operator API)
    pub bind_address: String,

    /// Advertised address for other nodes to connect
    #[serde(default)]
    pub advertise_address: Option<String>,
}

/// A statically configured peer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerConfig {
    /// Peer node identifier
    pub id: String,
    /// Peer address (host:port)
    pub address: String,
    /// Peer election priority
    pub priority: i64,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Known peers
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Coordinator reachability probe interval in milliseconds
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// How long to wait for higher-priority peers to acknowledge a solicitation
    #[serde(default = "default_solicit_timeout_ms")]
    pub solicit_timeout_ms: u64,

    /// How long to wait for an announcement once a higher peer acknowledged
    #[serde(default = "default_announce_timeout_ms")]
    pub announce_timeout_ms: u64,

    /// Per-call deadline for peer RPCs
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// Delay before the first election after startup
    #[serde(default = "default_startup_election_delay_ms")]
    pub startup_election_delay_ms: u64,
}

/// Resource lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Default time a queued request waits before it is denied
    #[serde(default = "default_lock_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Locks held longer than this are force-released by the sweep
    #[serde(default = "default_max_hold_ms")]
    pub max_hold_ms: u64,

    /// Sweep interval in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Number of replicas; quorum is the ceiling of half of this
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,

    /// Backoff between retries to a failing peer
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// How long a completed update is kept before it is collected
    #[serde(default = "default_gc_grace_ms")]
    pub gc_grace_ms: u64,

    /// Interval of the background consistency sweep
    #[serde(default = "default_consistency_check_interval_ms")]
    pub consistency_check_interval_ms: u64,
}

/// Clock synchronization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockConfig {
    /// Berkeley round interval (coordinator only)
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,

    /// Coordinator time broadcast interval
    #[serde(default = "default_broadcast_interval_ms")]
    pub broadcast_interval_ms: u64,

    /// Startup skew is drawn uniformly from +/- this value
    #[serde(default = "default_initial_skew_ms")]
    pub initial_skew_ms: i64,

    /// Delay before the first round after winning an election
    #[serde(default = "default_post_election_sync_delay_ms")]
    pub post_election_sync_delay_ms: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_probe_interval_ms() -> u64 {
    5000
}

fn default_solicit_timeout_ms() -> u64 {
    2000
}

fn default_announce_timeout_ms() -> u64 {
    4000
}

fn default_rpc_timeout_ms() -> u64 {
    3000
}

fn default_startup_election_delay_ms() -> u64 {
    1000
}

fn default_lock_request_timeout_ms() -> u64 {
    10_000
}

fn default_max_hold_ms() -> u64 {
    60_000
}

fn default_sweep_interval_ms() -> u64 {
    30_000
}

fn default_replication_factor() -> usize {
    3
}

fn default_retry_backoff_ms() -> u64 {
    2000
}

fn default_gc_grace_ms() -> u64 {
    30_000
}

fn default_consistency_check_interval_ms() -> u64 {
    60_000
}

fn default_sync_interval_ms() -> u64 {
    30_000
}

fn default_broadcast_interval_ms() -> u64 {
    1000
}

fn default_initial_skew_ms() -> i64 {
    4000
}

fn default_post_election_sync_delay_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            probe_interval_ms: default_probe_interval_ms(),
            solicit_timeout_ms: default_solicit_timeout_ms(),
            announce_timeout_ms: default_announce_timeout_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            startup_election_delay_ms: default_startup_election_delay_ms(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_lock_request_timeout_ms(),
            max_hold_ms: default_max_hold_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replication_factor: default_replication_factor(),
            retry_backoff_ms: default_retry_backoff_ms(),
            gc_grace_ms: default_gc_grace_ms(),
            consistency_check_interval_ms: default_consistency_check_interval_ms(),
        }
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: default_sync_interval_ms(),
            broadcast_interval_ms: default_broadcast_interval_ms(),
            initial_skew_ms: default_initial_skew_ms(),
            post_election_sync_delay_ms: default_post_election_sync_delay_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LoggingConfig {
    /// Logging settings for `path`, with `level` overriding the file's level.
    /// A missing or unreadable file falls back to the defaults.
    pub fn resolve(path: &std::path::Path, level: Option<&str>) -> Self {
        let mut logging = WolfCoordConfig::from_file(path)
            .map(|config| config.logging)
            .unwrap_or_default();
        if let Some(level) = level {
            logging.level = level.to_string();
        }
        logging
    }

    /// Whether the compact formatter was requested
    pub fn is_compact(&self) -> bool {
        self.format == "compact"
    }
}

impl ReplicationConfig {
    /// Acknowledgments required before an update is Completed
    pub fn quorum_size(&self) -> usize {
        self.replication_factor.div_ceil(2)
    }
}

impl WolfCoordConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfCoordConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.replication.replication_factor == 0 {
            return Err(crate::Error::Config(
                "replication.replication_factor must be at least 1".into(),
            ));
        }

        let timeouts = [
            ("cluster.probe_interval_ms", self.cluster.probe_interval_ms),
            ("cluster.solicit_timeout_ms", self.cluster.solicit_timeout_ms),
            ("cluster.announce_timeout_ms", self.cluster.announce_timeout_ms),
            ("cluster.rpc_timeout_ms", self.cluster.rpc_timeout_ms),
            ("lock.sweep_interval_ms", self.lock.sweep_interval_ms),
            ("clock.sync_interval_ms", self.clock.sync_interval_ms),
            ("clock.broadcast_interval_ms", self.clock.broadcast_interval_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(crate::Error::Config(format!("{} must be greater than 0", name)));
            }
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "compact") {
            return Err(crate::Error::Config(format!(
                "logging.format must be \"pretty\" or \"compact\", got \"{}\"",
                self.logging.format
            )));
        }

        let mut seen = HashSet::new();
        seen.insert(self.node.id.as_str());
        for peer in &self.cluster.peers {
            if peer.id.is_empty() || peer.address.is_empty() {
                return Err(crate::Error::Config(
                    "cluster.peers entries need both id and address".into(),
                ));
            }
            if !seen.insert(peer.id.as_str()) {
                return Err(crate::Error::Config(format!(
                    "duplicate node id in cluster.peers: {}",
                    peer.id
                )));
            }
            if peer.priority == self.node.priority {
                tracing::warn!(
                    "Peer {} shares priority {} with this node; ties are broken by node id",
                    peer.id,
                    peer.priority
                );
            }
        }

        Ok(())
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }

    /// Calculate quorum size
    pub fn quorum_size(&self) -> usize {
        self.replication.quorum_size()
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.probe_interval_ms)
    }

    pub fn solicit_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.solicit_timeout_ms)
    }

    pub fn announce_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.announce_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.rpc_timeout_ms)
    }

    pub fn startup_election_delay(&self) -> Duration {
        Duration::from_millis(self.cluster.startup_election_delay_ms)
    }

    pub fn lock_request_timeout(&self) -> Duration {
        Duration::from_millis(self.lock.request_timeout_ms)
    }

    pub fn max_lock_hold(&self) -> Duration {
        Duration::from_millis(self.lock.max_hold_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.lock.sweep_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.replication.retry_backoff_ms)
    }

    pub fn gc_grace(&self) -> Duration {
        Duration::from_millis(self.replication.gc_grace_ms)
    }

    pub fn consistency_check_interval(&self) -> Duration {
        Duration::from_millis(self.replication.consistency_check_interval_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.clock.sync_interval_ms)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.clock.broadcast_interval_ms)
    }

    pub fn post_election_sync_delay(&self) -> Duration {
        Duration::from_millis(self.clock.post_election_sync_delay_ms)
    }

    /// Sample configuration file contents, as written by `wolfcoord init`
    pub fn sample(node_id: &str, priority: i64) -> String {
        format!(
            r#"# WolfCoord Configuration
# Generated configuration file

[node]
id = "{node_id}"
priority = {priority}
bind_address = "0.0.0.0:7700"
# advertise_address = "my-public-ip:7700"

[cluster]
peers = []
# peers = [
#     {{ id = "node-2", address = "node-2.example.com:7700", priority = 2 }},
#     {{ id = "node-3", address = "node-3.example.com:7700", priority = 3 }},
# ]
probe_interval_ms = 5000
solicit_timeout_ms = 2000
announce_timeout_ms = 4000
rpc_timeout_ms = 3000
startup_election_delay_ms = 1000

[lock]
request_timeout_ms = 10000
max_hold_ms = 60000
sweep_interval_ms = 30000

[replication]
replication_factor = 3
retry_backoff_ms = 2000
gc_grace_ms = 30000
consistency_check_interval_ms = 60000

[clock]
sync_interval_ms = 30000
broadcast_interval_ms = 1000
initial_skew_ms = 4000
post_election_sync_delay_ms = 1000

[api]
enabled = true
cors_enabled = false

[logging]
level = "info"
format = "pretty"
"#
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[node]
id = "node-1"
priority = 1
bind_address = "0.0.0.0:3000"

[cluster]
solicit_timeout_ms = 500
peers = [
    { id = "node-2", address = "10.0.0.2:3000", priority = 5 },
    { id = "node-3", address = "10.0.0.3:3000", priority = 3 },
]

[replication]
replication_factor = 3
"#;

    #[test]
    fn test_parse_config() {
        let config = WolfCoordConfig::from_str(SAMPLE).unwrap();
        assert_eq!(config.node.id, "node-1");
        assert_eq!(config.cluster.peers.len(), 2);
        assert_eq!(config.cluster.peers[0].priority, 5);
        assert_eq!(config.solicit_timeout(), Duration::from_millis(500));
        // Untouched sections fall back to defaults
        assert_eq!(config.cluster.announce_timeout_ms, 4000);
        assert_eq!(config.lock.max_hold_ms, 60_000);
        assert_eq!(config.quorum_size(), 2);
        assert_eq!(config.advertise_address(), "0.0.0.0:3000");
    }

    #[test]
    fn test_quorum_is_ceiling_of_half() {
        let mut replication = ReplicationConfig::default();
        for (factor, quorum) in [(1, 1), (2, 1), (3, 2), (4, 2), (5, 3)] {
            replication.replication_factor = factor;
            assert_eq!(replication.quorum_size(), quorum);
        }
    }

    #[test]
    fn test_rejects_duplicate_peer_ids() {
        let toml = r#"
[node]
id = "node-1"
priority = 1
bind_address = "0.0.0.0:3000"

[cluster]
peers = [
    { id = "node-2", address = "a:1", priority = 2 },
    { id = "node-2", address = "b:1", priority = 3 },
]
"#;
        let err = WolfCoordConfig::from_str(toml).unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_rejects_self_as_peer() {
        let toml = r#"
[node]
id = "node-1"
priority = 1
bind_address = "0.0.0.0:3000"

[cluster]
peers = [{ id = "node-1", address = "a:1", priority = 2 }]
"#;
        assert!(WolfCoordConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_rejects_zero_replication_factor() {
        let toml = r#"
[node]
id = "node-1"
priority = 1
bind_address = "0.0.0.0:3000"

[replication]
replication_factor = 0
"#;
        assert!(WolfCoordConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_sample_config_is_valid() {
        let config = WolfCoordConfig::from_str(&WolfCoordConfig::sample("node-7", 4)).unwrap();
        assert_eq!(config.node.id, "node-7");
        assert_eq!(config.node.priority, 4);
        assert!(config.cluster.peers.is_empty());
        assert_eq!(config.clock.initial_skew_ms, 4000);
    }

    #[test]
    fn test_logging_level_from_file_unless_overridden() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wolfcoord.toml");
        let toml = format!("{}\n[logging]\nlevel = \"debug\"\nformat = \"compact\"\n", SAMPLE);
        std::fs::write(&path, toml).unwrap();

        let from_file = LoggingConfig::resolve(&path, None);
        assert_eq!(from_file.level, "debug");
        assert!(from_file.is_compact());

        let overridden = LoggingConfig::resolve(&path, Some("warn"));
        assert_eq!(overridden.level, "warn");
        assert!(overridden.is_compact());

        let missing = LoggingConfig::resolve(&dir.path().join("absent.toml"), None);
        assert_eq!(missing.level, "info");
        assert!(!missing.is_compact());
    }

    #[test]
    fn test_rejects_unknown_log_format() {
        let toml = format!("{}\n[logging]\nformat = \"xml\"\n", SAMPLE);
        assert!(WolfCoordConfig::from_str(&toml).is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wolfcoord.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = WolfCoordConfig::from_file(&path).unwrap();
        assert_eq!(config.node.priority, 1);
    }
}
