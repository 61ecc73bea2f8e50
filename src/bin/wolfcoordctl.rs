//! WolfCoordCtl - Command line tool for managing WolfCoord clusters
//!
//! Usage:
//!   wolfcoordctl status              - Show local node status
//!   wolfcoordctl nodes               - Show cluster members
//!   wolfcoordctl elect               - Start an election on this node
//!   wolfcoordctl consistency <id>    - Compare replicas of a resource

use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;

use wolfcoord::config::WolfCoordConfig;
use wolfcoord::state::{ClusterSummary, NodeState};

/// WolfCoord Cluster Control Tool
#[derive(Parser)]
#[command(name = "wolfcoordctl")]
#[command(about = "Control and monitor WolfCoord clusters", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "wolfcoord.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show status of the local node
    Status,
    /// List cluster members and their reachability
    Nodes,
    /// Start a Bully election on this node
    Elect,
    /// Request a clock sync (aligns to the coordinator if possible)
    SyncTime,
    /// Show held locks and waiting requests
    Locks,
    /// Add a peer at runtime
    AddPeer {
        /// Peer node ID
        id: String,
        /// Peer address (host:port)
        address: String,
        /// Peer election priority
        #[arg(long, default_value_t = 0)]
        priority: i64,
    },
    /// Remove a peer at runtime
    RemovePeer {
        /// Peer node ID
        id: String,
    },
    /// Compare the local replicas of a resource
    Consistency {
        /// Resource ID
        resource: String,
    },
    /// Check configuration file for errors
    CheckConfig {
        /// Path to config file to check (defaults to --config path)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

// ============ API Response Types ============

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    node_id: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    uptime_secs: i64,
    cluster: ClusterSummary,
    election: ElectionInfo,
    clock: ClockInfo,
    replication: ReplicationInfo,
    locks: LockTotals,
}

#[derive(Debug, Deserialize)]
struct ElectionInfo {
    #[serde(default)]
    phase: String,
    #[serde(default)]
    election_id: u64,
    #[serde(default)]
    is_coordinator: bool,
}

#[derive(Debug, Deserialize)]
struct ClockInfo {
    #[serde(default)]
    logical_time: i64,
    #[serde(default)]
    cumulative_offset: i64,
    #[serde(default)]
    last_sync: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ReplicationInfo {
    #[serde(default)]
    replication_factor: usize,
    #[serde(default)]
    quorum: usize,
    #[serde(default)]
    pending_updates: usize,
    #[serde(default)]
    completed_total: u64,
}

#[derive(Debug, Deserialize)]
struct LockTotals {
    #[serde(default)]
    total_locks: usize,
    #[serde(default)]
    total_queued: usize,
}

#[derive(Debug, Deserialize)]
struct LockStatus {
    #[serde(default)]
    locks: Vec<HeldLock>,
    #[serde(default)]
    queues: Vec<ResourceQueue>,
}

#[derive(Debug, Deserialize)]
struct HeldLock {
    resource_id: String,
    holder: String,
    #[serde(default)]
    held_for_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ResourceQueue {
    resource_id: String,
    #[serde(default)]
    waiting: Vec<WaitingRequest>,
}

#[derive(Debug, Deserialize)]
struct WaitingRequest {
    requester: String,
    #[serde(default)]
    waited_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ConsistencyReport {
    resource_id: String,
    consistent: bool,
    #[serde(default)]
    divergent: Vec<String>,
    #[serde(default)]
    replicas: Vec<ReplicaSnapshot>,
}

#[derive(Debug, Deserialize)]
struct ReplicaSnapshot {
    replica_id: String,
    #[serde(default)]
    health: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct ActionResponse {
    success: bool,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Determine API endpoint
    let endpoint = match &cli.endpoint {
        Some(e) => e.clone(),
        None => endpoint_from_config(&cli.config),
    };

    let result = match &cli.command {
        Commands::Status => show_status(&endpoint).await,
        Commands::Nodes => list_nodes(&endpoint).await,
        Commands::Elect => elect(&endpoint).await,
        Commands::SyncTime => sync_time(&endpoint).await,
        Commands::Locks => show_locks(&endpoint).await,
        Commands::AddPeer {
            id,
            address,
            priority,
        } => add_peer(&endpoint, id, address, *priority).await,
        Commands::RemovePeer { id } => remove_peer(&endpoint, id).await,
        Commands::Consistency { resource } => consistency(&endpoint, resource).await,
        Commands::CheckConfig { file } => {
            let config_path = file.clone().unwrap_or_else(|| cli.config.clone());
            check_config(&config_path)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// The node's bind address from its config, with wildcard hosts mapped to localhost
fn endpoint_from_config(path: &PathBuf) -> String {
    const FALLBACK: &str = "http://127.0.0.1:7700";

    let Ok(config) = WolfCoordConfig::from_file(path) else {
        return FALLBACK.to_string();
    };
    let addr = config.node.bind_address;
    match addr.strip_prefix("0.0.0.0:") {
        Some(port) => format!("http://127.0.0.1:{}", port),
        None => format!("http://{}", addr),
    }
}

/// Turn a non-2xx response into an error carrying the API's message
async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, Box<dyn std::error::Error>> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    match response.json::<ErrorResponse>().await {
        Ok(body) => Err(format!("API error {} ({}): {}", status, body.code, body.error).into()),
        Err(_) => Err(format!("API error: {}", status).into()),
    }
}

// ============ Commands ============

async fn show_status(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/status", endpoint);
    let response = check_response(reqwest::Client::new().get(&url).send().await?).await?;
    let status: StatusResponse = response.json().await?;

    println!();
    println!("Node Status (wolfcoord v{})", status.version);
    println!("===========");
    println!();
    println!("Node ID:      {}", status.node_id);
    println!(
        "Role:         {}",
        if status.election.is_coordinator { "COORDINATOR" } else { "Follower" }
    );
    println!(
        "Coordinator:  {}",
        status.cluster.coordinator_id.as_deref().unwrap_or("NONE")
    );
    println!("Election:     {} (round {})", status.election.phase, status.election.election_id);
    println!(
        "Cluster:      {} nodes, {} reachable",
        status.cluster.total_nodes, status.cluster.reachable_nodes
    );
    println!("Uptime:       {}s", status.uptime_secs);
    println!();
    println!("Logical Clock: {} (offset {} ms)", status.clock.logical_time, status.clock.cumulative_offset);
    match status.clock.last_sync {
        Some(at) => println!("Last Sync:     {}", at),
        None => println!("Last Sync:     never"),
    }
    println!();
    println!(
        "Replication:  factor {}, quorum {}, {} pending, {} completed",
        status.replication.replication_factor,
        status.replication.quorum,
        status.replication.pending_updates,
        status.replication.completed_total
    );
    println!(
        "Locks:        {} held, {} queued",
        status.locks.total_locks, status.locks.total_queued
    );
    println!();

    Ok(())
}

async fn list_nodes(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/cluster/nodes", endpoint);
    let response = check_response(reqwest::Client::new().get(&url).send().await?).await?;
    let nodes: Vec<NodeState> = response.json().await?;

    println!();
    println!("WolfCoord Cluster Members (wolfcoordctl v{})", env!("CARGO_PKG_VERSION"));
    println!("========================================");
    println!();

    println!("{:<20} {:<25} {:<10} {:<12} {:<12}",
        "NODE ID", "ADDRESS", "PRIORITY", "STATUS", "ROLE");
    println!("{}", "-".repeat(80));

    for node in &nodes {
        // Pad before adding color codes
        let status_padded = format!("{:<12}", node.status.to_string());
        let status_colored = match node.status.to_string().as_str() {
            "REACHABLE" => format!("\x1b[32m{}\x1b[0m", status_padded),
            "UNREACHABLE" => format!("\x1b[31m{}\x1b[0m", status_padded),
            _ => status_padded,
        };

        let role_padded = format!("{:<12}", node.role.to_string());
        let role_colored = match node.role.to_string().as_str() {
            "COORDINATOR" => format!("\x1b[1;34m{}\x1b[0m", role_padded),
            _ => role_padded,
        };

        println!("{:<20} {:<25} {:<10} {} {}",
            node.id,
            node.address,
            node.priority,
            status_colored,
            role_colored
        );
    }
    println!();

    Ok(())
}

async fn elect(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/admin/election", endpoint);
    let response = check_response(reqwest::Client::new().post(&url).send().await?).await?;
    let result: ActionResponse = response.json().await?;

    if result.success {
        println!("{}", result.message);
        println!("Run 'wolfcoordctl status' in a few seconds to see the outcome");
    } else {
        println!("Election request failed: {}", result.message);
    }

    Ok(())
}

async fn sync_time(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/admin/sync-time", endpoint);
    let response = check_response(reqwest::Client::new().post(&url).send().await?).await?;
    let outcome: Value = response.json().await?;

    match outcome["outcome"].as_str() {
        Some("round") => println!(
            "Berkeley round completed: mean {} across {} clocks",
            outcome["mean"], outcome["participants"]
        ),
        Some("aligned") => println!("Aligned to coordinator time (delta {} ms)", outcome["delta"]),
        _ => println!("No coordinator time known yet; wait for the next sync round"),
    }

    Ok(())
}

async fn show_locks(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/locks", endpoint);
    let response = check_response(reqwest::Client::new().get(&url).send().await?).await?;
    let status: LockStatus = response.json().await?;

    println!();
    if status.locks.is_empty() {
        println!("No locks held");
    } else {
        println!("{:<30} {:<20} {:<12}", "RESOURCE", "HOLDER", "HELD");
        println!("{}", "-".repeat(62));
        for lock in &status.locks {
            println!("{:<30} {:<20} {:<12}", lock.resource_id, lock.holder, format!("{} ms", lock.held_for_ms));
        }
    }

    for queue in status.queues.iter().filter(|q| !q.waiting.is_empty()) {
        println!();
        println!("Waiting on {}:", queue.resource_id);
        for (position, request) in queue.waiting.iter().enumerate() {
            println!("  {}. {} ({} ms)", position + 1, request.requester, request.waited_ms);
        }
    }
    println!();

    Ok(())
}

async fn add_peer(
    endpoint: &str,
    id: &str,
    address: &str,
    priority: i64,
) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/admin/peers", endpoint);
    let body = serde_json::json!({ "id": id, "address": address, "priority": priority });
    let response = check_response(reqwest::Client::new().post(&url).json(&body).send().await?).await?;
    let result: ActionResponse = response.json().await?;
    println!("{}", result.message);
    Ok(())
}

async fn remove_peer(endpoint: &str, id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/admin/peers/{}", endpoint, id);
    let response = check_response(reqwest::Client::new().delete(&url).send().await?).await?;
    let removed: NodeState = response.json().await?;
    println!("Removed {} ({})", removed.id, removed.address);
    Ok(())
}

async fn consistency(endpoint: &str, resource: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/replication/consistency/{}", endpoint, resource);
    let response = check_response(reqwest::Client::new().get(&url).send().await?).await?;
    let report: ConsistencyReport = response.json().await?;

    println!();
    if report.consistent {
        println!("\x1b[1;32m✓\x1b[0m {} is consistent across {} replicas", report.resource_id, report.replicas.len());
    } else {
        println!(
            "\x1b[1;31m✗\x1b[0m {} diverges on: {}",
            report.resource_id,
            report.divergent.join(", ")
        );
    }
    println!();
    for replica in &report.replicas {
        println!("  {:<12} {:<8} {}", replica.replica_id, replica.health, replica.data);
    }
    println!();

    Ok(())
}

// ============ Config Check ============

fn check_config(path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    println!();
    println!("\x1b[1;36m╔══════════════════════════════════════════════════════════════╗\x1b[0m");
    println!("\x1b[1;36m║\x1b[0m            \x1b[1;37mWolfCoord Configuration Check\x1b[0m                     \x1b[1;36m║\x1b[0m");
    println!("\x1b[1;36m╚══════════════════════════════════════════════════════════════╝\x1b[0m");
    println!();

    if !path.exists() {
        println!("\x1b[1;31m✗ ERROR:\x1b[0m Config file not found: {}", path.display());
        return Ok(());
    }
    println!("\x1b[1;32m✓\x1b[0m Config file: {}", path.display());

    let config = match WolfCoordConfig::from_file(path) {
        Ok(c) => c,
        Err(e) => {
            println!("\x1b[1;31m✗ ERROR:\x1b[0m {}", e);
            println!();
            println!("\x1b[1;31mConfiguration has errors that must be fixed!\x1b[0m");
            println!();
            return Ok(());
        }
    };
    println!("\x1b[1;32m✓\x1b[0m Node ID: {} (priority {})", config.node.id, config.node.priority);

    let mut warnings = Vec::new();

    let advertise = config.advertise_address();
    if advertise.starts_with("0.0.0.0") || advertise.starts_with("127.0") {
        warnings.push(format!(
            "[node] advertise address '{}' is not reachable from other hosts; set advertise_address",
            advertise
        ));
    } else {
        println!("\x1b[1;32m✓\x1b[0m Advertise address: {}", advertise);
    }

    if config.cluster.peers.is_empty() {
        warnings.push("[cluster] peers not configured - single node mode".to_string());
    } else {
        println!("\x1b[1;32m✓\x1b[0m Peers configured: {} nodes", config.cluster.peers.len());
        for peer in &config.cluster.peers {
            println!("    - {} at {} (priority {})", peer.id, peer.address, peer.priority);
            if peer.address == advertise {
                warnings.push(format!(
                    "Peer {} uses this node's own address '{}' - remove self from peers",
                    peer.id, peer.address
                ));
            }
            if peer.priority == config.node.priority {
                warnings.push(format!(
                    "Peer {} shares priority {} with this node; node id breaks the tie",
                    peer.id, peer.priority
                ));
            }
        }
    }

    let members = config.cluster.peers.len() + 1;
    if config.replication.replication_factor > members {
        warnings.push(format!(
            "[replication] replication_factor {} exceeds cluster size {}; updates will never reach quorum",
            config.replication.replication_factor, members
        ));
    }

    if config.cluster.announce_timeout_ms <= config.cluster.solicit_timeout_ms {
        warnings.push(
            "[cluster] announce_timeout_ms should be longer than solicit_timeout_ms".to_string(),
        );
    }

    println!();
    if !warnings.is_empty() {
        println!("\x1b[1;33mWarnings ({}):\x1b[0m", warnings.len());
        for w in &warnings {
            println!("  \x1b[33m⚠\x1b[0m  {}", w);
        }
        println!();
    }
    println!("\x1b[1;32m✓ Configuration looks good!\x1b[0m");
    println!();

    Ok(())
}
