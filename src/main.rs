//! WolfCoord - Cluster Coordination Node
//!
//! Runs one coordination node: Bully leader election, per-resource locks,
//! quorum replication and Berkeley clock sync, served over HTTP.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfcoord::api::HttpServer;
use wolfcoord::config::{LoggingConfig, WolfCoordConfig};
use wolfcoord::error::Result;
use wolfcoord::node::ClusterNode;

/// WolfCoord - Cluster Coordination Node
#[derive(Parser)]
#[command(name = "wolfcoord")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfcoord.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [logging] level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordination node
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfcoord.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,

        /// Election priority (highest reachable node wins)
        #[arg(long, default_value_t = 1)]
        priority: i64,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&LoggingConfig::resolve(&cli.config, cli.log_level.as_deref()));

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init {
            output,
            node_id,
            priority,
        } => run_init(output, node_id, priority),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.as_str().into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.is_compact() {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the node
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting WolfCoord node...");

    let config = match WolfCoordConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    tracing::info!(
        "Loaded configuration for node: {} (priority {}, {} peers)",
        config.node.id,
        config.node.priority,
        config.cluster.peers.len()
    );

    let node = ClusterNode::from_config(config).await?;
    let server = HttpServer::new(node.clone());
    let tasks = node.start();

    tokio::select! {
        result = server.start() => {
            if let Err(e) = &result {
                tracing::error!("HTTP server failed: {}", e);
            }
            node.shutdown();
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            node.shutdown();
        }
    }

    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!("Background task ended abnormally: {}", e);
        }
    }

    tracing::info!("WolfCoord node {} stopped", node.node_id());
    Ok(())
}

/// Write a sample configuration file
fn run_init(output: PathBuf, node_id: String, priority: i64) -> Result<()> {
    let config_content = WolfCoordConfig::sample(&node_id, priority);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to list the other cluster members and their priorities.");
    println!("Then start with: wolfcoord start --config {}", output.display());

    Ok(())
}

fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfCoordConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Priority: {}", config.node.priority);
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Peers: {}", config.cluster.peers.len());
            println!("  Quorum Size: {}", config.quorum_size());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfCoordConfig::from_file(&config_path)?;

    println!("WolfCoord Node Information");
    println!("==========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Priority:         {}", config.node.priority);
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Advertise:        {}", config.advertise_address());
    println!();
    println!("Cluster Configuration:");
    for peer in &config.cluster.peers {
        println!("  Peer:           {} at {} (priority {})", peer.id, peer.address, peer.priority);
    }
    println!("  Probe:          {} ms", config.cluster.probe_interval_ms);
    println!("  Solicit:        {} ms", config.cluster.solicit_timeout_ms);
    println!("  Announce:       {} ms", config.cluster.announce_timeout_ms);
    println!();
    println!("Locks:");
    println!("  Request Timeout: {} ms", config.lock.request_timeout_ms);
    println!("  Max Hold:       {} ms", config.lock.max_hold_ms);
    println!();
    println!("Replication:");
    println!("  Factor:         {}", config.replication.replication_factor);
    println!("  Quorum Size:    {}", config.quorum_size());
    println!();
    println!("Clock Sync:");
    println!("  Round Interval: {} ms", config.clock.sync_interval_ms);
    println!("  Broadcast:      {} ms", config.clock.broadcast_interval_ms);

    Ok(())
}
