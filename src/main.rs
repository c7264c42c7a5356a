//! WolfCluster - Consensus-Backed Cluster Manager
//!
//! Runs a cluster node: the consensus engine, its peer transport and the
//! HTTP API.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfcluster::api::HttpServer;
use wolfcluster::config::WolfClusterConfig;
use wolfcluster::error::Result;
use wolfcluster::Cluster;

/// WolfCluster - Consensus-Backed Cluster Manager
#[derive(Parser)]
#[command(name = "wolfcluster")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfcluster.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [logging]
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Start {
        /// Create a new cluster from this node and the configured peers
        #[arg(long)]
        bootstrap: bool,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfcluster.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { bootstrap } => {
            let config = WolfClusterConfig::from_file(&cli.config)?;
            let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
            init_logging(level, &config.logging.format);
            run_start(config, bootstrap).await
        }
        Commands::Init { output, node_id } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_init(output, node_id)
        }
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the node
async fn run_start(mut config: WolfClusterConfig, bootstrap: bool) -> Result<()> {
    config.cluster.bootstrap |= bootstrap;
    tracing::info!(
        "Starting WolfCluster node {} on {}",
        config.node_id(),
        config.node.bind_address
    );

    let cluster = match Cluster::start(&config).await {
        Ok(c) => Arc::new(c),
        Err(e) => {
            tracing::error!("Failed to start node: {}", e);
            return Err(e);
        }
    };

    let stats = cluster.statistics();
    tracing::info!(
        "Node ready: term {}, commit index {}, {} members",
        stats.term,
        stats.commit_index,
        stats.peers.len()
    );

    let http = HttpServer::new(config.api.clone(), Arc::clone(&cluster));
    let http_enabled = config.api.enabled;

    tokio::select! {
        result = http.start(), if http_enabled => {
            if let Err(e) = result {
                tracing::error!("HTTP API failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    cluster.shutdown().await;
    tracing::info!("Node stopped");
    Ok(())
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = format!(r#"# WolfCluster Configuration
# Generated configuration file

[node]
id = "{node_id}"
bind_address = "0.0.0.0:7654"
data_dir = "/var/lib/wolfcluster/{node_id}"
# advertise_address = "my-public-ip:7654"

[wal]
compression = true
segment_size_mb = 64
fsync = true

[cluster]
bootstrap = false
peers = []
# peers = ["node-2=node-2.example.com:7654", "node-3=node-3.example.com:7654"]
tick_interval_ms = 50
heartbeat_interval_ms = 150
election_timeout_min_ms = 1000
election_timeout_max_ms = 2000
leader_lease_timeout_ms = 2000
max_batch_entries = 256
apply_timeout_ms = 5000

[snapshot]
threshold = 8192
trailing_logs = 1024
retain = 2

[api]
enabled = true
bind_address = "0.0.0.0:8080"
cors_enabled = false

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure your cluster settings.");
    println!(
        "Then start the first node with: wolfcluster --config {} start --bootstrap",
        output.display()
    );

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfClusterConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node_id());
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Bootstrap Peers: {}", config.cluster.peers.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfClusterConfig::from_file(&config_path)?;
    let core = config.core_config();

    println!("WolfCluster Node Information");
    println!("============================");
    println!();
    println!("Node ID:          {}", config.node_id());
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Advertise:        {}", config.advertise_address());
    println!("Data Directory:   {}", config.data_dir().display());
    println!();
    println!("Log Configuration:");
    println!("  Compression:    {}", config.wal.compression);
    println!("  Segment Size:   {} MB", config.wal.segment_size_mb);
    println!("  Fsync:          {}", config.wal.fsync);
    println!();
    println!("Cluster Configuration:");
    println!("  Bootstrap:      {}", config.cluster.bootstrap);
    println!("  Peers:          {:?}", config.cluster.peers);
    println!("  Tick:           {} ms", config.cluster.tick_interval_ms);
    println!("  Heartbeat:      {} ms ({} ticks)", config.cluster.heartbeat_interval_ms, core.heartbeat_ticks);
    println!(
        "  Election:       {}-{} ms ({}-{} ticks)",
        config.cluster.election_timeout_min_ms,
        config.cluster.election_timeout_max_ms,
        core.election_ticks_min,
        core.election_ticks_max
    );
    println!();
    println!("Snapshots:");
    println!("  Threshold:      {} entries", config.snapshot.threshold);
    println!("  Trailing Logs:  {}", config.snapshot.trailing_logs);
    println!("  Retain:         {}", config.snapshot.retain);

    Ok(())
}
