//! WolfClusterCtl - Command line tool for managing WolfCluster nodes
//!
//! Usage:
//!   wolfclusterctl stats                 - Show node and cluster statistics
//!   wolfclusterctl peers                 - List cluster members
//!   wolfclusterctl join <address>        - Add a member
//!   wolfclusterctl remove <address>      - Remove a member
//!   wolfclusterctl backup -o <file>      - Download a backup
//!   wolfclusterctl restore ...           - Restore a node from a backup
//!   wolfclusterctl snapshot              - Take a snapshot now

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use wolfcluster::api::{ErrorResponse, JoinRequest, OkResponse, SnapshotResponse};
use wolfcluster::consensus::ClusterStats;
use wolfcluster::state::{Peer, PeerHealth};

/// WolfCluster Control Tool
#[derive(Parser)]
#[command(name = "wolfclusterctl")]
#[command(about = "Control and monitor WolfCluster nodes", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/wolfcluster/config.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node and cluster statistics
    Stats,
    /// List cluster members
    Peers,
    /// Add a member (run against the leader)
    Join {
        /// Cluster address of the new member (host:port)
        address: String,
        /// Member id (defaults to the address)
        #[arg(long)]
        id: Option<String>,
        /// Add as a non-voting member
        #[arg(long)]
        non_voter: bool,
    },
    /// Remove a member (run against the leader)
    Remove {
        /// Address or id of the member
        address: String,
    },
    /// Download a backup of the replicated state
    Backup {
        /// Output file
        #[arg(short, long, default_value = "wolfcluster.backup")]
        output: PathBuf,
    },
    /// Restore a standalone node from a backup
    Restore {
        /// Backup file on this machine, uploaded to the node
        #[arg(long, conflicts_with = "remote_file")]
        file: Option<PathBuf>,
        /// Backup file path on the node itself
        #[arg(long)]
        remote_file: Option<String>,
        /// Accept a backup older than the node's commit index
        #[arg(long)]
        force: bool,
    },
    /// Take a snapshot and compact the log
    Snapshot,
}

// ============ Config ============

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    api: ApiConfig,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfig {
    #[serde(default = "default_api_bind")]
    bind_address: String,
}

fn default_api_bind() -> String {
    "0.0.0.0:8080".to_string()
}

/// Resolve the API endpoint from the flag or the node's config file
fn resolve_endpoint(cli: &Cli) -> String {
    if let Some(e) = &cli.endpoint {
        return if e.starts_with("http") {
            e.clone()
        } else {
            format!("http://{}", e)
        };
    }

    let addr = std::fs::read_to_string(&cli.config)
        .ok()
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.api.bind_address)
        .unwrap_or_else(default_api_bind);

    match addr.strip_prefix("0.0.0.0:") {
        Some(port) => format!("http://127.0.0.1:{}", port),
        None => format!("http://{}", addr),
    }
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let endpoint = resolve_endpoint(&cli);
    let client = reqwest::Client::new();

    let result = match &cli.command {
        Commands::Stats => show_stats(&client, &endpoint).await,
        Commands::Peers => list_peers(&client, &endpoint).await,
        Commands::Join {
            address,
            id,
            non_voter,
        } => join(&client, &endpoint, address, id.clone(), *non_voter).await,
        Commands::Remove { address } => remove(&client, &endpoint, address).await,
        Commands::Backup { output } => backup(&client, &endpoint, output).await,
        Commands::Restore {
            file,
            remote_file,
            force,
        } => restore(&client, &endpoint, file.as_ref(), remote_file.as_deref(), *force).await,
        Commands::Snapshot => snapshot(&client, &endpoint).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

type CtlResult = Result<(), Box<dyn std::error::Error>>;

/// Turn a non-success response into an error carrying the server's message
async fn check(response: reqwest::Response) -> Result<reqwest::Response, Box<dyn std::error::Error>> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match response.json::<ErrorResponse>().await {
        Ok(err) => match err.leader {
            Some(leader) => Err(format!("{} ({}); leader is {}", err.error, err.code, leader).into()),
            None => Err(format!("{} ({})", err.error, err.code).into()),
        },
        Err(_) => Err(format!("API error: {}", status).into()),
    }
}

// ============ Commands ============

async fn show_stats(client: &reqwest::Client, endpoint: &str) -> CtlResult {
    let response = check(client.get(format!("{}/api/v1/stats", endpoint)).send().await?).await?;
    let stats: ClusterStats = response.json().await?;

    println!();
    println!("WolfCluster Node Statistics (wolfclusterctl v{})", env!("CARGO_PKG_VERSION"));
    println!("=================================================");
    println!();
    println!("Node:           {} ({})", stats.node_id, stats.address);
    println!("Role:           {}", stats.role);
    println!("Term:           {}", stats.term);
    println!(
        "Leader:         {}",
        stats.leader_address.as_deref().unwrap_or("NONE")
    );
    println!("Commit Index:   {}", stats.commit_index);
    println!("Last Applied:   {}", stats.last_applied_index);
    println!("Log:            {}..={}", stats.first_log_index, stats.last_log_index);
    println!("Snapshot:       {}", stats.snapshot_index);
    println!(
        "Membership:     version {}, {} voters, quorum {}",
        stats.membership_version,
        stats.voters(),
        stats.quorum_size
    );
    if let Some(pending) = stats.pending_membership_change {
        println!("Pending Change: index {}", pending);
    }
    println!();

    println!(
        "{:<22} {:<24} {:<10} {:<12} {:>8} {:>10}",
        "ID", "ADDRESS", "ROLE", "HEALTH", "JOINED", "MATCH"
    );
    println!("{}", "-".repeat(90));
    for peer in &stats.peers {
        let health_padded = format!("{:<12}", peer.health);
        let health = match peer.health {
            PeerHealth::Reachable => format!("\x1b[32m{}\x1b[0m", health_padded),
            PeerHealth::Unreachable => format!("\x1b[31m{}\x1b[0m", health_padded),
            PeerHealth::Unknown => health_padded,
        };
        let matched = peer
            .match_index
            .map(|m| m.to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<22} {:<24} {:<10} {} {:>8} {:>10}",
            peer.id,
            peer.address,
            peer.role.to_string(),
            health,
            peer.joined_at_index,
            matched
        );
    }
    println!();
    Ok(())
}

async fn list_peers(client: &reqwest::Client, endpoint: &str) -> CtlResult {
    let response = check(client.get(format!("{}/api/v1/peer", endpoint)).send().await?).await?;
    let peers: Vec<Peer> = response.json().await?;

    println!("{:<22} {:<24} {:<10} {:>8}", "ID", "ADDRESS", "ROLE", "JOINED");
    println!("{}", "-".repeat(67));
    for peer in &peers {
        println!(
            "{:<22} {:<24} {:<10} {:>8}",
            peer.id,
            peer.address,
            peer.role.to_string(),
            peer.joined_at_index
        );
    }
    Ok(())
}

async fn join(
    client: &reqwest::Client,
    endpoint: &str,
    address: &str,
    id: Option<String>,
    non_voter: bool,
) -> CtlResult {
    let request = JoinRequest {
        address: address.to_string(),
        id,
        non_voter,
    };
    let response = client
        .post(format!("{}/api/v1/peer", endpoint))
        .json(&request)
        .send()
        .await?;
    let result: OkResponse = check(response).await?.json().await?;
    println!("{}", result.message);
    Ok(())
}

async fn remove(client: &reqwest::Client, endpoint: &str, address: &str) -> CtlResult {
    let response = client
        .delete(format!("{}/api/v1/peer", endpoint))
        .query(&[("address", address)])
        .send()
        .await?;
    let result: OkResponse = check(response).await?.json().await?;
    println!("{}", result.message);
    Ok(())
}

async fn backup(client: &reqwest::Client, endpoint: &str, output: &PathBuf) -> CtlResult {
    let response = check(client.get(format!("{}/api/v1/db/backup", endpoint)).send().await?).await?;
    let bytes = response.bytes().await?;
    std::fs::write(output, &bytes)?;
    println!("Backup written to {} ({} bytes)", output.display(), bytes.len());
    Ok(())
}

async fn restore(
    client: &reqwest::Client,
    endpoint: &str,
    file: Option<&PathBuf>,
    remote_file: Option<&str>,
    force: bool,
) -> CtlResult {
    let force = if force { "true" } else { "false" };
    let response = match (file, remote_file) {
        (Some(path), _) => {
            let bytes = std::fs::read(path)?;
            client
                .post(format!("{}/api/v1/db/restore", endpoint))
                .query(&[("force", force)])
                .body(bytes)
                .send()
                .await?
        }
        (None, Some(remote)) => {
            client
                .get(format!("{}/api/v1/db/restore", endpoint))
                .query(&[("file", remote), ("force", force)])
                .send()
                .await?
        }
        (None, None) => return Err("either --file or --remote-file is required".into()),
    };
    let result: OkResponse = check(response).await?.json().await?;
    println!("{}", result.message);
    Ok(())
}

async fn snapshot(client: &reqwest::Client, endpoint: &str) -> CtlResult {
    let response = check(client.post(format!("{}/api/v1/db/snapshot", endpoint)).send().await?).await?;
    let result: SnapshotResponse = response.json().await?;
    println!("Snapshot taken at index {}", result.index);
    Ok(())
}
