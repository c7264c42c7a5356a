//! WolfCluster Configuration
//!
//! This module provides configuration structures for the WolfCluster
//! cluster manager.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::consensus::CoreConfig;

/// Main WolfCluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfClusterConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Transport log configuration
    #[serde(default)]
    pub wal: WalConfig,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Snapshot configuration
    #[serde(default)]
    pub snapshot: SnapshotConfig,

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
    /// Unique node identifier (defaults to the advertised address)
    #[serde(default)]
    pub id: String,

    /// Address to bind for cluster communication
    pub bind_address: String,

    /// Data directory for the log, hard state and snapshots
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Advertised address for other nodes to connect
    #[serde(default)]
    pub advertise_address: Option<String>,
}

/// Transport log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Enable LZ4 compression for log frames
    #[serde(default = "default_compression")]
    pub compression: bool,

    /// Maximum segment size in megabytes
    #[serde(default = "default_segment_size_mb")]
    pub segment_size_mb: u64,

    /// Use fsync for durability (slower but safer)
    #[serde(default = "default_fsync")]
    pub fsync: bool,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Bootstrap a new cluster from this node when its log is empty
    #[serde(default)]
    pub bootstrap: bool,

    /// Initial voters written by bootstrap, as `id=address` or `address`
    #[serde(default)]
    pub peers: Vec<String>,

    /// Logical clock tick in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Minimum election timeout in milliseconds (randomized)
    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,

    /// Maximum election timeout in milliseconds (randomized)
    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,

    /// A leader without majority contact for this long steps down
    #[serde(default = "default_leader_lease_timeout_ms")]
    pub leader_lease_timeout_ms: u64,

    /// Maximum entries per replication batch
    #[serde(default = "default_max_batch_entries")]
    pub max_batch_entries: usize,

    /// How long a proposal waits for its entry to apply
    #[serde(default = "default_apply_timeout_ms")]
    pub apply_timeout_ms: u64,

    /// Outbound queue depth per peer
    #[serde(default = "default_peer_queue_depth")]
    pub peer_queue_depth: usize,
}

/// Snapshot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Applied entries since the last snapshot that trigger a new one (0 = manual only)
    #[serde(default = "default_snapshot_threshold")]
    pub threshold: u64,

    /// Entries kept in the log behind a snapshot for lagging followers
    #[serde(default = "default_trailing_logs")]
    pub trailing_logs: u64,

    /// Number of snapshot files kept on disk
    #[serde(default = "default_retain")]
    pub retain: usize,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

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
fn default_compression() -> bool {
    true
}

fn default_segment_size_mb() -> u64 {
    64
}

fn default_fsync() -> bool {
    true
}

fn default_tick_interval_ms() -> u64 {
    50
}

fn default_heartbeat_interval_ms() -> u64 {
    150
}

fn default_election_timeout_min_ms() -> u64 {
    1000
}

fn default_election_timeout_max_ms() -> u64 {
    2000
}

fn default_leader_lease_timeout_ms() -> u64 {
    2000
}

fn default_max_batch_entries() -> usize {
    256
}

fn default_apply_timeout_ms() -> u64 {
    5000
}

fn default_peer_queue_depth() -> usize {
    1024
}

fn default_snapshot_threshold() -> u64 {
    8192
}

fn default_trailing_logs() -> u64 {
    1024
}

fn default_retain() -> usize {
    2
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfcluster")
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            compression: default_compression(),
            segment_size_mb: default_segment_size_mb(),
            fsync: default_fsync(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bootstrap: false,
            peers: Vec::new(),
            tick_interval_ms: default_tick_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            leader_lease_timeout_ms: default_leader_lease_timeout_ms(),
            max_batch_entries: default_max_batch_entries(),
            apply_timeout_ms: default_apply_timeout_ms(),
            peer_queue_depth: default_peer_queue_depth(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            threshold: default_snapshot_threshold(),
            trailing_logs: default_trailing_logs(),
            retain: default_retain(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
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

impl WolfClusterConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfClusterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration for a node with every other setting at its default
    pub fn for_node(bind_address: &str, data_dir: PathBuf) -> Self {
        Self {
            node: NodeConfig {
                id: String::new(),
                bind_address: bind_address.to_string(),
                data_dir,
                advertise_address: None,
            },
            wal: WalConfig::default(),
            cluster: ClusterConfig::default(),
            snapshot: SnapshotConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        let c = &self.cluster;
        if c.tick_interval_ms == 0 {
            return Err(crate::Error::Config("cluster.tick_interval_ms must be positive".into()));
        }
        if c.election_timeout_min_ms > c.election_timeout_max_ms {
            return Err(crate::Error::Config(
                "cluster.election_timeout_min_ms exceeds election_timeout_max_ms".into(),
            ));
        }
        if c.heartbeat_interval_ms >= c.election_timeout_min_ms {
            return Err(crate::Error::Config(
                "cluster.heartbeat_interval_ms must be below election_timeout_min_ms".into(),
            ));
        }
        if c.max_batch_entries == 0 {
            return Err(crate::Error::Config("cluster.max_batch_entries must be positive".into()));
        }
        for peer in &c.peers {
            parse_peer_spec(peer)?;
        }

        if self.snapshot.retain == 0 {
            return Err(crate::Error::Config("snapshot.retain must be at least 1".into()));
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

    /// Node identifier; nodes are identified by address unless configured otherwise
    pub fn node_id(&self) -> &str {
        if self.node.id.is_empty() {
            self.advertise_address()
        } else {
            &self.node.id
        }
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the WAL directory path
    pub fn wal_dir(&self) -> PathBuf {
        self.node.data_dir.join("wal")
    }

    /// Get the state directory path
    pub fn state_dir(&self) -> PathBuf {
        self.node.data_dir.join("state")
    }

    /// Get the snapshot directory path
    pub fn snapshot_dir(&self) -> PathBuf {
        self.node.data_dir.join("snapshots")
    }

    /// Get tick interval as Duration
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.tick_interval_ms)
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_interval_ms)
    }

    /// Get apply timeout as Duration
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.apply_timeout_ms)
    }

    /// Parse the bootstrap peer list into (id, address) pairs
    pub fn bootstrap_peers(&self) -> crate::Result<Vec<(String, String)>> {
        self.cluster.peers.iter().map(|p| parse_peer_spec(p)).collect()
    }

    /// Translate millisecond settings into logical ticks for the consensus core
    pub fn core_config(&self) -> CoreConfig {
        let tick = self.cluster.tick_interval_ms.max(1);
        let ticks = |ms: u64| (ms / tick).max(1);
        CoreConfig {
            heartbeat_ticks: ticks(self.cluster.heartbeat_interval_ms),
            election_ticks_min: ticks(self.cluster.election_timeout_min_ms),
            election_ticks_max: ticks(self.cluster.election_timeout_max_ms),
            lease_ticks: ticks(self.cluster.leader_lease_timeout_ms),
            max_batch_entries: self.cluster.max_batch_entries,
            snapshot_threshold: self.snapshot.threshold,
            trailing_logs: self.snapshot.trailing_logs,
            seed: None,
        }
    }
}

/// Parse `id=address` or a bare `address` (the id then equals the address)
pub fn parse_peer_spec(spec: &str) -> crate::Result<(String, String)> {
    let spec = spec.trim();
    let (id, addr) = match spec.split_once('=') {
        Some((id, addr)) => (id.trim(), addr.trim()),
        None => (spec, spec),
    };
    if id.is_empty() || addr.is_empty() {
        return Err(crate::Error::Config(format!("invalid peer entry '{}'", spec)));
    }
    Ok((id.to_string(), addr.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
bind_address = "10.0.0.1:7654"
data_dir = "/var/lib/wolfcluster"

[wal]
compression = true

[cluster]
bootstrap = true
peers = ["n2=10.0.0.2:7654", "10.0.0.3:7654"]
tick_interval_ms = 100
heartbeat_interval_ms = 300
election_timeout_min_ms = 1500
election_timeout_max_ms = 3000
"#;

        let config = WolfClusterConfig::from_str(toml).unwrap();
        assert_eq!(config.node_id(), "10.0.0.1:7654");
        assert_eq!(config.cluster.peers.len(), 2);

        let peers = config.bootstrap_peers().unwrap();
        assert_eq!(peers[0], ("n2".to_string(), "10.0.0.2:7654".to_string()));
        assert_eq!(peers[1].0, "10.0.0.3:7654");

        let core = config.core_config();
        assert_eq!(core.heartbeat_ticks, 3);
        assert_eq!(core.election_ticks_min, 15);
        assert_eq!(core.election_ticks_max, 30);
        assert_eq!(config.snapshot.retain, 2);
    }

    #[test]
    fn test_reject_bad_timeouts() {
        let toml = r#"
[node]
bind_address = "127.0.0.1:7654"

[cluster]
heartbeat_interval_ms = 2000
election_timeout_min_ms = 1000
"#;
        assert!(WolfClusterConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_peer_spec() {
        assert!(parse_peer_spec("=addr").is_err());
        assert_eq!(
            parse_peer_spec(" a = b ").unwrap(),
            ("a".to_string(), "b".to_string())
        );
    }
}
