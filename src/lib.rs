//! WolfCluster - Consensus-Backed Cluster Manager
//!
//! Keeps a replicated log consistent across a group of nodes using
//! leader-based consensus, and manages who belongs to the group.
//!
//! # Architecture
//!
//! One node is elected leader per term. It appends entries to its
//! transport log and replicates them to followers; an entry commits once
//! a majority of voters has stored it, and every node then applies it to
//! its state machine in log order. Membership changes are entries too,
//! applied one at a time.
//!
//! # Features
//!
//! - Segmented, checksummed transport log with optional compression
//! - Leader election with randomized timeouts and leadership transfer
//! - Voter and non-voter members, join and remove at runtime
//! - Snapshots with log compaction and snapshot transfer to lagging peers
//! - Backup and restore of the replicated state
//! - HTTP API and command-line tools

pub mod api;
pub mod cluster;
pub mod config;
pub mod consensus;
pub mod error;
pub mod network;
pub mod replication;
pub mod snapshot;
pub mod state;
pub mod statemachine;
pub mod wal;

pub use cluster::Cluster;
pub use config::WolfClusterConfig;
pub use error::{Error, ErrorKind, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cluster::Cluster;
    pub use crate::config::WolfClusterConfig;
    pub use crate::consensus::{ClusterStats, PeerStats};
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::state::{Peer, PeerRole};
    pub use crate::statemachine::{KvCommand, KvStateMachine, StateMachine};
}
