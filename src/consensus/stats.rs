//! Cluster statistics reported by a node

use serde::{Deserialize, Serialize};

use crate::state::{NodeRole, PeerHealth, PeerRole};
use crate::wal::{LogIndex, Term};

/// One member as seen from this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStats {
    pub id: String,
    pub address: String,
    pub role: PeerRole,
    pub joined_at_index: LogIndex,
    pub health: PeerHealth,
    /// Replicated index, known only on the leader
    pub match_index: Option<LogIndex>,
}

/// Point-in-time view of a node and its cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStats {
    pub node_id: String,
    pub address: String,
    pub role: NodeRole,
    pub leader_id: Option<String>,
    pub leader_address: Option<String>,
    pub term: Term,
    pub commit_index: LogIndex,
    pub last_applied_index: LogIndex,
    pub first_log_index: LogIndex,
    pub last_log_index: LogIndex,
    pub snapshot_index: LogIndex,
    pub membership_version: LogIndex,
    pub quorum_size: usize,
    pub pending_membership_change: Option<LogIndex>,
    pub peers: Vec<PeerStats>,
}

impl ClusterStats {
    /// Placeholder published before the core has started
    pub fn empty(node_id: &str, address: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            address: address.to_string(),
            role: NodeRole::Follower,
            leader_id: None,
            leader_address: None,
            term: 0,
            commit_index: 0,
            last_applied_index: 0,
            first_log_index: 1,
            last_log_index: 0,
            snapshot_index: 0,
            membership_version: 0,
            quorum_size: 1,
            pending_membership_change: None,
            peers: Vec::new(),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == NodeRole::Leader
    }

    pub fn voters(&self) -> usize {
        self.peers.iter().filter(|p| p.role == PeerRole::Voter).count()
    }
}
