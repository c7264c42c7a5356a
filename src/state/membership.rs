//! Cluster Membership Management
//!
//! The membership table is the authoritative, versioned list of peers.
//! It only changes when a membership entry is applied from the log.

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::wal::{ConfigChange, LogIndex, MembershipOp};

/// Role of a node in the consensus protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Node is the cluster leader
    Leader,
    /// Node is a follower
    Follower,
    /// Node is a candidate (during election)
    Candidate,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Leader => write!(f, "LEADER"),
            NodeRole::Follower => write!(f, "FOLLOWER"),
            NodeRole::Candidate => write!(f, "CANDIDATE"),
        }
    }
}

/// Voting rights of a member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    /// Votes and counts toward quorum
    Voter,
    /// Receives replication only
    NonVoter,
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerRole::Voter => write!(f, "VOTER"),
            PeerRole::NonVoter => write!(f, "NON_VOTER"),
        }
    }
}

/// A cluster member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Unique node identifier
    pub id: String,
    /// Node address (host:port)
    pub address: String,
    pub role: PeerRole,
    /// Index of the membership entry that added this peer
    pub joined_at_index: LogIndex,
}

impl Peer {
    pub fn new(id: impl Into<String>, address: impl Into<String>, role: PeerRole, joined_at_index: LogIndex) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            role,
            joined_at_index,
        }
    }

    pub fn is_voter(&self) -> bool {
        self.role == PeerRole::Voter
    }
}

/// Reachability of a peer as seen by the leader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerHealth {
    /// Responded within the last election timeout
    Reachable,
    /// Silent for longer than an election timeout
    Unreachable,
    /// This node is not the leader and has no opinion
    Unknown,
}

impl std::fmt::Display for PeerHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerHealth::Reachable => write!(f, "REACHABLE"),
            PeerHealth::Unreachable => write!(f, "UNREACHABLE"),
            PeerHealth::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Versioned membership table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipTable {
    peers: BTreeMap<String, Peer>,
    /// Index of the last applied membership entry
    version: LogIndex,
}

impl MembershipTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from a list of peers at a given version
    pub fn from_peers(peers: Vec<Peer>, version: LogIndex) -> Self {
        Self {
            peers: peers.into_iter().map(|p| (p.id.clone(), p)).collect(),
            version,
        }
    }

    /// Replace the whole table with the result of a committed change
    pub fn apply(&mut self, change: &ConfigChange, index: LogIndex) {
        let mut peers: BTreeMap<String, Peer> = change
            .peers
            .iter()
            .cloned()
            .map(|p| (p.id.clone(), p))
            .collect();

        match &change.op {
            MembershipOp::Bootstrap => {
                for peer in peers.values_mut() {
                    peer.joined_at_index = index;
                }
            }
            MembershipOp::Add(added) => {
                if let Some(peer) = peers.get_mut(&added.id) {
                    if peer.joined_at_index == 0 {
                        peer.joined_at_index = index;
                    }
                }
            }
            MembershipOp::Remove { .. } => {}
        }

        self.peers = peers;
        self.version = index;
    }

    /// Current members in id order
    pub fn current(&self) -> Vec<Peer> {
        self.peers.values().cloned().collect()
    }

    pub fn version(&self) -> LogIndex {
        self.version
    }

    pub fn get(&self, id: &str) -> Option<&Peer> {
        self.peers.get(id)
    }

    /// Find a member by its address
    pub fn find_by_address(&self, address: &str) -> Option<&Peer> {
        self.peers.values().find(|p| p.address == address)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    pub fn is_voter(&self, id: &str) -> bool {
        self.peers.get(id).map_or(false, |p| p.is_voter())
    }

    pub fn voters(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values().filter(|p| p.is_voter())
    }

    pub fn voter_count(&self) -> usize {
        self.voters().count()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Calculate quorum size over voters
    pub fn quorum_size(&self) -> usize {
        self.voter_count() / 2 + 1
    }

    /// Validate `op` against this table and produce the change entry
    pub fn with_change(&self, op: MembershipOp) -> Result<ConfigChange> {
        let mut next = self.peers.clone();
        match &op {
            MembershipOp::Add(peer) => {
                if let Some(other) = self.find_by_address(&peer.address) {
                    if other.id != peer.id {
                        return Err(Error::AlreadyMember(other.id.clone()));
                    }
                }
                if let Some(existing) = next.get(&peer.id) {
                    if existing.role == peer.role && existing.address == peer.address {
                        return Err(Error::AlreadyMember(peer.id.clone()));
                    }
                    if existing.is_voter() && !peer.is_voter() {
                        return Err(Error::AlreadyMember(peer.id.clone()));
                    }
                }
                let mut added = peer.clone();
                added.joined_at_index = next.get(&peer.id).map_or(0, |p| p.joined_at_index);
                next.insert(peer.id.clone(), added);
            }
            MembershipOp::Bootstrap => {
                return Err(Error::Internal("bootstrap is not a runtime membership change".into()));
            }
            MembershipOp::Remove { id } => {
                let removed = next
                    .remove(id)
                    .ok_or_else(|| Error::NotMember(id.clone()))?;
                if removed.is_voter() && !next.values().any(|p| p.is_voter()) {
                    return Err(Error::WouldBreakQuorum(id.clone()));
                }
            }
        }

        Ok(ConfigChange {
            op,
            peers: next.into_values().collect(),
        })
    }
}
