//! Replication Protocol
//!
//! Defines the wire protocol for communication between nodes.

use serde::{Deserialize, Serialize};

use crate::snapshot::Snapshot;
use crate::wal::{LogEntry, LogIndex, Term};

/// Protocol messages for node communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Leader Election ==========
    /// Request vote (from candidate)
    RequestVote {
        term: Term,
        candidate_id: String,
        last_log_index: LogIndex,
        last_log_term: Term,
        /// Set when the election was triggered by a leadership transfer
        transfer: bool,
    },

    /// Vote response
    VoteResponse {
        term: Term,
        vote_granted: bool,
    },

    /// Start an election immediately (leadership transfer)
    TimeoutNow {
        term: Term,
        leader_id: String,
    },

    // ========== Log Replication ==========
    /// Append entries request (from leader to followers); empty entries act as a heartbeat
    AppendEntries {
        term: Term,
        leader_id: String,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    },

    /// Append entries response
    AppendEntriesResponse {
        term: Term,
        success: bool,
        /// Highest index known to match the leader on success
        match_index: LogIndex,
        /// `prev_log_index` of the rejected request
        rejected_index: LogIndex,
        /// Where the leader should retry from after a rejection
        hint_index: LogIndex,
    },

    // ========== Snapshots ==========
    /// Full state transfer for followers behind the leader's compacted prefix
    InstallSnapshot {
        term: Term,
        leader_id: String,
        snapshot: Snapshot,
    },

    /// Snapshot installed
    InstallSnapshotResponse {
        term: Term,
        match_index: LogIndex,
    },
}

impl Message {
    /// Term carried by the message
    pub fn term(&self) -> Term {
        match self {
            Message::RequestVote { term, .. }
            | Message::VoteResponse { term, .. }
            | Message::TimeoutNow { term, .. }
            | Message::AppendEntries { term, .. }
            | Message::AppendEntriesResponse { term, .. }
            | Message::InstallSnapshot { term, .. }
            | Message::InstallSnapshotResponse { term, .. } => *term,
        }
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::RequestVote { .. } => "RequestVote",
            Message::VoteResponse { .. } => "VoteResponse",
            Message::TimeoutNow { .. } => "TimeoutNow",
            Message::AppendEntries { .. } => "AppendEntries",
            Message::AppendEntriesResponse { .. } => "AppendEntriesResponse",
            Message::InstallSnapshot { .. } => "InstallSnapshot",
            Message::InstallSnapshotResponse { .. } => "InstallSnapshotResponse",
        }
    }
}

/// A one-way message between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    /// Where the sender can be reached
    pub from_address: String,
    pub to: String,
    pub message: Message,
}

impl Envelope {
    /// Serialize envelope to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize envelope from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}
