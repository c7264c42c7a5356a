//! Log Entry Types
//!
//! Defines the entries that are appended to the transport log
//! and replicated across nodes.

use serde::{Deserialize, Serialize};

use crate::state::Peer;

/// Position of an entry in the log. Index 0 is the empty-log sentinel.
pub type LogIndex = u64;

/// Election term
pub type Term = u64;

/// A single membership mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipOp {
    /// Initial table of a new cluster
    Bootstrap,
    Add(Peer),
    Remove { id: String },
}

/// A membership change entry. Carries the complete table that results from
/// applying `op`, so followers never need to reconstruct it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChange {
    pub op: MembershipOp,
    pub peers: Vec<Peer>,
}

impl ConfigChange {
    /// Initial table written by a bootstrapping node
    pub fn bootstrap(peers: Vec<Peer>) -> Self {
        Self {
            op: MembershipOp::Bootstrap,
            peers,
        }
    }
}

/// Entry payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Opaque application command
    Data(Vec<u8>),
    /// Replace the membership table
    MembershipChange(ConfigChange),
    /// Appended by a new leader to commit entries of earlier terms
    NoOp,
}

impl EntryPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EntryPayload::Data(_) => "data",
            EntryPayload::MembershipChange(_) => "membership",
            EntryPayload::NoOp => "noop",
        }
    }
}

/// An entry in the transport log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn new(index: LogIndex, term: Term, payload: EntryPayload) -> Self {
        Self { index, term, payload }
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    pub fn is_membership_change(&self) -> bool {
        matches!(self.payload, EntryPayload::MembershipChange(_))
    }

    /// Approximate encoded size, used to bound replication batches
    pub fn size_hint(&self) -> usize {
        24 + match &self.payload {
            EntryPayload::Data(d) => d.len(),
            EntryPayload::MembershipChange(c) => c.peers.len() * 64,
            EntryPayload::NoOp => 0,
        }
    }
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.index, self.term, self.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PeerRole;

    #[test]
    fn test_entry_display_and_kind() {
        let e = LogEntry::new(7, 3, EntryPayload::Data(b"x".to_vec()));
        assert_eq!(e.to_string(), "7@3:data");
        assert!(!e.is_membership_change());

        let change = ConfigChange::bootstrap(vec![Peer::new("a", "a:1", PeerRole::Voter, 1)]);
        let e = LogEntry::new(1, 1, EntryPayload::MembershipChange(change));
        assert!(e.is_membership_change());
        assert_eq!(e.kind(), "membership");
    }

    #[test]
    fn test_entry_bincode() {
        let e = LogEntry::new(9, 2, EntryPayload::NoOp);
        let bytes = bincode::serialize(&e).unwrap();
        let back: LogEntry = bincode::deserialize(&bytes).unwrap();
        assert_eq!(e, back);
    }
}
