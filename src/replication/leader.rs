//! Leader-side replication bookkeeping
//!
//! Tracks how far each follower has replicated and computes the index
//! a quorum of voters has durably stored.

use std::collections::BTreeMap;

use crate::state::{MembershipTable, PeerHealth};
use crate::wal::LogIndex;

/// How the leader is currently feeding a follower
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    /// Looking for the last matching index; one request in flight
    Probe,
    /// Matching index known; entries are streamed optimistically
    Replicate,
    /// Follower is behind the compacted prefix and is receiving a snapshot
    Snapshot,
}

/// Replication progress of one follower
#[derive(Debug, Clone)]
pub struct Progress {
    pub match_index: LogIndex,
    pub next_index: LogIndex,
    pub state: ProgressState,
    /// A probe is outstanding; no further probes until a response or heartbeat
    pub paused: bool,
    /// Ticks since the follower last answered
    pub last_contact_ticks: u64,
    /// Snapshot index being installed, and ticks since it was sent
    pub pending_snapshot: LogIndex,
    pub snapshot_ticks: u64,
}

impl Progress {
    pub fn new(next_index: LogIndex) -> Self {
        Self {
            match_index: 0,
            next_index: next_index.max(1),
            state: ProgressState::Probe,
            paused: false,
            last_contact_ticks: 0,
            pending_snapshot: 0,
            snapshot_ticks: 0,
        }
    }

    /// Record a successful append up to `index`; returns true if it advanced
    pub fn acknowledge(&mut self, index: LogIndex) -> bool {
        self.paused = false;
        let advanced = index > self.match_index;
        if advanced {
            self.match_index = index;
        }
        self.next_index = self.next_index.max(self.match_index + 1);

        match self.state {
            ProgressState::Probe => self.state = ProgressState::Replicate,
            ProgressState::Snapshot if self.match_index >= self.pending_snapshot => {
                self.state = ProgressState::Replicate;
                self.pending_snapshot = 0;
            }
            _ => {}
        }
        advanced
    }

    /// Handle a rejection of the request whose previous index was `rejected`.
    /// Returns false when the rejection is stale and should be ignored.
    pub fn reject(&mut self, rejected: LogIndex, hint: LogIndex) -> bool {
        let stale = match self.state {
            ProgressState::Replicate => rejected <= self.match_index,
            ProgressState::Probe => rejected + 1 != self.next_index,
            ProgressState::Snapshot => true,
        };
        if stale {
            return false;
        }
        self.paused = false;
        self.next_index = rejected.min(hint + 1).max(self.match_index + 1);
        self.state = ProgressState::Probe;
        true
    }

    /// Switch to snapshot transfer
    pub fn begin_snapshot(&mut self, index: LogIndex) {
        self.state = ProgressState::Snapshot;
        self.pending_snapshot = index;
        self.snapshot_ticks = 0;
        self.paused = false;
    }

    /// Whether new entries may be sent right now
    pub fn can_send(&self) -> bool {
        match self.state {
            ProgressState::Probe => !self.paused,
            ProgressState::Replicate => true,
            ProgressState::Snapshot => false,
        }
    }

    pub fn health(&self, unreachable_after: u64) -> PeerHealth {
        if self.last_contact_ticks < unreachable_after {
            PeerHealth::Reachable
        } else {
            PeerHealth::Unreachable
        }
    }
}

/// Highest index stored by a quorum of the voters in `membership`.
/// `own_last` is the leader's own last index.
pub fn quorum_match_index(
    membership: &MembershipTable,
    self_id: &str,
    own_last: LogIndex,
    progress: &BTreeMap<String, Progress>,
) -> Option<LogIndex> {
    let quorum_size = membership.quorum_size();
    let mut all: Vec<LogIndex> = membership
        .voters()
        .map(|peer| {
            if peer.id == self_id {
                own_last
            } else {
                progress.get(&peer.id).map_or(0, |p| p.match_index)
            }
        })
        .collect();

    if all.is_empty() || all.len() < quorum_size {
        return None;
    }
    all.sort_unstable();
    Some(all[all.len() - quorum_size])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Peer, PeerRole};

    fn members(ids: &[&str]) -> MembershipTable {
        MembershipTable::from_peers(
            ids.iter().map(|id| Peer::new(*id, *id, PeerRole::Voter, 1)).collect(),
            1,
        )
    }

    fn progress(entries: &[(&str, LogIndex)]) -> BTreeMap<String, Progress> {
        entries
            .iter()
            .map(|(id, m)| {
                let mut p = Progress::new(1);
                p.acknowledge(*m);
                (id.to_string(), p)
            })
            .collect()
    }

    #[test]
    fn test_quorum_match_three_nodes() {
        let m = members(&["a", "b", "c"]);
        let p = progress(&[("b", 7), ("c", 3)]);
        assert_eq!(quorum_match_index(&m, "a", 10, &p), Some(7));
    }

    #[test]
    fn test_quorum_ignores_non_voters() {
        let mut peers: Vec<Peer> = ["a", "b", "c"]
            .iter()
            .map(|id| Peer::new(*id, *id, PeerRole::Voter, 1))
            .collect();
        peers.push(Peer::new("d", "d", PeerRole::NonVoter, 2));
        let m = MembershipTable::from_peers(peers, 2);

        let p = progress(&[("d", 10), ("b", 2), ("c", 1)]);
        assert_eq!(quorum_match_index(&m, "a", 10, &p), Some(2));
    }

    #[test]
    fn test_single_voter_commits_alone() {
        let m = members(&["a"]);
        assert_eq!(quorum_match_index(&m, "a", 4, &BTreeMap::new()), Some(4));
    }

    #[test]
    fn test_probe_backtracks_on_reject() {
        let mut p = Progress::new(11);
        p.paused = true;
        assert!(p.reject(10, 4));
        assert_eq!(p.next_index, 5);
        assert_eq!(p.state, ProgressState::Probe);
        assert!(!p.paused);

        // A rejection for an older probe is stale
        assert!(!p.reject(10, 2));
        assert_eq!(p.next_index, 5);
    }

    #[test]
    fn test_snapshot_completes_on_ack() {
        let mut p = Progress::new(1);
        p.begin_snapshot(50);
        assert!(!p.can_send());
        p.acknowledge(50);
        assert_eq!(p.state, ProgressState::Replicate);
        assert_eq!(p.next_index, 51);
    }
}
