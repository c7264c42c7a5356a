//! Consensus Core
//!
//! A synchronous consensus state machine. It owns the log, the hard
//! state, the membership table, snapshots and the application state
//! machine, and is driven purely by [`RaftCore::tick`],
//! [`RaftCore::step`] and proposals. Outgoing messages and
//! notifications are queued and collected by the caller, which keeps
//! the core deterministic and free of I/O scheduling.

use std::collections::BTreeMap;

use crate::config::WolfClusterConfig;
use crate::error::{Error, Result};
use crate::replication::{
    quorum_match_index, reconcile, AppendOutcome, Envelope, Message, Progress, ProgressState,
};
use crate::snapshot::{Backup, Snapshot, SnapshotManager};
use crate::state::{
    ElectionState, ElectionTimer, HardState, MembershipTable, NodeRole, Peer, PeerHealth,
    PeerRole, StateTracker, VoteTally,
};
use crate::statemachine::StateMachine;
use crate::wal::{ConfigChange, EntryPayload, LogEntry, LogIndex, MembershipOp, RaftLog, Term};

use super::stats::{ClusterStats, PeerStats};

/// Upper bound on the payload bytes of one AppendEntries request
const MAX_APPEND_BYTES: usize = 1024 * 1024;

/// Tick-based timing and replication limits
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub heartbeat_ticks: u64,
    pub election_ticks_min: u64,
    pub election_ticks_max: u64,
    /// A leader without majority contact for this many ticks steps down
    pub lease_ticks: u64,
    pub max_batch_entries: usize,
    /// Applied entries that trigger an automatic snapshot (0 = manual only)
    pub snapshot_threshold: u64,
    /// Entries kept behind a snapshot for lagging followers
    pub trailing_logs: u64,
    /// Seed for election jitter; `None` draws from entropy
    pub seed: Option<u64>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            heartbeat_ticks: 2,
            election_ticks_min: 10,
            election_ticks_max: 20,
            lease_ticks: 20,
            max_batch_entries: 64,
            snapshot_threshold: 0,
            trailing_logs: 16,
            seed: None,
        }
    }
}

/// Everything the core persists
pub struct Storage {
    pub log: RaftLog,
    pub tracker: StateTracker,
    pub snapshots: SnapshotManager,
}

impl Storage {
    /// Open the on-disk stores under the configured data directory
    pub fn open(config: &WolfClusterConfig) -> Result<Self> {
        Ok(Self {
            log: RaftLog::open(config.wal_dir(), &config.wal)?,
            tracker: StateTracker::new(config.state_dir())?,
            snapshots: SnapshotManager::open(config.snapshot_dir(), config.snapshot.retain)?,
        })
    }

    /// Volatile storage for simulations and tests
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            log: RaftLog::in_memory(),
            tracker: StateTracker::in_memory()?,
            snapshots: SnapshotManager::in_memory(),
        })
    }
}

/// A message ready to be delivered
#[derive(Debug, Clone)]
pub struct Outbound {
    pub address: String,
    pub envelope: Envelope,
}

/// Notifications for the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    /// Entry `index` of `term` was applied
    Applied { index: LogIndex, term: Term },
    BecameLeader { term: Term },
    /// This node stopped leading; outstanding proposals will not be confirmed
    LeadershipLost { term: Term },
}

/// The consensus state machine of one node
pub struct RaftCore {
    id: String,
    address: String,
    config: CoreConfig,

    role: NodeRole,
    hard: HardState,
    leader_id: Option<String>,

    log: RaftLog,
    tracker: StateTracker,
    snapshots: SnapshotManager,
    state_machine: Box<dyn StateMachine>,

    /// Table as of the last applied membership entry
    membership: MembershipTable,
    last_applied: LogIndex,
    /// Index of an appended but not yet applied membership change
    pending_change: Option<LogIndex>,

    election: ElectionTimer,
    votes: Option<VoteTally>,
    heartbeat_elapsed: u64,
    ticks_since_leader: u64,
    progress: BTreeMap<String, Progress>,
    /// Last known address of every node we have heard of
    addresses: BTreeMap<String, String>,
    applied_since_snapshot: u64,

    outbox: Vec<Outbound>,
    events: Vec<CoreEvent>,
}

impl RaftCore {
    /// Load persisted state and replay committed entries
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        config: CoreConfig,
        storage: Storage,
        state_machine: Box<dyn StateMachine>,
    ) -> Result<Self> {
        let Storage {
            log,
            tracker,
            snapshots,
        } = storage;
        let hard = tracker.load()?;
        let election = ElectionTimer::new(
            config.election_ticks_min,
            config.election_ticks_max,
            config.seed,
        );

        let mut core = Self {
            id: id.into(),
            address: address.into(),
            config,
            role: NodeRole::Follower,
            hard,
            leader_id: None,
            log,
            tracker,
            snapshots,
            state_machine,
            membership: MembershipTable::new(),
            last_applied: 0,
            pending_change: None,
            election,
            votes: None,
            heartbeat_elapsed: 0,
            ticks_since_leader: 0,
            progress: BTreeMap::new(),
            addresses: BTreeMap::new(),
            applied_since_snapshot: 0,
            outbox: Vec::new(),
            events: Vec::new(),
        };
        core.addresses.insert(core.id.clone(), core.address.clone());

        if let Some(snapshot) = core.snapshots.latest().cloned() {
            let (index, term) = (snapshot.last_included_index, snapshot.last_included_term);
            if core.log.snapshot_index() > index {
                return Err(Error::WalCorrupted {
                    index: core.log.snapshot_index(),
                    reason: format!("log compacted past newest snapshot {}", index),
                });
            }
            core.state_machine.restore(&snapshot.state)?;
            core.membership = snapshot.membership;
            if core.log.term_at(index) != Some(term) {
                tracing::warn!("Log does not contain snapshot point {} (term {}); resetting log", index, term);
                core.log.reset(index, term)?;
            }
            core.last_applied = index;
        } else if core.log.snapshot_index() > 0 {
            return Err(Error::WalCorrupted {
                index: core.log.snapshot_index(),
                reason: "log is compacted but no snapshot was found".into(),
            });
        }

        core.hard.commit_index = core
            .hard
            .commit_index
            .max(core.last_applied)
            .min(core.log.last_index());
        core.learn_member_addresses();
        core.apply_committed()?;
        core.events.clear();

        tracing::info!(
            "Node {} starting at term {} (commit {}, last log {}, {} members)",
            core.id,
            core.hard.current_term,
            core.hard.commit_index,
            core.log.last_index(),
            core.membership.len()
        );
        Ok(core)
    }

    /// Write the initial membership entry of a new cluster.
    /// Returns false if this node already has state.
    pub fn bootstrap(&mut self, peers: &[(String, String)]) -> Result<bool> {
        if self.log.last_index() > 0 || self.hard.current_term > 0 || !self.membership.is_empty() {
            tracing::info!("Node {} already initialized; skipping bootstrap", self.id);
            return Ok(false);
        }

        let mut members: BTreeMap<String, Peer> = BTreeMap::new();
        members.insert(
            self.id.clone(),
            Peer::new(self.id.clone(), self.address.clone(), PeerRole::Voter, 1),
        );
        for (id, address) in peers {
            members
                .entry(id.clone())
                .or_insert_with(|| Peer::new(id.clone(), address.clone(), PeerRole::Voter, 1));
        }
        let count = members.len();

        let change = ConfigChange::bootstrap(members.into_values().collect());
        let entry = LogEntry::new(1, 1, EntryPayload::MembershipChange(change));
        self.log.append((0, 0), vec![entry])?;
        self.hard.current_term = 1;
        self.hard.commit_index = 1;
        self.persist()?;
        self.apply_committed()?;

        tracing::info!("Bootstrapped cluster with {} voters", count);
        Ok(true)
    }

    // ========== Accessors ==========

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == NodeRole::Leader
    }

    pub fn term(&self) -> Term {
        self.hard.current_term
    }

    pub fn leader_id(&self) -> Option<&str> {
        self.leader_id.as_deref()
    }

    /// Address of the current leader, if known
    pub fn leader_address(&self) -> Option<String> {
        let leader = self.leader_id.as_ref()?;
        self.membership
            .get(leader)
            .map(|p| p.address.clone())
            .or_else(|| self.addresses.get(leader).cloned())
    }

    pub fn commit_index(&self) -> LogIndex {
        self.hard.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn membership(&self) -> &MembershipTable {
        &self.membership
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    pub fn latest_snapshot(&self) -> Option<&Snapshot> {
        self.snapshots.latest()
    }

    /// Serialized application state as of the last applied entry
    pub fn state_image(&self) -> Result<Vec<u8>> {
        self.state_machine.snapshot()
    }

    /// Drain queued outgoing messages
    pub fn take_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    /// Drain queued notifications
    pub fn take_events(&mut self) -> Vec<CoreEvent> {
        std::mem::take(&mut self.events)
    }

    /// Assemble a statistics snapshot
    pub fn stats(&self) -> ClusterStats {
        let unreachable_after = self.config.election_ticks_max;
        let peers = self
            .membership
            .current()
            .into_iter()
            .map(|peer| {
                let (health, match_index) = if peer.id == self.id {
                    (PeerHealth::Reachable, Some(self.log.last_index()))
                } else if self.role == NodeRole::Leader {
                    match self.progress.get(&peer.id) {
                        Some(p) => (p.health(unreachable_after), Some(p.match_index)),
                        None => (PeerHealth::Unknown, None),
                    }
                } else if self.leader_id.as_deref() == Some(peer.id.as_str()) {
                    let health = if self.ticks_since_leader < unreachable_after {
                        PeerHealth::Reachable
                    } else {
                        PeerHealth::Unreachable
                    };
                    (health, None)
                } else {
                    (PeerHealth::Unknown, None)
                };
                PeerStats {
                    id: peer.id,
                    address: peer.address,
                    role: peer.role,
                    joined_at_index: peer.joined_at_index,
                    health,
                    match_index,
                }
            })
            .collect();

        ClusterStats {
            node_id: self.id.clone(),
            address: self.address.clone(),
            role: self.role,
            leader_id: self.leader_id.clone(),
            leader_address: self.leader_address(),
            term: self.hard.current_term,
            commit_index: self.hard.commit_index,
            last_applied_index: self.last_applied,
            first_log_index: self.log.first_index(),
            last_log_index: self.log.last_index(),
            snapshot_index: self.snapshots.latest_index(),
            membership_version: self.membership.version(),
            quorum_size: self.membership.quorum_size(),
            pending_membership_change: self.pending_change,
            peers,
        }
    }

    // ========== Driving ==========

    /// Advance logical time by one tick
    pub fn tick(&mut self) -> Result<()> {
        match self.role {
            NodeRole::Leader => {
                self.heartbeat_elapsed += 1;
                for p in self.progress.values_mut() {
                    p.last_contact_ticks += 1;
                    if p.state == ProgressState::Snapshot {
                        p.snapshot_ticks += 1;
                    }
                }

                if !self.quorum_active() {
                    tracing::warn!(
                        "Leader {} lost contact with a quorum in term {}; stepping down",
                        self.id,
                        self.hard.current_term
                    );
                    return self.become_follower(self.hard.current_term, None);
                }

                if self.heartbeat_elapsed >= self.config.heartbeat_ticks {
                    self.heartbeat_elapsed = 0;
                    self.heartbeat()?;
                }
            }
            NodeRole::Follower | NodeRole::Candidate => {
                self.ticks_since_leader += 1;
                if self.election.tick() {
                    if self.membership.is_voter(&self.id) {
                        self.campaign(false)?;
                    } else {
                        self.election.reset();
                    }
                }
            }
        }
        Ok(())
    }

    /// Handle one inbound message
    pub fn step(&mut self, envelope: Envelope) -> Result<()> {
        let Envelope {
            from,
            from_address,
            to,
            message,
        } = envelope;
        if to != self.id {
            tracing::debug!("Dropping {} addressed to {}", message.type_name(), to);
            return Ok(());
        }
        if !from_address.is_empty() {
            self.addresses.insert(from.clone(), from_address);
        }

        let term = message.term();
        if term > self.hard.current_term {
            if let Message::RequestVote { transfer: false, .. } = &message {
                if self.in_leader_lease() {
                    tracing::debug!(
                        "Ignoring vote request from {} for term {}: leader is active",
                        from,
                        term
                    );
                    return Ok(());
                }
            }
            let leader = match &message {
                Message::AppendEntries { leader_id, .. }
                | Message::InstallSnapshot { leader_id, .. } => Some(leader_id.clone()),
                _ => None,
            };
            tracing::info!(
                "Node {} moving to term {} after {} from {}",
                self.id,
                term,
                message.type_name(),
                from
            );
            self.become_follower(term, leader)?;
        }

        match message {
            Message::RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
                ..
            } => self.handle_request_vote(&from, term, &candidate_id, last_log_index, last_log_term),
            Message::VoteResponse { term, vote_granted } => {
                self.handle_vote_response(&from, term, vote_granted)
            }
            Message::TimeoutNow { term, leader_id } => self.handle_timeout_now(term, &leader_id),
            Message::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.handle_append_entries(
                &from,
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            ),
            Message::AppendEntriesResponse {
                term,
                success,
                match_index,
                rejected_index,
                hint_index,
            } => self.handle_append_response(&from, term, success, match_index, rejected_index, hint_index),
            Message::InstallSnapshot {
                term,
                leader_id,
                snapshot,
            } => self.handle_install_snapshot(&from, term, leader_id, snapshot),
            Message::InstallSnapshotResponse { term, match_index } => {
                self.handle_snapshot_response(&from, term, match_index)
            }
        }
    }

    /// Append a new entry as leader. Returns its index and term.
    pub fn propose(&mut self, payload: EntryPayload) -> Result<(LogIndex, Term)> {
        if self.role != NodeRole::Leader {
            return Err(Error::NotLeader {
                leader: self.leader_address(),
            });
        }

        let is_change = if let EntryPayload::MembershipChange(change) = &payload {
            if let Some(pending) = self.pending_change {
                return Err(Error::Unavailable(format!(
                    "membership change at index {} is not yet committed",
                    pending
                )));
            }
            // New members start catching up before the change commits
            let next = self.log.last_index() + 1;
            for peer in &change.peers {
                if peer.id != self.id {
                    self.addresses.insert(peer.id.clone(), peer.address.clone());
                    self.progress
                        .entry(peer.id.clone())
                        .or_insert_with(|| Progress::new(next));
                }
            }
            true
        } else {
            false
        };

        let index = self.append_local(payload)?;
        if is_change {
            self.pending_change = Some(index);
        }
        self.broadcast_append()?;
        self.maybe_commit()?;
        Ok((index, self.hard.current_term))
    }

    /// Validate a membership operation against the committed table and propose it
    pub fn propose_membership(&mut self, op: MembershipOp) -> Result<(LogIndex, Term)> {
        if self.role != NodeRole::Leader {
            return Err(Error::NotLeader {
                leader: self.leader_address(),
            });
        }
        if let Some(pending) = self.pending_change {
            return Err(Error::Unavailable(format!(
                "membership change at index {} is not yet committed",
                pending
            )));
        }
        let change = self.membership.with_change(op)?;
        self.propose(EntryPayload::MembershipChange(change))
    }

    /// Capture a snapshot at the last applied index and compact the log
    pub fn snapshot(&mut self) -> Result<Snapshot> {
        self.capture_snapshot()
    }

    /// Latest snapshot plus every committed entry after it
    pub fn backup(&self) -> Result<Vec<u8>> {
        let snapshot = self
            .snapshots
            .latest()
            .cloned()
            .ok_or_else(|| Error::Unavailable("no snapshot has been taken yet".into()))?;
        let entries = self
            .log
            .entries(snapshot.last_included_index + 1, self.hard.commit_index)?;
        tracing::info!(
            "Building backup from snapshot {} plus {} entries",
            snapshot.last_included_index,
            entries.len()
        );
        Backup::new(snapshot, entries).encode()
    }

    /// Replace local state with a backup. Only allowed on a node that is
    /// alone: empty membership, or itself as the only voter. `force`
    /// accepts a backup older than the local commit index, which moves
    /// the commit index backwards.
    pub fn restore(&mut self, bytes: &[u8], force: bool) -> Result<LogIndex> {
        let backup = Backup::decode(bytes)?;

        let sole_voter = self.membership.voter_count() == 1 && self.membership.is_voter(&self.id);
        if !self.membership.is_empty() && !sole_voter {
            return Err(Error::RestoreRejected(format!(
                "node is part of a {}-member cluster; restore needs an empty or single-voter membership",
                self.membership.len()
            )));
        }

        let target = backup.last_index();
        if target < self.hard.commit_index && !force {
            return Err(Error::StaleSnapshot {
                snapshot_index: target,
                commit_index: self.hard.commit_index,
            });
        }

        let previous_state = self.state_machine.snapshot()?;
        let folded = match self.fold_backup(&backup) {
            Ok(folded) => folded,
            Err(e) => return Err(self.abort_restore(e, &previous_state, None)),
        };
        let term = folded.last_included_term;

        let was_leader = self.role == NodeRole::Leader;
        let previous_snapshot = self.snapshots.latest().cloned();
        if let Err(e) = self.snapshots.replace_all(folded.clone()) {
            return Err(self.abort_restore(e, &previous_state, None));
        }
        if let Err(e) = self.log.reset(target, term) {
            return Err(self.abort_restore(e, &previous_state, Some(previous_snapshot)));
        }
        self.membership = folded.membership;
        self.learn_member_addresses();

        if target < self.hard.commit_index {
            tracing::warn!(
                "Forced restore moves commit index back from {} to {}",
                self.hard.commit_index,
                target
            );
        }
        self.last_applied = target;
        self.hard.commit_index = target;
        self.hard.current_term = self.hard.current_term.max(term);
        self.persist()?;

        self.role = NodeRole::Follower;
        self.leader_id = None;
        self.votes = None;
        self.progress.clear();
        self.pending_change = None;
        self.applied_since_snapshot = 0;
        self.election.reset();
        if was_leader {
            self.events.push(CoreEvent::LeadershipLost {
                term: self.hard.current_term,
            });
        }

        tracing::info!(
            "Restored backup at index {} (term {}) with {} members",
            target,
            term,
            self.membership.len()
        );
        Ok(target)
    }

    /// Load a backup into the state machine and fold its trailing
    /// entries into one snapshot at the backup's last index
    fn fold_backup(&mut self, backup: &Backup) -> Result<Snapshot> {
        self.state_machine.restore(&backup.snapshot.state)?;
        let mut membership = backup.snapshot.membership.clone();
        let mut term = backup.snapshot.last_included_term;
        for entry in &backup.entries {
            match &entry.payload {
                EntryPayload::Data(data) => {
                    if let Err(e) = self.state_machine.apply(entry.index, data) {
                        tracing::warn!("Skipping backup entry {}: {}", entry.index, e);
                    }
                }
                EntryPayload::MembershipChange(change) => membership.apply(change, entry.index),
                EntryPayload::NoOp => {}
            }
            term = entry.term;
        }
        Snapshot::new(backup.last_index(), term, membership, self.state_machine.snapshot()?)
    }

    /// Put back the state a failed restore replaced and return its error.
    /// `snapshot` is the previous latest snapshot when the snapshot files
    /// were already replaced.
    fn abort_restore(
        &mut self,
        error: Error,
        previous_state: &[u8],
        snapshot: Option<Option<Snapshot>>,
    ) -> Error {
        tracing::error!("Restore failed, rolling back: {}", error);
        if let Err(e) = self.state_machine.restore(previous_state) {
            tracing::error!("Failed to roll back state machine: {}", e);
        }
        if let Some(previous) = snapshot {
            if let Err(e) = self.snapshots.revert(previous) {
                tracing::error!("Failed to roll back snapshot files: {}", e);
            }
        }
        error
    }

    // ========== Roles ==========

    fn persist(&mut self) -> Result<()> {
        self.tracker.save(&self.hard)
    }

    fn in_leader_lease(&self) -> bool {
        match self.role {
            NodeRole::Leader => true,
            _ => self.leader_id.is_some() && self.ticks_since_leader < self.election.min_ticks(),
        }
    }

    fn quorum_active(&self) -> bool {
        let mut active = 0;
        for voter in self.membership.voters() {
            if voter.id == self.id {
                active += 1;
            } else if self
                .progress
                .get(&voter.id)
                .map_or(false, |p| p.last_contact_ticks < self.config.lease_ticks)
            {
                active += 1;
            }
        }
        active >= self.membership.quorum_size()
    }

    fn become_follower(&mut self, term: Term, leader: Option<String>) -> Result<()> {
        let was_leader = self.role == NodeRole::Leader;
        if term > self.hard.current_term {
            self.hard.current_term = term;
            self.hard.voted_for = None;
            self.persist()?;
        }
        self.role = NodeRole::Follower;
        self.leader_id = leader;
        self.votes = None;
        self.progress.clear();
        self.pending_change = None;
        self.election.reset();

        if was_leader {
            tracing::info!("Node {} is no longer leader (term {})", self.id, self.hard.current_term);
            self.events.push(CoreEvent::LeadershipLost {
                term: self.hard.current_term,
            });
        }
        Ok(())
    }

    fn campaign(&mut self, transfer: bool) -> Result<()> {
        if !self.membership.is_voter(&self.id) {
            return Ok(());
        }

        self.hard.current_term += 1;
        self.hard.voted_for = Some(self.id.clone());
        self.persist()?;
        self.role = NodeRole::Candidate;
        self.leader_id = None;
        self.election.reset();

        let term = self.hard.current_term;
        tracing::info!("Node {} starting election for term {}", self.id, term);

        let mut tally = VoteTally::new(term);
        tally.record(&self.id, true);
        if tally.result(&self.membership) == ElectionState::Won {
            return self.become_leader();
        }
        self.votes = Some(tally);

        let voters: Vec<String> = self
            .membership
            .voters()
            .filter(|p| p.id != self.id)
            .map(|p| p.id.clone())
            .collect();
        let (last_log_index, last_log_term) = (self.log.last_index(), self.log.last_term());
        for voter in voters {
            self.send(
                &voter,
                Message::RequestVote {
                    term,
                    candidate_id: self.id.clone(),
                    last_log_index,
                    last_log_term,
                    transfer,
                },
            );
        }
        Ok(())
    }

    fn become_leader(&mut self) -> Result<()> {
        self.role = NodeRole::Leader;
        self.leader_id = Some(self.id.clone());
        self.votes = None;
        self.heartbeat_elapsed = 0;

        let next = self.log.last_index() + 1;
        self.progress = self
            .membership
            .current()
            .into_iter()
            .filter(|p| p.id != self.id)
            .map(|p| (p.id, Progress::new(next)))
            .collect();

        // An uncommitted membership change in our log is still in flight
        self.pending_change = None;
        for index in (self.hard.commit_index + 1)..=self.log.last_index() {
            if self.log.entry(index).map_or(false, |e| e.is_membership_change()) {
                self.pending_change = Some(index);
            }
        }

        tracing::info!(
            "Node {} became leader for term {} ({} voters)",
            self.id,
            self.hard.current_term,
            self.membership.voter_count()
        );
        self.events.push(CoreEvent::BecameLeader {
            term: self.hard.current_term,
        });

        self.append_local(EntryPayload::NoOp)?;
        self.broadcast_append()?;
        self.maybe_commit()
    }

    /// Hand off leadership after applying our own removal
    fn leave_after_removal(&mut self) -> Result<()> {
        tracing::info!(
            "Leader {} removed from membership; handing off leadership",
            self.id
        );

        let peers: Vec<String> = self.progress.keys().cloned().collect();
        for peer in &peers {
            if let Some(p) = self.progress.get_mut(peer) {
                p.paused = false;
            }
            self.send_append(peer)?;
        }

        let target = self
            .progress
            .iter()
            .filter(|(id, _)| self.membership.is_voter(id))
            .max_by_key(|(_, p)| p.match_index)
            .map(|(id, _)| id.clone());
        if let Some(target) = target {
            tracing::info!("Transferring leadership to {}", target);
            self.send(
                &target,
                Message::TimeoutNow {
                    term: self.hard.current_term,
                    leader_id: self.id.clone(),
                },
            );
        }

        self.become_follower(self.hard.current_term, None)
    }

    // ========== Sending ==========

    fn send(&mut self, to: &str, message: Message) {
        let address = self
            .membership
            .get(to)
            .map(|p| p.address.clone())
            .or_else(|| self.addresses.get(to).cloned());
        let Some(address) = address else {
            tracing::debug!("No address for {}; dropping {}", to, message.type_name());
            return;
        };
        self.outbox.push(Outbound {
            address,
            envelope: Envelope {
                from: self.id.clone(),
                from_address: self.address.clone(),
                to: to.to_string(),
                message,
            },
        });
    }

    fn append_local(&mut self, payload: EntryPayload) -> Result<LogIndex> {
        let prev = (self.log.last_index(), self.log.last_term());
        let index = prev.0 + 1;
        self.log
            .append(prev, vec![LogEntry::new(index, self.hard.current_term, payload)])?;
        Ok(index)
    }

    fn send_append(&mut self, peer: &str) -> Result<()> {
        let Some(next) = self.progress.get(peer).map(|p| p.next_index) else {
            return Ok(());
        };
        let prev_index = next - 1;
        let Some(prev_term) = self.log.term_at(prev_index) else {
            return self.send_snapshot(peer);
        };

        let entries = self
            .log
            .batch(next, self.config.max_batch_entries, MAX_APPEND_BYTES)?;
        if let Some(p) = self.progress.get_mut(peer) {
            match p.state {
                ProgressState::Replicate => {
                    if let Some(last) = entries.last() {
                        p.next_index = last.index + 1;
                    }
                }
                ProgressState::Probe => p.paused = true,
                ProgressState::Snapshot => {}
            }
        }

        tracing::trace!(
            "AppendEntries to {}: prev {} entries {}",
            peer,
            prev_index,
            entries.len()
        );
        self.send(
            peer,
            Message::AppendEntries {
                term: self.hard.current_term,
                leader_id: self.id.clone(),
                prev_log_index: prev_index,
                prev_log_term: prev_term,
                entries,
                leader_commit: self.hard.commit_index,
            },
        );
        Ok(())
    }

    fn send_snapshot(&mut self, peer: &str) -> Result<()> {
        let snapshot = match self.snapshots.latest() {
            Some(s) => s.clone(),
            None => {
                tracing::warn!("Peer {} needs compacted entries but no snapshot exists", peer);
                return Ok(());
            }
        };
        if let Some(p) = self.progress.get_mut(peer) {
            p.begin_snapshot(snapshot.last_included_index);
        }
        tracing::info!(
            "Sending snapshot at index {} to {}",
            snapshot.last_included_index,
            peer
        );
        self.send(
            peer,
            Message::InstallSnapshot {
                term: self.hard.current_term,
                leader_id: self.id.clone(),
                snapshot,
            },
        );
        Ok(())
    }

    fn broadcast_append(&mut self) -> Result<()> {
        let ready: Vec<String> = self
            .progress
            .iter()
            .filter(|(_, p)| p.can_send())
            .map(|(id, _)| id.clone())
            .collect();
        for peer in ready {
            self.send_append(&peer)?;
        }
        Ok(())
    }

    fn heartbeat(&mut self) -> Result<()> {
        let resend_after = self.config.election_ticks_max;
        let peers: Vec<String> = self.progress.keys().cloned().collect();
        for peer in peers {
            let state = match self.progress.get_mut(&peer) {
                Some(p) => {
                    if p.state == ProgressState::Probe {
                        p.paused = false;
                    }
                    (p.state, p.snapshot_ticks)
                }
                None => continue,
            };
            match state {
                (ProgressState::Snapshot, ticks) if ticks < resend_after => {}
                (ProgressState::Snapshot, _) => self.send_snapshot(&peer)?,
                _ => self.send_append(&peer)?,
            }
        }
        Ok(())
    }

    // ========== Commit and apply ==========

    fn maybe_commit(&mut self) -> Result<()> {
        if self.role != NodeRole::Leader {
            return Ok(());
        }
        let Some(candidate) =
            quorum_match_index(&self.membership, &self.id, self.log.last_index(), &self.progress)
        else {
            return Ok(());
        };
        // Only entries of the current term are committed by counting replicas
        if candidate > self.hard.commit_index
            && self.log.term_at(candidate) == Some(self.hard.current_term)
        {
            tracing::debug!("Commit index advanced to {}", candidate);
            self.hard.commit_index = candidate;
            self.persist()?;
            self.apply_committed()?;
        }
        Ok(())
    }

    fn apply_committed(&mut self) -> Result<()> {
        let mut removed_self = false;
        while self.last_applied < self.hard.commit_index {
            let index = self.last_applied + 1;
            let entry = self.log.entry(index).cloned().ok_or_else(|| {
                Error::Internal(format!("committed entry {} missing from log", index))
            })?;

            match &entry.payload {
                EntryPayload::Data(data) => {
                    if let Err(e) = self.state_machine.apply(index, data) {
                        tracing::error!("Failed to apply entry {}: {}", index, e);
                    }
                }
                EntryPayload::MembershipChange(change) => {
                    removed_self |= self.apply_membership(change, index);
                }
                EntryPayload::NoOp => {}
            }

            self.last_applied = index;
            self.applied_since_snapshot += 1;
            self.events.push(CoreEvent::Applied {
                index,
                term: entry.term,
            });
        }

        if removed_self {
            self.leave_after_removal()?;
        }
        if self.config.snapshot_threshold > 0
            && self.applied_since_snapshot >= self.config.snapshot_threshold
        {
            self.capture_snapshot()?;
        }
        Ok(())
    }

    /// Returns true when the leader has just applied its own removal
    fn apply_membership(&mut self, change: &ConfigChange, index: LogIndex) -> bool {
        self.membership.apply(change, index);
        if self.pending_change.map_or(false, |p| p <= index) {
            self.pending_change = None;
        }
        self.learn_member_addresses();
        tracing::info!(
            "Applied membership change at index {}: {} members, {} voters",
            index,
            self.membership.len(),
            self.membership.voter_count()
        );

        if self.role != NodeRole::Leader {
            return false;
        }
        if !self.membership.contains(&self.id) {
            return true;
        }

        let next = self.log.last_index() + 1;
        for peer in self.membership.current() {
            if peer.id != self.id {
                self.progress
                    .entry(peer.id)
                    .or_insert_with(|| Progress::new(next));
            }
        }
        let membership = &self.membership;
        self.progress.retain(|id, _| membership.contains(id));
        false
    }

    fn learn_member_addresses(&mut self) {
        for peer in self.membership.current() {
            self.addresses.insert(peer.id, peer.address);
        }
    }

    fn capture_snapshot(&mut self) -> Result<Snapshot> {
        let index = self.last_applied;
        if index == 0 {
            return Err(Error::Unavailable("nothing has been applied yet".into()));
        }
        if let Some(latest) = self.snapshots.latest() {
            if latest.last_included_index == index {
                return Ok(latest.clone());
            }
        }

        let term = self
            .log
            .term_at(index)
            .ok_or_else(|| Error::Internal(format!("term of applied index {} unknown", index)))?;
        let snapshot = Snapshot::new(
            index,
            term,
            self.membership.clone(),
            self.state_machine.snapshot()?,
        )?;
        self.snapshots.save(snapshot.clone())?;

        let upto = index.saturating_sub(self.config.trailing_logs);
        if upto > self.log.snapshot_index() {
            self.log.truncate_prefix(upto)?;
        }
        self.applied_since_snapshot = 0;
        Ok(snapshot)
    }

    // ========== Message handlers ==========

    fn handle_request_vote(
        &mut self,
        from: &str,
        term: Term,
        candidate: &str,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) -> Result<()> {
        let current = self.hard.current_term;
        let mut granted = false;

        if term == current {
            let can_vote = match &self.hard.voted_for {
                None => self.role == NodeRole::Follower,
                Some(v) => v == candidate,
            };
            let up_to_date = last_log_term > self.log.last_term()
                || (last_log_term == self.log.last_term() && last_log_index >= self.log.last_index());

            if can_vote && up_to_date {
                granted = true;
                self.hard.voted_for = Some(candidate.to_string());
                self.persist()?;
                self.election.reset();
            }
        }

        tracing::debug!(
            "Vote for {} in term {}: {}",
            candidate,
            term,
            if granted { "granted" } else { "denied" }
        );
        self.send(
            from,
            Message::VoteResponse {
                term: current,
                vote_granted: granted,
            },
        );
        Ok(())
    }

    fn handle_vote_response(&mut self, from: &str, term: Term, granted: bool) -> Result<()> {
        if self.role != NodeRole::Candidate || term != self.hard.current_term {
            return Ok(());
        }
        let result = match self.votes.as_mut() {
            Some(tally) => {
                tally.record(from, granted);
                tally.result(&self.membership)
            }
            None => return Ok(()),
        };
        match result {
            ElectionState::Won => self.become_leader(),
            ElectionState::Lost => {
                tracing::debug!("Election for term {} lost", term);
                Ok(())
            }
            ElectionState::Pending => Ok(()),
        }
    }

    fn handle_timeout_now(&mut self, term: Term, leader: &str) -> Result<()> {
        if term != self.hard.current_term || self.role == NodeRole::Leader {
            return Ok(());
        }
        tracing::info!("Leadership transfer requested by {}", leader);
        self.campaign(true)
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_append_entries(
        &mut self,
        from: &str,
        term: Term,
        leader_id: String,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    ) -> Result<()> {
        let current = self.hard.current_term;
        if term < current {
            self.send(
                from,
                Message::AppendEntriesResponse {
                    term: current,
                    success: false,
                    match_index: 0,
                    rejected_index: prev_log_index,
                    hint_index: self.log.last_index(),
                },
            );
            return Ok(());
        }

        if self.role != NodeRole::Follower {
            self.become_follower(current, Some(leader_id.clone()))?;
        }
        self.leader_id = Some(leader_id);
        self.ticks_since_leader = 0;
        self.election.reset();

        let outcome = reconcile(
            &mut self.log,
            prev_log_index,
            prev_log_term,
            entries,
            self.hard.commit_index,
        )?;

        let response = match outcome {
            AppendOutcome::Accepted { match_index } => {
                let commit = leader_commit.min(match_index);
                if commit > self.hard.commit_index {
                    self.hard.commit_index = commit;
                    self.persist()?;
                    self.apply_committed()?;
                }
                Message::AppendEntriesResponse {
                    term: current,
                    success: true,
                    match_index,
                    rejected_index: 0,
                    hint_index: 0,
                }
            }
            AppendOutcome::Rejected { hint_index } => {
                tracing::debug!(
                    "Rejecting append at prev {} (hint {})",
                    prev_log_index,
                    hint_index
                );
                Message::AppendEntriesResponse {
                    term: current,
                    success: false,
                    match_index: 0,
                    rejected_index: prev_log_index,
                    hint_index,
                }
            }
        };
        self.send(from, response);
        Ok(())
    }

    fn handle_append_response(
        &mut self,
        from: &str,
        term: Term,
        success: bool,
        match_index: LogIndex,
        rejected_index: LogIndex,
        hint_index: LogIndex,
    ) -> Result<()> {
        if self.role != NodeRole::Leader || term != self.hard.current_term {
            return Ok(());
        }
        let last = self.log.last_index();
        let Some(p) = self.progress.get_mut(from) else {
            return Ok(());
        };
        p.last_contact_ticks = 0;

        if success {
            let advanced = p.acknowledge(match_index);
            let more = p.can_send() && p.next_index <= last;
            if advanced {
                self.maybe_commit()?;
            }
            if more && self.role == NodeRole::Leader {
                self.send_append(from)?;
            }
        } else if p.reject(rejected_index, hint_index) {
            tracing::debug!(
                "Peer {} rejected prev {}; retrying from {}",
                from,
                rejected_index,
                p.next_index
            );
            self.send_append(from)?;
        }
        Ok(())
    }

    fn handle_install_snapshot(
        &mut self,
        from: &str,
        term: Term,
        leader_id: String,
        snapshot: Snapshot,
    ) -> Result<()> {
        let current = self.hard.current_term;
        if term < current {
            self.send(
                from,
                Message::InstallSnapshotResponse {
                    term: current,
                    match_index: 0,
                },
            );
            return Ok(());
        }

        if self.role != NodeRole::Follower {
            self.become_follower(current, Some(leader_id.clone()))?;
        }
        self.leader_id = Some(leader_id);
        self.ticks_since_leader = 0;
        self.election.reset();

        let index = snapshot.last_included_index;
        let match_index = if index <= self.hard.commit_index {
            self.hard.commit_index
        } else {
            if let Err(e) = snapshot.verify() {
                tracing::warn!("Discarding snapshot from {}: {}", from, e);
                return Ok(());
            }
            self.install_snapshot(snapshot)?;
            index
        };

        self.send(
            from,
            Message::InstallSnapshotResponse {
                term: current,
                match_index,
            },
        );
        Ok(())
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let (index, term) = (snapshot.last_included_index, snapshot.last_included_term);
        tracing::info!("Installing snapshot at index {} (term {})", index, term);

        self.snapshots.save(snapshot.clone())?;
        self.state_machine.restore(&snapshot.state)?;
        self.membership = snapshot.membership;
        self.learn_member_addresses();

        if index <= self.log.last_index() && self.log.term_at(index) == Some(term) {
            self.log.truncate_prefix(index)?;
        } else {
            self.log.reset(index, term)?;
        }

        self.last_applied = index;
        self.hard.commit_index = self.hard.commit_index.max(index);
        self.applied_since_snapshot = 0;
        self.persist()?;
        self.apply_committed()
    }

    fn handle_snapshot_response(&mut self, from: &str, term: Term, match_index: LogIndex) -> Result<()> {
        if self.role != NodeRole::Leader || term != self.hard.current_term {
            return Ok(());
        }
        let Some(p) = self.progress.get_mut(from) else {
            return Ok(());
        };
        p.last_contact_ticks = 0;
        if match_index == 0 {
            return Ok(());
        }
        tracing::info!("Peer {} installed snapshot through {}", from, match_index);
        if p.acknowledge(match_index) {
            self.maybe_commit()?;
        }
        if self.role == NodeRole::Leader {
            self.send_append(from)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statemachine::{KvCommand, KvStateMachine};

    fn config(seed: u64) -> CoreConfig {
        CoreConfig {
            heartbeat_ticks: 1,
            election_ticks_min: 5,
            election_ticks_max: 10,
            lease_ticks: 10,
            seed: Some(seed),
            ..CoreConfig::default()
        }
    }

    fn core(id: &str) -> RaftCore {
        RaftCore::new(
            id,
            id,
            config(1),
            Storage::in_memory().unwrap(),
            Box::new(KvStateMachine::new()),
        )
        .unwrap()
    }

    fn set(key: &str, value: &str) -> EntryPayload {
        EntryPayload::Data(
            KvCommand::Set {
                key: key.into(),
                value: value.into(),
            }
            .encode()
            .unwrap(),
        )
    }

    fn elect(node: &mut RaftCore) {
        for _ in 0..20 {
            node.tick().unwrap();
            if node.is_leader() {
                return;
            }
        }
        panic!("node did not become leader");
    }

    #[test]
    fn test_single_node_bootstrap_and_commit() {
        let mut node = core("a");
        assert!(node.bootstrap(&[]).unwrap());
        assert!(!node.bootstrap(&[]).unwrap());
        assert_eq!(node.commit_index(), 1);
        assert_eq!(node.membership().voter_count(), 1);

        elect(&mut node);
        let (index, term) = node.propose(set("k", "v")).unwrap();
        assert_eq!(term, node.term());
        assert_eq!(node.commit_index(), index);
        assert_eq!(node.last_applied(), index);

        let events = node.take_events();
        assert!(events.contains(&CoreEvent::Applied { index, term }));
    }

    #[test]
    fn test_follower_rejects_proposals() {
        let mut node = core("a");
        node.bootstrap(&[("b".into(), "b".into())]).unwrap();
        let err = node.propose(set("k", "v")).unwrap_err();
        assert!(matches!(err, Error::NotLeader { .. }));
    }

    #[test]
    fn test_unbootstrapped_node_never_campaigns() {
        let mut node = core("a");
        for _ in 0..50 {
            node.tick().unwrap();
        }
        assert_eq!(node.role(), NodeRole::Follower);
        assert!(node.take_outbox().is_empty());
    }

    #[test]
    fn test_candidate_requests_votes_from_voters() {
        let mut node = core("a");
        node.bootstrap(&[("b".into(), "b".into()), ("c".into(), "c".into())]).unwrap();
        for _ in 0..10 {
            node.tick().unwrap();
        }
        assert_eq!(node.role(), NodeRole::Candidate);
        let out = node.take_outbox();
        let targets: Vec<_> = out.iter().map(|o| o.envelope.to.as_str()).collect();
        assert!(targets.contains(&"b") && targets.contains(&"c"));
        assert!(out
            .iter()
            .all(|o| matches!(o.envelope.message, Message::RequestVote { transfer: false, .. })));
    }

    #[test]
    fn test_stale_term_append_rejected() {
        let mut node = core("b");
        node.bootstrap(&[("a".into(), "a".into())]).unwrap();
        node.step(Envelope {
            from: "a".into(),
            from_address: "a".into(),
            to: "b".into(),
            message: Message::AppendEntries {
                term: 0,
                leader_id: "a".into(),
                prev_log_index: 1,
                prev_log_term: 1,
                entries: vec![],
                leader_commit: 1,
            },
        })
        .unwrap();
        let out = node.take_outbox();
        assert!(matches!(
            out[0].envelope.message,
            Message::AppendEntriesResponse { success: false, term: 1, .. }
        ));
    }

    #[test]
    fn test_backup_requires_snapshot() {
        let mut node = core("a");
        node.bootstrap(&[]).unwrap();
        assert!(matches!(node.backup(), Err(Error::Unavailable(_))));
        node.snapshot().unwrap();
        assert!(node.backup().is_ok());
    }

    #[test]
    fn test_remove_last_voter_refused() {
        let mut node = core("a");
        node.bootstrap(&[]).unwrap();
        elect(&mut node);
        let err = node
            .propose_membership(MembershipOp::Remove { id: "a".into() })
            .unwrap_err();
        assert!(matches!(err, Error::WouldBreakQuorum(_)));
    }

    #[test]
    fn test_second_membership_change_waits() {
        let mut node = core("a");
        node.bootstrap(&[]).unwrap();
        elect(&mut node);

        // A lone voter commits the first change by itself
        node.propose_membership(MembershipOp::Add(Peer::new("b", "b", PeerRole::Voter, 0)))
            .unwrap();
        assert_eq!(node.membership().voter_count(), 2);

        // Now b must acknowledge before anything else commits
        node.propose_membership(MembershipOp::Add(Peer::new("c", "c", PeerRole::Voter, 0)))
            .unwrap();
        assert_eq!(node.membership().voter_count(), 2);
        assert_eq!(node.stats().pending_membership_change, Some(node.log().last_index()));
        let err = node
            .propose_membership(MembershipOp::Add(Peer::new("d", "d", PeerRole::Voter, 0)))
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }

    #[test]
    fn test_failed_restore_keeps_local_state() {
        let mut source = core("a");
        source.bootstrap(&[]).unwrap();
        elect(&mut source);
        for i in 0..3 {
            source.propose(set(&format!("src{}", i), "v")).unwrap();
        }
        source.snapshot().unwrap();
        let backup = source.backup().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let cfg = WolfClusterConfig::for_node("127.0.0.1:7654", dir.path().to_path_buf());
        let mut node = RaftCore::new(
            cfg.node_id(),
            cfg.advertise_address(),
            config(2),
            Storage::open(&cfg).unwrap(),
            Box::new(KvStateMachine::new()),
        )
        .unwrap();
        node.bootstrap(&[]).unwrap();
        elect(&mut node);
        node.propose(set("local", "v")).unwrap();
        let commit = node.commit_index();

        std::fs::remove_dir_all(cfg.snapshot_dir()).unwrap();
        assert!(node.restore(&backup, true).is_err());

        let state = KvStateMachine::decode_image(&node.state_image().unwrap()).unwrap();
        assert_eq!(state.keys().collect::<Vec<_>>(), vec!["local"]);
        assert_eq!(node.commit_index(), commit);
        assert_eq!(node.last_applied(), commit);
        assert!(node.latest_snapshot().is_none());
        assert!(node.membership().contains("127.0.0.1:7654"));

        std::fs::create_dir_all(cfg.snapshot_dir()).unwrap();
        node.restore(&backup, true).unwrap();
        let state = KvStateMachine::decode_image(&node.state_image().unwrap()).unwrap();
        assert_eq!(state.len(), 3);
        assert!(node.membership().contains("a"));
    }


    #[test]
    fn test_join_of_existing_address_refused() {
        let mut node = RaftCore::new(
            "solo",
            "127.0.0.1:7654",
            config(3),
            Storage::in_memory().unwrap(),
            Box::new(KvStateMachine::new()),
        )
        .unwrap();
        node.bootstrap(&[]).unwrap();
        elect(&mut node);

        let same_address = Peer::new("127.0.0.1:7654", "127.0.0.1:7654", PeerRole::Voter, 0);
        let err = node
            .propose_membership(MembershipOp::Add(same_address))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyMember(id) if id == "solo"));
        assert_eq!(node.membership().voter_count(), 1);

        let (index, _) = node.propose(set("k", "v")).unwrap();
        assert_eq!(node.commit_index(), index);
        assert!(node.is_leader());
    }

}
