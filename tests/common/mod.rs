//! Deterministic in-process cluster simulator
//!
//! Drives several consensus cores by hand: every round ticks each node
//! once and then delivers queued messages until the network is quiet.
//! Safety properties are checked after every delivered message.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use wolfcluster::consensus::{CoreConfig, RaftCore, Storage};
use wolfcluster::replication::Envelope;
use wolfcluster::state::NodeRole;
use wolfcluster::statemachine::{KvCommand, KvStateMachine};
use wolfcluster::wal::{EntryPayload, LogEntry, LogIndex, Term};

/// Upper bound on messages handled per round
const MAX_DELIVERIES_PER_ROUND: usize = 100_000;

pub fn sim_config(seed: u64) -> CoreConfig {
    CoreConfig {
        heartbeat_ticks: 1,
        election_ticks_min: 10,
        election_ticks_max: 20,
        lease_ticks: 20,
        max_batch_entries: 16,
        snapshot_threshold: 0,
        trailing_logs: 4,
        seed: Some(seed),
    }
}

pub fn set(key: &str, value: &str) -> Vec<u8> {
    KvCommand::Set {
        key: key.into(),
        value: value.into(),
    }
    .encode()
    .unwrap()
}

pub struct Sim {
    pub nodes: BTreeMap<String, RaftCore>,
    queue: VecDeque<Envelope>,
    isolated: HashSet<String>,
    rng: StdRng,
    /// Probability that any message is lost
    pub drop_rate: f64,
    seed: u64,
    leaders_by_term: BTreeMap<Term, String>,
    commits: BTreeMap<String, LogIndex>,
}

impl Sim {
    /// A bootstrapped cluster of `n` voters named n1..nN
    pub fn new(n: usize, seed: u64) -> Self {
        let mut sim = Self::empty(seed);
        let ids: Vec<String> = (1..=n).map(|i| format!("n{}", i)).collect();
        for id in &ids {
            sim.add_node(id);
        }
        for id in &ids {
            let peers: Vec<(String, String)> = ids
                .iter()
                .filter(|p| *p != id)
                .map(|p| (p.clone(), p.clone()))
                .collect();
            sim.node_mut(id).bootstrap(&peers).unwrap();
        }
        sim
    }

    pub fn empty(seed: u64) -> Self {
        Self {
            nodes: BTreeMap::new(),
            queue: VecDeque::new(),
            isolated: HashSet::new(),
            rng: StdRng::seed_from_u64(seed),
            drop_rate: 0.0,
            seed,
            leaders_by_term: BTreeMap::new(),
            commits: BTreeMap::new(),
        }
    }

    /// Add a fresh node that is not part of any cluster yet
    pub fn add_node(&mut self, id: &str) {
        self.add_node_with(id, sim_config(self.seed * 100 + self.nodes.len() as u64));
    }

    pub fn add_node_with(&mut self, id: &str, config: CoreConfig) {
        let core = RaftCore::new(
            id,
            id,
            config,
            Storage::in_memory().unwrap(),
            Box::new(KvStateMachine::new()),
        )
        .unwrap();
        self.nodes.insert(id.to_string(), core);
    }

    pub fn node(&self, id: &str) -> &RaftCore {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: &str) -> &mut RaftCore {
        self.nodes.get_mut(id).unwrap()
    }

    pub fn isolate(&mut self, id: &str) {
        self.isolated.insert(id.to_string());
    }

    pub fn heal(&mut self) {
        self.isolated.clear();
    }

    /// Tick every node once and deliver all resulting traffic
    pub fn round(&mut self) {
        let ids: Vec<String> = self.nodes.keys().cloned().collect();
        for id in &ids {
            self.node_mut(id).tick().unwrap();
            self.collect(id);
        }
        self.deliver();
    }

    pub fn run(&mut self, rounds: usize) {
        for _ in 0..rounds {
            self.round();
        }
    }

    /// Run until `pred` holds; returns false if it never did
    pub fn run_until(&mut self, max_rounds: usize, mut pred: impl FnMut(&Sim) -> bool) -> bool {
        for _ in 0..max_rounds {
            if pred(self) {
                return true;
            }
            self.round();
        }
        pred(self)
    }

    /// Current leader among reachable nodes, highest term first
    pub fn leader(&self) -> Option<String> {
        self.nodes
            .iter()
            .filter(|(id, n)| n.is_leader() && !self.isolated.contains(*id))
            .max_by_key(|(_, n)| n.term())
            .map(|(id, _)| id.clone())
    }

    pub fn elect(&mut self) -> String {
        assert!(
            self.run_until(500, |s| s.leader().is_some()),
            "no leader elected"
        );
        self.leader().unwrap()
    }

    /// Propose on the leader and run until every reachable member applied it
    pub fn commit(&mut self, payload: EntryPayload) -> LogIndex {
        let leader = self.elect();
        let (index, _) = self.node_mut(&leader).propose(payload).unwrap();
        self.collect(&leader);
        self.deliver();
        let reachable: Vec<String> = self
            .node(&leader)
            .membership()
            .current()
            .into_iter()
            .map(|p| p.id)
            .filter(|id| !self.isolated.contains(id) && self.nodes.contains_key(id))
            .collect();
        let ok = self.run_until(500, |s| {
            reachable.iter().all(|id| s.node(id).last_applied() >= index)
        });
        assert!(ok, "entry {} did not apply everywhere", index);
        index
    }

    pub fn write(&mut self, key: &str, value: &str) -> LogIndex {
        self.commit(EntryPayload::Data(set(key, value)))
    }

    /// Queue a node's outgoing messages
    pub fn collect(&mut self, id: &str) {
        let outbox = self.node_mut(id).take_outbox();
        self.node_mut(id).take_events();
        for out in outbox {
            self.queue.push_back(out.envelope);
        }
    }

    pub fn deliver(&mut self) {
        let mut delivered = 0;
        while let Some(envelope) = self.queue.pop_front() {
            delivered += 1;
            assert!(delivered < MAX_DELIVERIES_PER_ROUND, "message storm");

            if self.isolated.contains(&envelope.from) || self.isolated.contains(&envelope.to) {
                continue;
            }
            if self.drop_rate > 0.0 && self.rng.gen_bool(self.drop_rate) {
                continue;
            }
            let to = envelope.to.clone();
            let Some(node) = self.nodes.get_mut(&to) else {
                continue;
            };
            node.step(envelope).unwrap();
            self.collect(&to);
            self.check_safety();
        }
        self.check_safety();
    }

    /// One leader per term, commit indexes never move backwards
    fn check_safety(&mut self) {
        for (id, node) in &self.nodes {
            if node.role() == NodeRole::Leader {
                let leader = self
                    .leaders_by_term
                    .entry(node.term())
                    .or_insert_with(|| id.clone());
                assert_eq!(leader, id, "two leaders in term {}", node.term());
            }
            let commit = self.commits.entry(id.clone()).or_insert(0);
            assert!(
                node.commit_index() >= *commit,
                "commit index of {} moved back from {} to {}",
                id,
                commit,
                node.commit_index()
            );
            *commit = node.commit_index();
        }
    }

    /// Forget the recorded commit index of a node whose state was replaced
    pub fn reset_commit_tracking(&mut self, id: &str) {
        self.commits.remove(id);
    }

    /// Whole log of a node (requires no compaction)
    pub fn log_of(&self, id: &str) -> Vec<LogEntry> {
        let log = self.node(id).log();
        log.entries(log.first_index(), log.last_index()).unwrap()
    }

    pub fn data_entries(&self, id: &str) -> Vec<Vec<u8>> {
        self.log_of(id)
            .into_iter()
            .filter_map(|e| match e.payload {
                EntryPayload::Data(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    pub fn state_of(&self, id: &str) -> BTreeMap<String, String> {
        KvStateMachine::decode_image(&self.node(id).state_image().unwrap()).unwrap()
    }
}
