//! Election and replication behaviour of the consensus core

mod common;

use common::{set, Sim};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use wolfcluster::error::Error;
use wolfcluster::replication::Message;
use wolfcluster::state::NodeRole;
use wolfcluster::wal::EntryPayload;

#[test]
fn test_three_nodes_elect_one_leader() {
    let mut sim = Sim::new(3, 1);
    let leader = sim.elect();
    let term = sim.node(&leader).term();

    sim.run(50);
    assert_eq!(sim.leader(), Some(leader.clone()));
    assert_eq!(sim.node(&leader).term(), term);
    for id in ["n1", "n2", "n3"] {
        if id != leader {
            assert_eq!(sim.node(id).role(), NodeRole::Follower);
            assert_eq!(sim.node(id).leader_id(), Some(leader.as_str()));
        }
    }
}

#[test]
fn test_replicated_entries_apply_in_order_everywhere() {
    let mut sim = Sim::new(3, 2);
    for i in 0..20 {
        sim.write(&format!("k{}", i), &i.to_string());
    }
    sim.run(5);

    let reference = sim.state_of("n1");
    assert_eq!(reference.len(), 20);
    for id in ["n2", "n3"] {
        assert_eq!(sim.state_of(id), reference);
        assert_eq!(sim.node(id).last_applied(), sim.node("n1").last_applied());
    }
}

#[test]
fn test_partitioned_leader_rejoins_and_converges() {
    let mut sim = Sim::new(3, 3);
    for i in 0..10 {
        sim.write(&format!("a{}", i), "x");
    }
    let old = sim.elect();

    // Cut the leader off; an entry it accepts now can never commit
    sim.isolate(&old);
    sim.node_mut(&old)
        .propose(EntryPayload::Data(set("lost", "1")))
        .unwrap();
    sim.collect(&old);

    let ok = sim.run_until(500, |s| s.leader().map_or(false, |l| l != old));
    assert!(ok, "majority side did not elect a new leader");
    for i in 0..5 {
        sim.write(&format!("b{}", i), "y");
    }

    // The isolated node steps down once it loses contact with the quorum
    assert!(sim.run_until(100, |s| s.node(&old).role() != NodeRole::Leader));

    sim.heal();
    let ok = sim.run_until(2000, |s| {
        let Some(leader) = s.leader() else { return false };
        let target = s.node(&leader).commit_index();
        ["n1", "n2", "n3"]
            .iter()
            .all(|id| s.node(id).commit_index() == target && s.node(id).log().last_index() == target)
    });
    assert!(ok, "cluster did not converge after heal");

    let reference = sim.log_of("n1");
    for id in ["n2", "n3"] {
        let log = sim.log_of(id);
        assert_eq!(log.len(), reference.len());
        for (a, b) in log.iter().zip(&reference) {
            assert_eq!((a.index, a.term), (b.index, b.term));
        }
    }
    assert_eq!(sim.data_entries("n1").len(), 15);
    assert!(!sim.state_of(&old).contains_key("lost"));
    assert_eq!(sim.state_of(&old), sim.state_of("n1"));
}

#[test]
fn test_one_leader_per_term_under_random_faults() {
    for seed in 10..14 {
        let mut sim = Sim::new(5, seed);
        sim.drop_rate = 0.05;
        let mut rng = StdRng::seed_from_u64(seed);
        let ids = ["n1", "n2", "n3", "n4", "n5"];

        for round in 0..1500 {
            if round % 60 == 0 {
                sim.heal();
                for id in ids {
                    if rng.gen_bool(0.3) {
                        sim.isolate(id);
                    }
                }
            }
            if round % 7 == 0 {
                if let Some(leader) = sim.leader() {
                    let _ = sim
                        .node_mut(&leader)
                        .propose(EntryPayload::Data(set("k", &round.to_string())));
                    sim.collect(&leader);
                }
            }
            // Safety is asserted by the simulator after every message
            sim.round();
        }

        // Once the network is healthy again the cluster makes progress
        sim.heal();
        sim.drop_rate = 0.0;
        let index = sim.write("final", "done");
        for id in ids {
            assert!(sim.node(id).commit_index() >= index);
        }
    }
}

#[test]
fn test_stale_leader_cannot_commit_alone() {
    let mut sim = Sim::new(3, 4);
    let leader = sim.elect();
    let before = sim.node(&leader).commit_index();

    sim.isolate(&leader);
    let (index, _) = sim
        .node_mut(&leader)
        .propose(EntryPayload::Data(set("k", "v")))
        .unwrap();
    sim.run(5);
    assert!(sim.node(&leader).commit_index() < index);
    assert_eq!(sim.node(&leader).commit_index(), before);
}

#[test]
fn test_follower_redirects_proposals_to_leader() {
    let mut sim = Sim::new(3, 5);
    let leader = sim.elect();
    sim.run(3);
    let follower = ["n1", "n2", "n3"]
        .into_iter()
        .find(|id| *id != leader)
        .unwrap();

    let err = sim
        .node_mut(follower)
        .propose(EntryPayload::Data(set("k", "v")))
        .unwrap_err();
    match err {
        Error::NotLeader { leader: Some(addr) } => assert_eq!(addr, leader),
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_lagging_follower_catches_up_from_snapshot() {
    let mut sim = Sim::new(3, 6);
    let leader = sim.elect();
    let lagging = ["n1", "n2", "n3"]
        .into_iter()
        .find(|id| *id != leader)
        .unwrap()
        .to_string();

    sim.isolate(&lagging);
    for i in 0..30 {
        sim.write(&format!("k{}", i), "v");
    }
    let snapshot = sim.node_mut(&leader).snapshot().unwrap();
    assert!(sim.node(&leader).log().snapshot_index() > 0);

    sim.heal();
    let target = sim.node(&leader).commit_index();
    assert!(sim.run_until(500, |s| s.node(&lagging).commit_index() >= target));
    assert!(sim.node(&lagging).latest_snapshot().unwrap().last_included_index >= snapshot.last_included_index);
    assert_eq!(sim.state_of(&lagging), sim.state_of(&leader));
}

#[test]
fn test_disruptive_candidate_is_ignored_while_leader_active() {
    let mut sim = Sim::new(3, 7);
    let leader = sim.elect();
    let term = sim.node(&leader).term();
    sim.run(2);

    let follower = ["n1", "n2", "n3"]
        .into_iter()
        .find(|id| *id != leader)
        .unwrap();
    sim.node_mut(follower)
        .step(wolfcluster::replication::Envelope {
            from: "rogue".into(),
            from_address: "rogue".into(),
            to: follower.into(),
            message: Message::RequestVote {
                term: term + 5,
                candidate_id: "rogue".into(),
                last_log_index: 1000,
                last_log_term: term + 4,
                transfer: false,
            },
        })
        .unwrap();
    assert_eq!(sim.node(follower).term(), term);
    assert!(sim.node_mut(follower).take_outbox().is_empty());
}
