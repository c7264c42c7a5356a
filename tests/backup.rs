//! Backup and restore of the replicated state

mod common;

use common::{sim_config, Sim};
use wolfcluster::error::{Error, ErrorKind};

/// Cluster with data split between a snapshot and trailing entries
fn populated() -> (Sim, String, Vec<u8>) {
    let mut sim = Sim::new(3, 31);
    for i in 0..10 {
        sim.write(&format!("snap{}", i), "a");
    }
    let leader = sim.elect();
    sim.node_mut(&leader).snapshot().unwrap();
    for i in 0..5 {
        sim.write(&format!("tail{}", i), "b");
    }
    let backup = sim.node(&leader).backup().unwrap();
    (sim, leader, backup)
}

fn standalone(sim: &mut Sim, id: &str) {
    sim.add_node_with(id, sim_config(99));
    sim.node_mut(id).bootstrap(&[]).unwrap();
}

#[test]
fn test_restore_on_isolated_node_reproduces_state() {
    let (mut sim, leader, backup) = populated();
    standalone(&mut sim, "r1");
    sim.isolate("r1");

    let index = sim.node_mut("r1").restore(&backup, false).unwrap();
    sim.reset_commit_tracking("r1");

    let restored = sim.node("r1");
    assert_eq!(index, sim.node(&leader).commit_index());
    assert_eq!(restored.commit_index(), index);
    assert_eq!(restored.last_applied(), index);
    assert_eq!(restored.log().last_index(), index);
    assert_eq!(restored.latest_snapshot().unwrap().last_included_index, index);
    assert_eq!(
        restored.membership().current(),
        sim.node(&leader).membership().current()
    );
    assert_eq!(sim.state_of("r1"), sim.state_of(&leader));
    assert_eq!(sim.state_of("r1").len(), 15);
}

#[test]
fn test_restore_into_fresh_node() {
    let (mut sim, leader, backup) = populated();
    sim.add_node("fresh");
    sim.isolate("fresh");

    sim.node_mut("fresh").restore(&backup, false).unwrap();
    assert_eq!(sim.state_of("fresh"), sim.state_of(&leader));
}

#[test]
fn test_restore_rejected_on_cluster_member() {
    let (mut sim, leader, backup) = populated();
    let err = sim.node_mut(&leader).restore(&backup, false).unwrap_err();
    assert!(matches!(err, Error::RestoreRejected(_)));
    assert_eq!(err.kind(), ErrorKind::Precondition);
}

#[test]
fn test_corrupt_backup_rejected() {
    let (mut sim, _, mut backup) = populated();
    standalone(&mut sim, "r1");
    let before = sim.node("r1").commit_index();

    let last = backup.len() - 1;
    backup[last] ^= 0xff;
    let err = sim.node_mut("r1").restore(&backup, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptSnapshot);

    let err = sim.node_mut("r1").restore(b"not a backup", false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptSnapshot);
    assert_eq!(sim.node("r1").commit_index(), before);
}

#[test]
fn test_stale_backup_requires_force() {
    let mut sim = Sim::new(1, 32);
    sim.write("a", "1");
    sim.node_mut("n1").snapshot().unwrap();
    let old = sim.node("n1").backup().unwrap();

    for i in 0..5 {
        sim.write(&format!("b{}", i), "2");
    }
    let commit = sim.node("n1").commit_index();

    let err = sim.node_mut("n1").restore(&old, false).unwrap_err();
    match err {
        Error::StaleSnapshot {
            snapshot_index,
            commit_index,
        } => {
            assert!(snapshot_index < commit_index);
            assert_eq!(commit_index, commit);
        }
        other => panic!("unexpected error: {}", other),
    }

    let index = sim.node_mut("n1").restore(&old, true).unwrap();
    sim.reset_commit_tracking("n1");
    assert!(index < commit);
    assert_eq!(sim.node("n1").commit_index(), index);
    let state = sim.state_of("n1");
    assert_eq!(state.len(), 1);
    assert!(!state.contains_key("b0"));

    // The restored node leads its single-voter cluster again
    sim.write("c", "3");
    assert!(sim.state_of("n1").contains_key("c"));
}

#[test]
fn test_backup_requires_a_snapshot() {
    let mut sim = Sim::new(3, 33);
    sim.write("a", "1");
    let leader = sim.elect();
    let err = sim.node(&leader).backup().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
}
