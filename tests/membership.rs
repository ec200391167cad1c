//! Integration-level exercises of the membership manager (C5) simulating
//! a full add-then-remove consenter lifecycle across elections.

use std::collections::BTreeMap;

use orderchain::chain::MembershipManager;
use orderchain::types::{ConsenterInfo, RaftMetadata};
use raft::eraftpb::{ConfChangeType, ConfState};

fn consenter(host: &str) -> ConsenterInfo {
    ConsenterInfo {
        host: host.into(),
        port: 7050,
        server_tls_cert_pem: vec![],
        client_tls_cert_pem: vec![],
    }
}

#[test]
fn add_node_then_remove_node_lifecycle() {
    let mut initial = BTreeMap::new();
    initial.insert(1, consenter("node1"));
    initial.insert(2, consenter("node2"));
    let manager = MembershipManager::new(RaftMetadata {
        consenters: initial,
        raft_index: 0,
    });

    let mut proposed = manager.raft_metadata().consenters;
    proposed.insert(3, consenter("node3"));
    let cc = manager
        .update_raft_metadata_and_conf_change(&proposed, 1)
        .unwrap();
    assert_eq!(cc.node_id, 3);
    assert_eq!(cc.get_change_type(), ConfChangeType::AddNode);
    manager.set_in_progress(cc.clone());

    assert!(manager.clear_if_matches(&cc));
    assert!(manager.conf_change_in_progress().is_none());
    assert_eq!(manager.raft_metadata().consenters.len(), 3);

    let mut proposed = manager.raft_metadata().consenters;
    proposed.remove(&2);
    let cc = manager
        .update_raft_metadata_and_conf_change(&proposed, 2)
        .unwrap();
    assert_eq!(cc.node_id, 2);
    assert_eq!(cc.get_change_type(), ConfChangeType::RemoveNode);

    assert_eq!(manager.raft_metadata().consenters.len(), 2);
    assert!(!manager.raft_metadata().consenters.contains_key(&2));
}

#[test]
fn newly_elected_leader_resumes_unfinished_add_from_stale_conf_state() {
    let mut consenters = BTreeMap::new();
    consenters.insert(1, consenter("node1"));
    consenters.insert(2, consenter("node2"));
    let manager = MembershipManager::new(RaftMetadata::default());

    let last_block_metadata = RaftMetadata {
        consenters,
        raft_index: 4,
    };
    let live_conf_state = ConfState {
        voters: vec![1],
        ..Default::default()
    };

    let resumed = manager
        .get_in_flight_conf_change(Some(&last_block_metadata), &live_conf_state)
        .expect("a membership change should be resumed");
    assert_eq!(resumed.node_id, 2);
    assert_eq!(resumed.get_change_type(), ConfChangeType::AddNode);
}

#[test]
fn no_resume_when_ledger_and_conf_state_already_agree() {
    let manager = MembershipManager::new(RaftMetadata::default());
    let mut consenters = BTreeMap::new();
    consenters.insert(1, consenter("node1"));
    let last_block_metadata = RaftMetadata {
        consenters,
        raft_index: 1,
    };
    let live_conf_state = ConfState {
        voters: vec![1],
        ..Default::default()
    };

    assert!(manager
        .get_in_flight_conf_change(Some(&last_block_metadata), &live_conf_state)
        .is_none());
}
