//! Membership manager (C5): consenter-set diffing, ConfChange minting, and
//! in-flight change tracking.

use std::collections::BTreeMap;

use parking_lot::{Mutex, RwLock};
use raft::eraftpb::{ConfChange, ConfChangeType, ConfState};

use crate::types::{ConsenterInfo, RaftMetadata};

/// Result of diffing two consenter sets.
#[derive(Debug, Clone, Default)]
pub struct MembershipChanges {
    pub added: BTreeMap<u64, ConsenterInfo>,
    pub removed: BTreeMap<u64, ConsenterInfo>,
    pub total_changes: usize,
}

/// Diff two consenter-id → info maps. Pure; used by both C5 and C6.
pub fn compute_membership_changes(
    current: &BTreeMap<u64, ConsenterInfo>,
    proposed: &BTreeMap<u64, ConsenterInfo>,
) -> MembershipChanges {
    let added: BTreeMap<u64, ConsenterInfo> = proposed
        .iter()
        .filter(|(id, _)| !current.contains_key(id))
        .map(|(id, info)| (*id, info.clone()))
        .collect();
    let removed: BTreeMap<u64, ConsenterInfo> = current
        .iter()
        .filter(|(id, _)| !proposed.contains_key(id))
        .map(|(id, info)| (*id, info.clone()))
        .collect();
    let total_changes = added.len() + removed.len();
    MembershipChanges {
        added,
        removed,
        total_changes,
    }
}

fn conf_change(change_type: ConfChangeType, node_id: u64) -> ConfChange {
    let mut cc = ConfChange::default();
    cc.set_change_type(change_type);
    cc.node_id = node_id;
    cc
}

/// Owns the current raft metadata and tracks the single in-flight
/// `ConfChange`, if any. The chain serializer (C4) is the only caller;
/// it holds the lock for the duration of one config-block apply, never
/// across an await on the Raft adapter.
pub struct MembershipManager {
    raft_metadata: RwLock<RaftMetadata>,
    conf_change_in_progress: Mutex<Option<ConfChange>>,
}

impl MembershipManager {
    pub fn new(initial: RaftMetadata) -> Self {
        MembershipManager {
            raft_metadata: RwLock::new(initial),
            conf_change_in_progress: Mutex::new(None),
        }
    }

    pub fn raft_metadata(&self) -> RaftMetadata {
        self.raft_metadata.read().clone()
    }

    pub fn conf_change_in_progress(&self) -> Option<ConfChange> {
        self.conf_change_in_progress.lock().clone()
    }

    /// Clear the in-progress change if `applied` has the same node id and
    /// change type. Returns whether it matched (and was cleared).
    pub fn clear_if_matches(&self, applied: &ConfChange) -> bool {
        let mut guard = self.conf_change_in_progress.lock();
        let matches = guard
            .as_ref()
            .map(|cc| cc.node_id == applied.node_id && cc.get_change_type() == applied.get_change_type())
            .unwrap_or(false);
        if matches {
            *guard = None;
        }
        matches
    }

    /// Diff `proposed` against the stored consenter set, mint a ConfChange
    /// for the single add or remove, and atomically swap in the new
    /// metadata. Returns `None` if there is no change; policy (at most one
    /// change per config block) is enforced upstream by C6.
    pub fn update_raft_metadata_and_conf_change(
        &self,
        proposed: &BTreeMap<u64, ConsenterInfo>,
        raft_index: u64,
    ) -> Option<ConfChange> {
        let mut metadata = self.raft_metadata.write();
        let changes = compute_membership_changes(&metadata.consenters, proposed);

        let cc = if let Some((&new_id, _)) = changes.added.iter().next() {
            Some(conf_change(ConfChangeType::AddNode, new_id))
        } else {
            changes
                .removed
                .iter()
                .next()
                .map(|(&removed_id, _)| conf_change(ConfChangeType::RemoveNode, removed_id))
        };

        metadata.consenters = proposed.clone();
        metadata.raft_index = raft_index;
        cc
    }

    /// Store a freshly proposed ConfChange as the in-progress one.
    pub fn set_in_progress(&self, cc: ConfChange) {
        *self.conf_change_in_progress.lock() = Some(cc);
    }

    /// Resume an unfinished membership change on election: prefer the
    /// explicitly tracked in-progress change; otherwise, if the last
    /// ledger block was a config block whose stored consenter set
    /// disagrees in cardinality with the live `ConfState`, synthesize the
    /// appropriate ConfChange from the diff.
    pub fn get_in_flight_conf_change(
        &self,
        last_block_metadata: Option<&RaftMetadata>,
        live_conf_state: &ConfState,
    ) -> Option<ConfChange> {
        if let Some(cc) = self.conf_change_in_progress() {
            return Some(cc);
        }

        let stored = last_block_metadata?;
        let stored_count = stored.consenters.len();
        let live_count = live_conf_state.voters.len();
        if stored_count == live_count {
            return None;
        }

        if stored_count > live_count {
            let new_id = *stored
                .consenters
                .keys()
                .find(|id| !live_conf_state.voters.contains(id))?;
            Some(conf_change(ConfChangeType::AddNode, new_id))
        } else {
            let removed_id = *live_conf_state
                .voters
                .iter()
                .find(|id| !stored.consenters.contains_key(id))?;
            Some(conf_change(ConfChangeType::RemoveNode, removed_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(host: &str) -> ConsenterInfo {
        ConsenterInfo {
            host: host.into(),
            port: 7050,
            server_tls_cert_pem: vec![],
            client_tls_cert_pem: vec![],
        }
    }

    #[test]
    fn diff_detects_single_add() {
        let mut current = BTreeMap::new();
        current.insert(1, info("a"));
        let mut proposed = current.clone();
        proposed.insert(2, info("b"));

        let changes = compute_membership_changes(&current, &proposed);
        assert_eq!(changes.total_changes, 1);
        assert!(changes.added.contains_key(&2));
    }

    #[test]
    fn diff_detects_single_removal() {
        let mut current = BTreeMap::new();
        current.insert(1, info("a"));
        current.insert(2, info("b"));
        let mut proposed = current.clone();
        proposed.remove(&2);

        let changes = compute_membership_changes(&current, &proposed);
        assert_eq!(changes.total_changes, 1);
        assert!(changes.removed.contains_key(&2));
    }

    #[test]
    fn update_metadata_mints_add_node_conf_change() {
        let mut current = BTreeMap::new();
        current.insert(1, info("a"));
        let manager = MembershipManager::new(RaftMetadata {
            consenters: current,
            raft_index: 0,
        });

        let mut proposed = manager.raft_metadata().consenters;
        proposed.insert(2, info("b"));

        let cc = manager
            .update_raft_metadata_and_conf_change(&proposed, 5)
            .unwrap();
        assert_eq!(cc.node_id, 2);
        assert_eq!(cc.get_change_type(), ConfChangeType::AddNode);
        assert_eq!(manager.raft_metadata().raft_index, 5);
        assert_eq!(manager.raft_metadata().consenters.len(), 2);
    }

    #[test]
    fn in_progress_change_clears_on_matching_apply() {
        let manager = MembershipManager::new(RaftMetadata::default());
        let cc = conf_change(ConfChangeType::AddNode, 9);
        manager.set_in_progress(cc.clone());
        assert!(manager.clear_if_matches(&cc));
        assert!(manager.conf_change_in_progress().is_none());
    }

    #[test]
    fn get_in_flight_prefers_explicit_progress() {
        let manager = MembershipManager::new(RaftMetadata::default());
        let cc = conf_change(ConfChangeType::AddNode, 3);
        manager.set_in_progress(cc.clone());

        let resumed = manager.get_in_flight_conf_change(None, &ConfState::default());
        assert_eq!(resumed.unwrap().node_id, 3);
    }

    #[test]
    fn get_in_flight_synthesizes_from_stale_conf_state() {
        let manager = MembershipManager::new(RaftMetadata::default());
        let mut stored_consenters = BTreeMap::new();
        stored_consenters.insert(1, info("a"));
        stored_consenters.insert(2, info("b"));
        let stored = RaftMetadata {
            consenters: stored_consenters,
            raft_index: 10,
        };
        let live = ConfState {
            voters: vec![1],
            ..Default::default()
        };

        let resumed = manager
            .get_in_flight_conf_change(Some(&stored), &live)
            .unwrap();
        assert_eq!(resumed.node_id, 2);
        assert_eq!(resumed.get_change_type(), ConfChangeType::AddNode);
    }
}
