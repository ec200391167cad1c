//! Integration-level exercises of the consensus-type migration FSM (C7)
//! combined with the config-update gate (C6), approximating how a real
//! config-update submission would be checked end to end.

use orderchain::chain::{ConfigGate, ConfigUpdateInfo, MembershipChanges};
use orderchain::types::{ConsensusType, EnvelopeType, MigrationState};
use orderchain::validation::validate_transition;

fn ct(consensus_type: &str, state: MigrationState, context: u64) -> ConsensusType {
    ConsensusType {
        consensus_type: consensus_type.into(),
        migration_state: state,
        migration_context: context,
    }
}

#[test]
fn migration_start_on_a_non_system_channel_is_rejected() {
    let current = ct("kafka", MigrationState::None, 0);
    let proposed = ct("kafka", MigrationState::Start, 0);
    let err = validate_transition(&current, &proposed, false).unwrap_err();
    assert!(err
        .to_string()
        .contains("unexpected migration state transition"));
}

#[test]
fn committing_without_first_starting_is_rejected() {
    let current = ct("kafka", MigrationState::None, 0);
    let proposed = ct("etcdraft", MigrationState::Commit, 5);
    let err = validate_transition(&current, &proposed, true).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Attempted to change consensus type from kafka to etcdraft, unexpected migration state transition: MIG_STATE_NONE to MIG_STATE_COMMIT"
    );
}

#[test]
fn context_path_requires_non_system_channel_and_type_change() {
    let current = ct("kafka", MigrationState::None, 0);

    // Same channel class but no type change: rejected.
    let no_type_change = ct("kafka", MigrationState::Context, 3);
    assert!(validate_transition(&current, &no_type_change, false).is_err());

    // Right shape on the wrong channel class: rejected.
    let right_shape_wrong_channel = ct("etcdraft", MigrationState::Context, 3);
    assert!(validate_transition(&current, &right_shape_wrong_channel, true).is_err());

    // Right shape, right channel class: admitted.
    let admitted = ct("etcdraft", MigrationState::Context, 3);
    validate_transition(&current, &admitted, false).unwrap();
}

#[test]
fn consensus_type_change_proposal_with_concurrent_membership_change_is_gated_out() {
    // Even if the migration FSM itself would accept a Start step, the gate
    // independently refuses to admit a config envelope that changes the
    // consensus type and the consenter set in the same block.
    let update_info = ConfigUpdateInfo {
        updates_consensus_type: true,
        membership_changes: MembershipChanges {
            total_changes: 2,
            ..Default::default()
        },
    };

    let err = ConfigGate::admit(EnvelopeType::Config, Some(&update_info)).unwrap_err();
    assert!(err
        .to_string()
        .contains("update of consenters set is not allowed when also updating consensus type"));
}

#[test]
fn consensus_type_change_proposal_alone_passes_the_gate_and_the_fsm() {
    let update_info = ConfigUpdateInfo {
        updates_consensus_type: true,
        membership_changes: MembershipChanges::default(),
    };
    ConfigGate::admit(EnvelopeType::Config, Some(&update_info)).unwrap();

    let current = ct("kafka", MigrationState::None, 0);
    let proposed = ct("kafka", MigrationState::Start, 0);
    validate_transition(&current, &proposed, true).unwrap();
}
