//! Consensus-type migration finite state machine (§4.7.1).

use crate::error::{OrdererError, Result};
use crate::types::{ConsensusType, MigrationState};

/// Validate a consensus-type transition. `is_system_channel` carries the
/// caller's capability-derived classification of the channel; the FSM
/// itself is otherwise a pure function of the two descriptors.
pub fn validate_transition(
    current: &ConsensusType,
    proposed: &ConsensusType,
    is_system_channel: bool,
) -> Result<()> {
    // The context check runs before the transition-table check (§4.7.1).
    if matches!(
        proposed.migration_state,
        MigrationState::Commit | MigrationState::Context
    ) && proposed.migration_context == 0
    {
        return Err(OrdererError::Validation(format!(
            "Consensus migration state {}, unexpected migration context: 0 (expected >0)",
            proposed.migration_state
        )));
    }

    if is_allowed_transition(current, proposed, is_system_channel) {
        return Ok(());
    }

    let message = if current.consensus_type != proposed.consensus_type {
        format!(
            "Attempted to change consensus type from {} to {}, unexpected migration state transition: {} to {}",
            current.consensus_type,
            proposed.consensus_type,
            current.migration_state,
            proposed.migration_state
        )
    } else {
        format!(
            "Consensus type {}, unexpected migration state transition: {} to {}",
            current.consensus_type, current.migration_state, proposed.migration_state
        )
    };
    Err(OrdererError::Validation(message))
}

fn is_allowed_transition(
    current: &ConsensusType,
    proposed: &ConsensusType,
    is_system_channel: bool,
) -> bool {
    use MigrationState::*;

    let same_type = current.consensus_type == proposed.consensus_type;
    let t0 = current.consensus_type.as_str();
    let t1 = proposed.consensus_type.as_str();

    match (current.migration_state, proposed.migration_state) {
        (None, None) => same_type,
        (None, Start) => is_system_channel && same_type && t0 == "kafka",
        (Start, Start) => is_system_channel && same_type,
        (Start, Abort) => is_system_channel && same_type && t0 == "kafka",
        (Start, Commit) => is_system_channel && !same_type && t0 == "kafka" && t1 == "etcdraft",
        (Commit, None) => is_system_channel && same_type && t0 == "etcdraft",
        (Abort, None) => is_system_channel && same_type && t0 == "kafka",
        (Abort, Start) => is_system_channel && same_type && t0 == "kafka",
        (None, Context) => !is_system_channel && !same_type && t0 == "kafka" && t1 == "etcdraft",
        (Context, None) => !is_system_channel && same_type && t0 == "etcdraft",
        _ => false,
    }
}
