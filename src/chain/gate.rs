//! Config-update gate (C6): pre-admission validation of config envelopes
//! on the submission path.

use crate::error::{OrdererError, Result};
use crate::types::EnvelopeType;

use super::membership::MembershipChanges;

/// What `Configure()`'s caller already decoded from a `CONFIG` envelope's
/// write-set. Decoding the write-set itself is out of scope for this
/// crate (configuration-bundle construction from wire messages is an
/// external collaborator concern) — the gate only enforces the policy
/// once that decoding has happened.
#[derive(Debug, Clone)]
pub struct ConfigUpdateInfo {
    pub updates_consensus_type: bool,
    pub membership_changes: MembershipChanges,
}

/// Stateless gate; `admit` is the sole entry point.
pub struct ConfigGate;

impl ConfigGate {
    /// `ORDERER_TRANSACTION` envelopes are admitted unconditionally (they
    /// carry previously validated config, not a new proposal). `CONFIG`
    /// envelopes require `update_info`; if the write-set changes the
    /// consensus type, a simultaneous consenter-set change is rejected.
    pub fn admit(envelope_type: EnvelopeType, update_info: Option<&ConfigUpdateInfo>) -> Result<()> {
        match envelope_type {
            EnvelopeType::OrdererTransaction => Ok(()),
            EnvelopeType::Config => {
                let info = update_info.ok_or_else(|| {
                    OrdererError::Validation("config envelope missing decoded write-set".into())
                })?;
                if info.updates_consensus_type && info.membership_changes.total_changes > 1 {
                    return Err(OrdererError::Validation(format!(
                        "update of consenters set is not allowed when also updating consensus type, total changes: {}",
                        info.membership_changes.total_changes
                    )));
                }
                Ok(())
            }
            EnvelopeType::Normal => Err(OrdererError::Validation(
                "Configure() called with a non-config envelope".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orderer_transaction_always_admitted() {
        ConfigGate::admit(EnvelopeType::OrdererTransaction, None).unwrap();
    }

    #[test]
    fn normal_envelope_rejected() {
        let err = ConfigGate::admit(EnvelopeType::Normal, None).unwrap_err();
        assert!(matches!(err, OrdererError::Validation(_)));
    }

    #[test]
    fn config_without_update_info_rejected() {
        let err = ConfigGate::admit(EnvelopeType::Config, None).unwrap_err();
        assert!(matches!(err, OrdererError::Validation(_)));
    }

    #[test]
    fn consensus_type_change_with_membership_change_rejected() {
        let info = ConfigUpdateInfo {
            updates_consensus_type: true,
            membership_changes: MembershipChanges {
                total_changes: 2,
                ..Default::default()
            },
        };
        let err = ConfigGate::admit(EnvelopeType::Config, Some(&info)).unwrap_err();
        assert!(err
            .to_string()
            .contains("not allowed when also updating consensus type"));
    }

    #[test]
    fn consensus_type_change_alone_admitted() {
        let info = ConfigUpdateInfo {
            updates_consensus_type: true,
            membership_changes: MembershipChanges::default(),
        };
        ConfigGate::admit(EnvelopeType::Config, Some(&info)).unwrap();
    }
}
