//! Bundle validator (C7): section presence, MSP identity immutability, and
//! the consensus-type migration FSM.

use crate::error::{OrdererError, Result};
use crate::types::{ConfigBundle, OrgConfig};

use super::migration;

/// Phase 1 — pre-validation. Rejects a missing bundle outright (the
/// channel group is always present once a bundle exists, since
/// `ConfigBundle::channel` is not optional in this crate's data model).
pub fn prevalidate(new: Option<&ConfigBundle>) -> Result<()> {
    let bundle = new.ok_or_else(|| OrdererError::Prevalidation("nil config".into()))?;

    if !bundle.channel.capabilities.is_empty() && bundle.orderer.is_none() {
        return Err(OrdererError::Prevalidation(
            "cannot enable channel capabilities without orderer support first".into(),
        ));
    }

    if let Some(application) = &bundle.application {
        if !application.capabilities.is_empty() && bundle.orderer.is_none() {
            return Err(OrdererError::Prevalidation(
                "cannot enable application capabilities without orderer support first".into(),
            ));
        }
    }

    Ok(())
}

/// Phase 2 — diff validation against the current bundle.
pub fn validate_new(
    current: &ConfigBundle,
    new: &ConfigBundle,
    is_system_channel: bool,
) -> Result<()> {
    if current.orderer.is_some() && new.orderer.is_none() {
        return Err(OrdererError::Validation(
            "Current config has orderer section, but new config does not".into(),
        ));
    }
    if current.application.is_some() && new.application.is_none() {
        return Err(OrdererError::Validation(
            "Current config has application section, but new config does not".into(),
        ));
    }
    if current.consortiums.is_some() && new.consortiums.is_none() {
        return Err(OrdererError::Validation(
            "Current config has consortiums section, but new config does not".into(),
        ));
    }

    if let (Some(cur_orderer), Some(new_orderer)) = (&current.orderer, &new.orderer) {
        check_msp_immutability("Orderer", &cur_orderer.orgs, &new_orderer.orgs)?;
    }
    if let (Some(cur_app), Some(new_app)) = (&current.application, &new.application) {
        check_msp_immutability("Application", &cur_app.orgs, &new_app.orgs)?;
    }
    if let (Some(cur_consortiums), Some(new_consortiums)) =
        (&current.consortiums, &new.consortiums)
    {
        for (name, cur_consortium) in &cur_consortiums.consortiums {
            if let Some(new_consortium) = new_consortiums.consortiums.get(name) {
                check_msp_immutability(
                    &format!("Consortium {name}"),
                    &cur_consortium.orgs,
                    &new_consortium.orgs,
                )?;
            }
        }
    }

    if let (Some(cur_orderer), Some(new_orderer)) = (&current.orderer, &new.orderer) {
        migration::validate_transition(
            &cur_orderer.consensus_type,
            &new_orderer.consensus_type,
            is_system_channel,
        )?;
    }

    Ok(())
}

fn check_msp_immutability(
    section_label: &str,
    current_orgs: &std::collections::BTreeMap<String, OrgConfig>,
    new_orgs: &std::collections::BTreeMap<String, OrgConfig>,
) -> Result<()> {
    for (name, current_org) in current_orgs {
        if let Some(new_org) = new_orgs.get(name) {
            if current_org.msp_id != new_org.msp_id {
                return Err(OrdererError::Validation(format!(
                    "{section_label} org {name} attempted to change MSP ID from {} to {}",
                    current_org.msp_id, new_org.msp_id
                )));
            }
        }
    }
    Ok(())
}
