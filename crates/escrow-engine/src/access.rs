//! Caller checks shared by the orchestrators.
//!
//! The caller's role is never taken on trust: it is re-derived from the
//! milestone's parties and must agree with the session's role. The ledger
//! repeats the same check when it applies the transition.

use escrow_core::{Principal, Role};
use escrow_state::Milestone;

use crate::error::EscrowError;

/// The caller's side of the milestone, if the session agrees with it.
pub(crate) fn party_role(milestone: &Milestone, principal: &Principal) -> Result<Role, EscrowError> {
    match milestone.role_of(principal.user()) {
        Some(role) if role == principal.role() => Ok(role),
        Some(role) => Err(EscrowError::Forbidden {
            reason: format!(
                "{} acts as {} but is the {} of {}",
                principal.user(),
                principal.role().as_str(),
                role.as_str(),
                milestone.id()
            ),
        }),
        None => Err(EscrowError::Forbidden {
            reason: format!("{} is not a party to {}", principal.user(), milestone.id()),
        }),
    }
}

/// Require the caller to be the milestone's `required` party.
pub(crate) fn require_role(
    milestone: &Milestone,
    principal: &Principal,
    required: Role,
    action: &'static str,
) -> Result<(), EscrowError> {
    let role = party_role(milestone, principal)?;
    if role != required {
        return Err(EscrowError::Forbidden {
            reason: format!("only the {} may {action} {}", required.as_str(), milestone.id()),
        });
    }
    Ok(())
}
