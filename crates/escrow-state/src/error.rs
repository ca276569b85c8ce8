//! # Transition Errors
//!
//! Rejections raised while applying a transition to a milestone. Every
//! variant names the milestone and enough state for an operator to see why
//! the transition was refused.

use escrow_core::{MilestoneId, Timestamp, ValidationError};
use thiserror::Error;

use crate::status::MilestoneStatus;

/// Reasons a milestone transition was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    /// The event is not legal from the milestone's current status.
    #[error("invalid transition for {milestone_id} from {from} to {to}")]
    InvalidTransition {
        /// The milestone.
        milestone_id: MilestoneId,
        /// Current status.
        from: MilestoneStatus,
        /// Attempted target status.
        to: MilestoneStatus,
    },

    /// The actor is not allowed to drive this transition.
    #[error("{actor} may not {action} {milestone_id}: {reason}")]
    Forbidden {
        /// The milestone.
        milestone_id: MilestoneId,
        /// Who attempted it.
        actor: String,
        /// The attempted action (e.g. "release").
        action: &'static str,
        /// Why it was refused.
        reason: &'static str,
    },

    /// The dispute window has closed.
    #[error("dispute window for {milestone_id} closed at {deadline} (measured from {anchor})")]
    DisputeWindowExpired {
        /// The milestone.
        milestone_id: MilestoneId,
        /// Completion or release time the window is measured from.
        anchor: Timestamp,
        /// Last instant a dispute was accepted.
        deadline: Timestamp,
    },

    /// Malformed input carried by the transition.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}
