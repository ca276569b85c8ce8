//! # Ledger Errors

use escrow_core::{IdempotencyKey, MilestoneId, Timestamp};
use escrow_state::{MilestoneStatus, TransitionError};
use thiserror::Error;

use crate::record::LeaseOperation;

/// Errors returned by [`Ledger`](crate::Ledger) implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// No milestone with this id.
    #[error("milestone {milestone_id} not found")]
    NotFound {
        /// The missing milestone.
        milestone_id: MilestoneId,
    },

    /// A milestone with this id already exists.
    #[error("milestone {milestone_id} already exists")]
    AlreadyExists {
        /// The duplicate milestone.
        milestone_id: MilestoneId,
    },

    /// Another milestone already uses this idempotency key.
    #[error("idempotency key {key} is already bound to a milestone")]
    DuplicateIdempotencyKey {
        /// The duplicate key.
        key: IdempotencyKey,
    },

    /// Another operation holds a live lease on the milestone.
    #[error("milestone {milestone_id} is busy with {operation} until {expires_at}")]
    LeaseHeld {
        /// The milestone.
        milestone_id: MilestoneId,
        /// Operation holding the lease.
        operation: LeaseOperation,
        /// When the lease lapses.
        expires_at: Timestamp,
    },

    /// The caller's lease was superseded by another operation.
    #[error("lease on milestone {milestone_id} is no longer held by this operation")]
    LeaseLost {
        /// The milestone.
        milestone_id: MilestoneId,
    },

    /// The milestone moved on between the caller's read and its write.
    #[error("milestone {milestone_id} expected {expected}, found {actual}")]
    ConflictingTransition {
        /// The milestone.
        milestone_id: MilestoneId,
        /// Status the caller read.
        expected: MilestoneStatus,
        /// Status found at write time.
        actual: MilestoneStatus,
    },

    /// A payout transfer was sent and its outcome is not yet known.
    #[error("milestone {milestone_id} has a payout awaiting confirmation from the gateway")]
    PayoutUnresolved {
        /// The milestone.
        milestone_id: MilestoneId,
    },

    /// The state machine rejected the transition.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Backend failure.
    #[error("ledger storage error: {0}")]
    Storage(String),
}
