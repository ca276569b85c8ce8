//! # Engine Errors
//!
//! [`EscrowError`] is the only error type that crosses the service
//! boundary. Ledger and state-machine errors are folded into it here;
//! gateway errors are classified by the orchestrators and never converted
//! wholesale, so a raw transport failure cannot leak upward.

use thiserror::Error;

use escrow_core::{MilestoneId, Timestamp, ValidationError};
use escrow_ledger::LedgerError;
use escrow_state::{MilestoneStatus, TransitionError};

/// Errors returned by [`EscrowService`](crate::EscrowService).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EscrowError {
    /// No milestone with this id, or the caller may not see it.
    #[error("milestone {milestone_id} not found")]
    NotFound {
        /// The requested milestone.
        milestone_id: MilestoneId,
    },

    /// The caller is not allowed to perform the action.
    #[error("forbidden: {reason}")]
    Forbidden {
        /// Why the caller was refused.
        reason: String,
    },

    /// The event is not legal from the milestone's current state.
    #[error("cannot move milestone {milestone_id} from {from} to {to}")]
    InvalidTransition {
        /// The milestone.
        milestone_id: MilestoneId,
        /// Current status.
        from: MilestoneStatus,
        /// Requested status.
        to: MilestoneStatus,
    },

    /// A concurrent operation on the same milestone won the race or is
    /// still in flight. Re-read the milestone before retrying.
    #[error("conflicting operation on milestone {milestone_id}: {detail}")]
    ConflictingTransition {
        /// The milestone.
        milestone_id: MilestoneId,
        /// What the caller collided with.
        detail: String,
    },

    /// The gateway declined the charge.
    #[error("payment for milestone {milestone_id} failed: {reason}")]
    PaymentFailed {
        /// The milestone.
        milestone_id: MilestoneId,
        /// Gateway's reason.
        reason: String,
    },

    /// The payout transfer failed. Funds remain captured.
    #[error("transfer for milestone {milestone_id} failed: {reason}")]
    TransferFailed {
        /// The milestone.
        milestone_id: MilestoneId,
        /// Gateway's reason.
        reason: String,
    },

    /// The dispute window has closed.
    #[error("dispute window for milestone {milestone_id} closed at {deadline}")]
    DisputeWindowExpired {
        /// The milestone.
        milestone_id: MilestoneId,
        /// Last instant a dispute was accepted.
        deadline: Timestamp,
    },

    /// The caller exceeded its request allowance.
    #[error("rate limit exceeded for {operation}, retry in {retry_after_secs}s")]
    RateLimited {
        /// Throttled operation.
        operation: &'static str,
        /// Seconds until the window resets.
        retry_after_secs: u64,
    },

    /// Input failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The gateway could not be used and nothing was executed.
    #[error("payment gateway unavailable: {reason}")]
    GatewayUnavailable {
        /// Underlying failure.
        reason: String,
    },

    /// Ledger backend failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// A detached orchestration task did not complete.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EscrowError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::ConflictingTransition { .. } => "CONFLICTING_TRANSITION",
            Self::PaymentFailed { .. } => "PAYMENT_FAILED",
            Self::TransferFailed { .. } => "TRANSFER_FAILED",
            Self::DisputeWindowExpired { .. } => "DISPUTE_WINDOW_EXPIRED",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::GatewayUnavailable { .. } => "GATEWAY_UNAVAILABLE",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    ///
    /// A declined payment is not retryable as-is: the client must choose
    /// another instrument.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConflictingTransition { .. }
                | Self::TransferFailed { .. }
                | Self::RateLimited { .. }
                | Self::GatewayUnavailable { .. }
                | Self::Storage(_)
                | Self::Internal(_)
        )
    }
}

impl From<TransitionError> for EscrowError {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::InvalidTransition {
                milestone_id,
                from,
                to,
            } => Self::InvalidTransition {
                milestone_id,
                from,
                to,
            },
            TransitionError::Forbidden { .. } => Self::Forbidden {
                reason: e.to_string(),
            },
            TransitionError::DisputeWindowExpired {
                milestone_id,
                deadline,
                ..
            } => Self::DisputeWindowExpired {
                milestone_id,
                deadline,
            },
            TransitionError::Validation(v) => Self::Validation(v),
        }
    }
}

impl From<LedgerError> for EscrowError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound { milestone_id } => Self::NotFound { milestone_id },
            LedgerError::LeaseHeld { milestone_id, .. }
            | LedgerError::LeaseLost { milestone_id }
            | LedgerError::PayoutUnresolved { milestone_id }
            | LedgerError::ConflictingTransition { milestone_id, .. } => {
                Self::ConflictingTransition {
                    milestone_id,
                    detail: e.to_string(),
                }
            }
            LedgerError::Transition(t) => t.into(),
            LedgerError::AlreadyExists { .. }
            | LedgerError::DuplicateIdempotencyKey { .. }
            | LedgerError::Storage(_) => Self::Storage(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_contention_is_a_conflict() {
        let id = MilestoneId::new();
        let err: EscrowError = LedgerError::LeaseHeld {
            milestone_id: id,
            operation: escrow_ledger::LeaseOperation::Fund,
            expires_at: Timestamp::parse("2026-01-01T00:02:00Z").unwrap(),
        }
        .into();
        assert_eq!(err.code(), "CONFLICTING_TRANSITION");
        assert!(err.is_retryable());
    }

    #[test]
    fn unresolved_payout_is_a_retryable_conflict() {
        let id = MilestoneId::new();
        let err: EscrowError = LedgerError::PayoutUnresolved { milestone_id: id }.into();
        assert_eq!(err.code(), "CONFLICTING_TRANSITION");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("awaiting confirmation"));
    }

    #[test]
    fn state_machine_errors_keep_their_taxonomy() {
        let id = MilestoneId::new();
        let err: EscrowError = LedgerError::Transition(TransitionError::InvalidTransition {
            milestone_id: id,
            from: MilestoneStatus::Pending,
            to: MilestoneStatus::Released,
        })
        .into();
        assert_eq!(
            err,
            EscrowError::InvalidTransition {
                milestone_id: id,
                from: MilestoneStatus::Pending,
                to: MilestoneStatus::Released,
            }
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn window_expiry_is_final() {
        let deadline = Timestamp::parse("2026-02-01T00:00:00Z").unwrap();
        let err: EscrowError = TransitionError::DisputeWindowExpired {
            milestone_id: MilestoneId::new(),
            anchor: Timestamp::parse("2026-01-02T00:00:00Z").unwrap(),
            deadline,
        }
        .into();
        assert_eq!(err.code(), "DISPUTE_WINDOW_EXPIRED");
        assert!(!err.is_retryable());
    }

    #[test]
    fn payment_failure_needs_a_new_instrument() {
        let err = EscrowError::PaymentFailed {
            milestone_id: MilestoneId::new(),
            reason: "card_declined".into(),
        };
        assert_eq!(err.code(), "PAYMENT_FAILED");
        assert!(!err.is_retryable());
        assert!(EscrowError::TransferFailed {
            milestone_id: MilestoneId::new(),
            reason: "account_closed".into(),
        }
        .is_retryable());
    }
}
