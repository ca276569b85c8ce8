//! # Milestone Events
//!
//! Every successful transition yields exactly one [`MilestoneEvent`]. The
//! ledger appends it to its outbox atomically with the state change, and
//! the engine relays it to audit and notification sinks afterwards.

use serde::{Deserialize, Serialize};

use escrow_core::{
    CaseId, DisputeId, ExternalPaymentId, MilestoneId, Money, Role, Timestamp, TransferId, UserId,
};

/// What happened to the milestone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MilestoneEventKind {
    /// Client funds were captured.
    Funded {
        /// Gateway charge reference.
        external_payment_id: ExternalPaymentId,
        /// Captured amount.
        amount: Money,
    },
    /// Provider marked the work done.
    Completed,
    /// Funds were paid out.
    Released {
        /// Paid to the provider, minor units.
        payee_amount: u64,
        /// Retained by the platform, minor units.
        platform_fee: u64,
        /// Gateway transfer reference, absent when nothing was paid out.
        transfer_id: Option<TransferId>,
    },
    /// A party filed a dispute.
    Disputed {
        /// The dispute record.
        dispute_id: DisputeId,
        /// Side that filed.
        filed_by: Role,
        /// The stated reason.
        reason: String,
    },
}

/// A domain event emitted by one transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneEvent {
    /// The milestone concerned.
    pub milestone_id: MilestoneId,
    /// Case the milestone belongs to.
    pub case_id: CaseId,
    /// Effective time of the transition.
    pub occurred_at: Timestamp,
    /// Users to notify.
    pub recipients: Vec<UserId>,
    /// Event payload.
    pub kind: MilestoneEventKind,
}

impl MilestoneEvent {
    /// Stable event name used by audit and notification sinks.
    pub fn name(&self) -> &'static str {
        match self.kind {
            MilestoneEventKind::Funded { .. } => "MilestoneFunded",
            MilestoneEventKind::Completed => "MilestoneCompleted",
            MilestoneEventKind::Released { .. } => "MilestoneReleased",
            MilestoneEventKind::Disputed { .. } => "MilestoneDisputed",
        }
    }
}
