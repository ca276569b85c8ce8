//! # Dispute Adjudicator
//!
//! Either party may freeze a completed or released milestone while the
//! dispute window is open. The filer's side is derived from the milestone,
//! never from the request.
//!
//! Filing takes no lease. It is a single guarded ledger write, so a dispute
//! racing a release either lands first (and the release then fails its
//! transition) or is refused with a conflict while the release holds its
//! lease. The ledger also refuses it while a sent payout is still
//! unconfirmed, until reconciliation learns whether the money moved.

use std::sync::Arc;

use escrow_core::{Clock, MilestoneId, Principal};
use escrow_ledger::{Ledger, TransitionRequest};
use escrow_state::{Actor, Dispute, DisputeWindow, Transition};

use crate::access::party_role;
use crate::error::EscrowError;
use crate::telemetry::{self, DISPUTE_TOTAL};

/// Files disputes against milestones.
#[derive(Clone)]
pub struct DisputeAdjudicator {
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    window: DisputeWindow,
}

impl std::fmt::Debug for DisputeAdjudicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisputeAdjudicator")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl DisputeAdjudicator {
    /// Build the adjudicator.
    pub fn new(ledger: Arc<dyn Ledger>, clock: Arc<dyn Clock>, window: DisputeWindow) -> Self {
        Self {
            ledger,
            clock,
            window,
        }
    }

    /// File a dispute.
    ///
    /// # Errors
    ///
    /// - [`EscrowError::Forbidden`] if the caller is not a party.
    /// - [`EscrowError::Validation`] for a blank reason.
    /// - [`EscrowError::InvalidTransition`] unless the milestone is
    ///   completed or released.
    /// - [`EscrowError::DisputeWindowExpired`] after the window closed.
    /// - [`EscrowError::ConflictingTransition`] while a release is in
    ///   flight or awaiting confirmation, or if the milestone moved
    ///   concurrently.
    #[tracing::instrument(skip(self, principal, description), fields(user = %principal.user()))]
    pub async fn dispute(
        &self,
        principal: Principal,
        milestone_id: MilestoneId,
        reason: &str,
        description: &str,
    ) -> Result<Dispute, EscrowError> {
        let result = self
            .file(principal, milestone_id, reason, description)
            .await;
        let label = match &result {
            Ok(_) => "filed",
            Err(EscrowError::DisputeWindowExpired { .. }) => "window_expired",
            Err(EscrowError::ConflictingTransition { .. }) => "conflict",
            Err(EscrowError::InvalidTransition { .. }) => "invalid",
            Err(_) => "error",
        };
        telemetry::count_outcome(DISPUTE_TOTAL, label);
        result
    }

    async fn file(
        &self,
        principal: Principal,
        milestone_id: MilestoneId,
        reason: &str,
        description: &str,
    ) -> Result<Dispute, EscrowError> {
        let entry = self.ledger.get(milestone_id).await?;
        let filed_by = party_role(&entry.milestone, &principal)?;
        let now = self.clock.now();
        let dispute = Dispute::file(
            milestone_id,
            filed_by,
            principal.user(),
            reason,
            description,
            now,
        )?;

        let done = self
            .ledger
            .transition(TransitionRequest {
                milestone_id,
                expected: entry.milestone.status(),
                transition: Transition::Dispute { dispute },
                actor: Actor::Party(principal),
                lease: None,
                at: now,
                dispute_window: self.window,
            })
            .await?;

        let filed = done.entry.dispute.ok_or_else(|| {
            EscrowError::Internal(format!("{milestone_id} disputed without a dispute record"))
        })?;
        tracing::info!(
            %milestone_id,
            dispute_id = %filed.id,
            filed_by = %filed.filed_by,
            "dispute filed, milestone frozen"
        );
        Ok(filed)
    }
}
