//! # Idempotency Guard
//!
//! Before an orchestrator calls the gateway it claims the milestone with a
//! lease on the ledger row. While the lease is live no other operation can
//! claim the row or transition it, so at most one worker is ever "the one"
//! making a gateway call for a milestone. The gateway-call bookkeeping
//! (funding attempts, release transfers) is written under the same lease,
//! and the lease is cleared by the transition that settles it.
//!
//! A worker that dies mid-flight leaves its lease to expire after
//! `lease_ttl`; the next claimant finds the unresolved attempt and
//! reconciles it with the gateway before acting.

use std::sync::Arc;

use escrow_core::{Clock, MilestoneId};
use escrow_ledger::{
    FundingAttempt, Ledger, LedgerEntry, LeaseOperation, LeaseToken, ReleaseTransfer,
    TransitionRequest, Transitioned,
};
use escrow_state::{Actor, DisputeWindow, MilestoneStatus, Transition};

use crate::error::EscrowError;

/// A claimed milestone.
#[derive(Debug, Clone)]
pub struct Claim {
    /// The claimed milestone.
    pub milestone_id: MilestoneId,
    /// What the claim is for.
    pub operation: LeaseOperation,
    /// Lease ownership token.
    pub token: LeaseToken,
    /// Row snapshot taken after the lease was acquired.
    pub entry: LedgerEntry,
}

/// Lease-based exclusion over ledger rows.
#[derive(Clone)]
pub struct IdempotencyGuard {
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    lease_ttl: chrono::Duration,
    dispute_window: DisputeWindow,
}

impl std::fmt::Debug for IdempotencyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyGuard")
            .field("lease_ttl", &self.lease_ttl)
            .finish_non_exhaustive()
    }
}

impl IdempotencyGuard {
    /// Build a guard over `ledger`.
    pub fn new(
        ledger: Arc<dyn Ledger>,
        clock: Arc<dyn Clock>,
        lease_ttl: chrono::Duration,
        dispute_window: DisputeWindow,
    ) -> Self {
        Self {
            ledger,
            clock,
            lease_ttl,
            dispute_window,
        }
    }

    /// Claim `milestone_id` for `operation`.
    ///
    /// Fails with [`EscrowError::ConflictingTransition`] while another
    /// operation's lease is live.
    pub async fn claim(
        &self,
        milestone_id: MilestoneId,
        operation: LeaseOperation,
    ) -> Result<Claim, EscrowError> {
        let lease = self
            .ledger
            .acquire_lease(milestone_id, operation, self.clock.now(), self.lease_ttl)
            .await?;
        let entry = match self.ledger.get(milestone_id).await {
            Ok(entry) => entry,
            Err(e) => {
                self.ledger.release_lease(milestone_id, lease.token).await.ok();
                return Err(e.into());
            }
        };
        tracing::debug!(%milestone_id, %operation, "claimed milestone");
        Ok(Claim {
            milestone_id,
            operation,
            token: lease.token,
            entry,
        })
    }

    /// Record a funding attempt under the claim.
    pub async fn record_funding(
        &self,
        claim: &Claim,
        attempt: FundingAttempt,
    ) -> Result<(), EscrowError> {
        self.ledger
            .record_funding_attempt(claim.milestone_id, claim.token, attempt)
            .await
            .map_err(Into::into)
    }

    /// Record the release transfer under the claim.
    pub async fn record_transfer(
        &self,
        claim: &Claim,
        transfer: ReleaseTransfer,
    ) -> Result<(), EscrowError> {
        self.ledger
            .record_release_transfer(claim.milestone_id, claim.token, transfer)
            .await
            .map_err(Into::into)
    }

    /// Apply `transition` under the claim. The lease is cleared on success.
    pub async fn commit(
        &self,
        claim: &Claim,
        expected: MilestoneStatus,
        transition: Transition,
        actor: Actor,
    ) -> Result<Transitioned, EscrowError> {
        let request = TransitionRequest {
            milestone_id: claim.milestone_id,
            expected,
            transition,
            actor,
            lease: Some(claim.token),
            at: self.clock.now(),
            dispute_window: self.dispute_window,
        };
        match self.ledger.transition(request).await {
            Ok(done) => Ok(done),
            Err(e) => {
                self.abandon(claim).await;
                Err(e.into())
            }
        }
    }

    /// Give the claim up without a transition.
    pub async fn abandon(&self, claim: &Claim) {
        if let Err(e) = self
            .ledger
            .release_lease(claim.milestone_id, claim.token)
            .await
        {
            tracing::warn!(
                milestone_id = %claim.milestone_id,
                operation = %claim.operation,
                error = %e,
                "failed to release lease, it will expire"
            );
        }
    }
}
