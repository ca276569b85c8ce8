//! # Release Orchestrator
//!
//! Pays the provider's share of a completed milestone and moves it
//! `completed → released`. Each payout attempt is sent under a key derived
//! from the milestone's transfer group, so a retried release after a lost
//! response finds the earlier transfer instead of paying twice. Only a
//! definitive failure moves on to a new attempt and a new key.
//!
//! The fee split is computed once, recorded with the transfer intent, and
//! reused verbatim by every retry.

use std::sync::Arc;

use escrow_core::{
    Clock, DestinationAccountRef, FeeRate, FeeSplit, MilestoneId, Principal, Role, Timestamp,
    TransferGroup, TransferId, UserId,
};
use escrow_gateway::{GatewayError, PaymentGateway, TransferOutcome, TransferRequest};
use escrow_ledger::{
    DestinationDirectory, LeaseOperation, Ledger, LedgerEntry, ReleaseTransfer, TransferStatus,
};
use escrow_state::{Actor, MilestoneStatus, Transition};

use crate::access::require_role;
use crate::config::ReconcilePolicy;
use crate::error::EscrowError;
use crate::funding::CONFIRMING_MESSAGE;
use crate::guard::{Claim, IdempotencyGuard};
use crate::telemetry::{self, RELEASE_TOTAL};

/// Result of [`ReleaseOrchestrator::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Paid out and the milestone is now released.
    Released {
        /// Fee split applied.
        split: FeeSplit,
        /// Gateway transfer, absent when the payee share was zero.
        transfer_id: Option<TransferId>,
        /// When the milestone was released.
        released_at: Timestamp,
    },
    /// Already released; nothing was transferred.
    AlreadyReleased {
        /// Fee split applied at release.
        split: FeeSplit,
        /// The existing transfer.
        transfer_id: Option<TransferId>,
    },
    /// The transfer's result is unknown; the milestone stays completed
    /// until reconciliation resolves it.
    Confirming {
        /// User-facing message.
        message: &'static str,
    },
}

impl ReleaseOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Released { .. } => "released",
            Self::AlreadyReleased { .. } => "already_released",
            Self::Confirming { .. } => "confirming",
        }
    }
}

enum TransferStep {
    Answered(TransferOutcome),
    Failed(String),
    Unknown(GatewayError),
    Unavailable(GatewayError),
}

impl From<Result<TransferOutcome, GatewayError>> for TransferStep {
    fn from(result: Result<TransferOutcome, GatewayError>) -> Self {
        match result {
            Ok(outcome) => Self::Answered(outcome),
            Err(e) if e.is_ambiguous() => Self::Unknown(e),
            Err(GatewayError::Rejected { body, status, .. }) => {
                Self::Failed(format!("gateway rejected transfer ({status}): {body}"))
            }
            Err(e) => Self::Unavailable(e),
        }
    }
}

fn already_released(entry: &LedgerEntry) -> Option<ReleaseOutcome> {
    if entry.milestone.status() != MilestoneStatus::Released {
        return None;
    }
    entry
        .milestone
        .payout()
        .map(|payout| ReleaseOutcome::AlreadyReleased {
            split: payout.split,
            transfer_id: payout.transfer_id.clone(),
        })
}

fn require_completed(entry: &LedgerEntry) -> Result<(), EscrowError> {
    let status = entry.milestone.status();
    if status == MilestoneStatus::Completed {
        Ok(())
    } else {
        Err(EscrowError::InvalidTransition {
            milestone_id: entry.milestone.id(),
            from: status,
            to: MilestoneStatus::Released,
        })
    }
}

/// Drives `completed → released`.
#[derive(Clone)]
pub struct ReleaseOrchestrator {
    ledger: Arc<dyn Ledger>,
    directory: Arc<dyn DestinationDirectory>,
    gateway: Arc<dyn PaymentGateway>,
    guard: IdempotencyGuard,
    clock: Arc<dyn Clock>,
    fee_rate: FeeRate,
    reconcile: ReconcilePolicy,
}

impl std::fmt::Debug for ReleaseOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseOrchestrator")
            .field("gateway", &self.gateway.gateway_name())
            .field("fee_rate", &self.fee_rate)
            .finish_non_exhaustive()
    }
}

impl ReleaseOrchestrator {
    /// Build the orchestrator.
    pub fn new(
        ledger: Arc<dyn Ledger>,
        directory: Arc<dyn DestinationDirectory>,
        gateway: Arc<dyn PaymentGateway>,
        guard: IdempotencyGuard,
        clock: Arc<dyn Clock>,
        fee_rate: FeeRate,
        reconcile: ReconcilePolicy,
    ) -> Self {
        Self {
            ledger,
            directory,
            gateway,
            guard,
            clock,
            fee_rate,
            reconcile,
        }
    }

    /// Pay out a completed milestone.
    ///
    /// # Errors
    ///
    /// - [`EscrowError::Forbidden`] unless the caller is the client.
    /// - [`EscrowError::InvalidTransition`] unless the milestone is
    ///   completed (a disputed milestone is frozen).
    /// - [`EscrowError::TransferFailed`] when the payout fails; the
    ///   milestone stays completed and the call may be retried.
    #[tracing::instrument(skip(self, principal), fields(user = %principal.user()))]
    pub async fn release(
        &self,
        principal: Principal,
        milestone_id: MilestoneId,
    ) -> Result<ReleaseOutcome, EscrowError> {
        let result = self.release_inner(principal, milestone_id).await;
        let label = match &result {
            Ok(outcome) => outcome.label(),
            Err(EscrowError::TransferFailed { .. }) => "transfer_failed",
            Err(EscrowError::ConflictingTransition { .. }) => "conflict",
            Err(_) => "error",
        };
        telemetry::count_outcome(RELEASE_TOTAL, label);
        tracing::info!(%milestone_id, outcome = label, "release finished");
        result
    }

    async fn release_inner(
        &self,
        principal: Principal,
        milestone_id: MilestoneId,
    ) -> Result<ReleaseOutcome, EscrowError> {
        let entry = self.ledger.get(milestone_id).await?;
        require_role(&entry.milestone, &principal, Role::Client, "release")?;
        if let Some(done) = already_released(&entry) {
            return Ok(done);
        }
        require_completed(&entry)?;

        let claim = self
            .guard
            .claim(milestone_id, LeaseOperation::Release)
            .await?;
        let this = self.clone();
        tokio::spawn(async move { this.run(claim, Actor::Party(principal)).await })
            .await
            .map_err(|e| EscrowError::Internal(format!("release task for {milestone_id} failed: {e}")))?
    }

    async fn run(&self, claim: Claim, actor: Actor) -> Result<ReleaseOutcome, EscrowError> {
        if let Some(done) = already_released(&claim.entry) {
            self.guard.abandon(&claim).await;
            return Ok(done);
        }
        if let Err(e) = require_completed(&claim.entry) {
            self.guard.abandon(&claim).await;
            return Err(e);
        }

        let transfer = match &claim.entry.release_transfer {
            Some(prior) => match &prior.status {
                TransferStatus::Succeeded { transfer_id } => {
                    // Paid before, only the transition is missing.
                    let id = transfer_id.clone();
                    let prior = prior.clone();
                    return self
                        .settle(&claim, actor, prior.split, Some(prior.destination), Some(id))
                        .await;
                }
                TransferStatus::Unresolved => {
                    let prior = prior.clone();
                    match self.gateway.query_transfer(&prior.gateway_key()).await {
                        Ok(Some(TransferOutcome::Succeeded { transfer_id })) => {
                            return self
                                .settle(
                                    &claim,
                                    actor,
                                    prior.split,
                                    Some(prior.destination),
                                    Some(transfer_id),
                                )
                                .await;
                        }
                        _ => prior,
                    }
                }
                TransferStatus::Failed { .. } => ReleaseTransfer {
                    attempt: prior.attempt + 1,
                    ..prior.clone()
                },
            },
            None => {
                let milestone = &claim.entry.milestone;
                let split = FeeSplit::compute(milestone.amount().amount(), self.fee_rate);
                if split.payee_amount == 0 {
                    tracing::info!(
                        milestone_id = %claim.milestone_id,
                        platform_fee = split.platform_fee,
                        "payee share is zero, releasing without a transfer"
                    );
                    return self.settle(&claim, actor, split, None, None).await;
                }
                let destination = match self.resolve_destination(milestone.provider()).await {
                    Ok(d) => d,
                    Err(e) => {
                        self.guard.abandon(&claim).await;
                        return Err(e);
                    }
                };
                ReleaseTransfer {
                    split,
                    destination,
                    transfer_group: TransferGroup::for_milestone(&claim.milestone_id),
                    attempt: 0,
                    status: TransferStatus::Unresolved,
                    updated_at: self.clock.now(),
                }
            }
        };

        self.transfer(claim, actor, transfer).await
    }

    /// The provider's destination account, provisioned on first use.
    async fn resolve_destination(
        &self,
        provider: UserId,
    ) -> Result<DestinationAccountRef, EscrowError> {
        if let Some(existing) = self.directory.get(provider).await? {
            return Ok(existing);
        }
        let provisioned = self
            .gateway
            .ensure_destination_account(provider)
            .await
            .map_err(|e| EscrowError::GatewayUnavailable {
                reason: e.to_string(),
            })?;
        let stored = self.directory.put_if_absent(provider, provisioned).await?;
        tracing::info!(%provider, destination = %stored, "provider destination account on file");
        Ok(stored)
    }

    async fn transfer(
        &self,
        claim: Claim,
        actor: Actor,
        transfer: ReleaseTransfer,
    ) -> Result<ReleaseOutcome, EscrowError> {
        let transfer = ReleaseTransfer {
            status: TransferStatus::Unresolved,
            updated_at: self.clock.now(),
            ..transfer
        };
        if let Err(e) = self.guard.record_transfer(&claim, transfer.clone()).await {
            self.guard.abandon(&claim).await;
            return Err(e);
        }

        let milestone = &claim.entry.milestone;
        let Some(source_charge) = milestone.external_payment_id().cloned() else {
            self.guard.abandon(&claim).await;
            return Err(EscrowError::Internal(format!(
                "{} is completed without a captured charge",
                claim.milestone_id
            )));
        };
        let request = TransferRequest {
            source_charge,
            destination: transfer.destination.clone(),
            amount: transfer.split.payee_amount,
            currency: milestone.amount().currency().clone(),
            transfer_group: transfer.transfer_group.clone(),
            idempotency_key: transfer.gateway_key(),
        };

        let mut step = TransferStep::from(self.gateway.transfer(&request).await);
        let mut queries = 0;
        loop {
            match step {
                TransferStep::Answered(TransferOutcome::Succeeded { transfer_id }) => {
                    return self
                        .settle(
                            &claim,
                            actor,
                            transfer.split,
                            Some(transfer.destination),
                            Some(transfer_id),
                        )
                        .await;
                }
                TransferStep::Answered(TransferOutcome::Failed { reason })
                | TransferStep::Failed(reason) => {
                    return self.fail(&claim, transfer, reason).await;
                }
                TransferStep::Unavailable(e) => {
                    self.guard.abandon(&claim).await;
                    return Err(EscrowError::GatewayUnavailable {
                        reason: e.to_string(),
                    });
                }
                TransferStep::Unknown(e) => {
                    if queries >= self.reconcile.attempts {
                        break;
                    }
                    tracing::warn!(
                        milestone_id = %claim.milestone_id,
                        gateway_key = %request.idempotency_key,
                        error = %e,
                        query = queries + 1,
                        "transfer outcome unknown, querying gateway"
                    );
                    tokio::time::sleep(self.reconcile.delay(queries)).await;
                    queries += 1;
                    step = match self.gateway.query_transfer(&request.idempotency_key).await {
                        Ok(Some(outcome)) => TransferStep::Answered(outcome),
                        Ok(None) => TransferStep::from(self.gateway.transfer(&request).await),
                        Err(e) => TransferStep::Unknown(e),
                    };
                }
            }
        }

        tracing::warn!(
            milestone_id = %claim.milestone_id,
            gateway_key = %request.idempotency_key,
            "transfer outcome still unknown, left for reconciliation"
        );
        self.guard.abandon(&claim).await;
        Ok(ReleaseOutcome::Confirming {
            message: CONFIRMING_MESSAGE,
        })
    }

    async fn fail(
        &self,
        claim: &Claim,
        transfer: ReleaseTransfer,
        reason: String,
    ) -> Result<ReleaseOutcome, EscrowError> {
        tracing::warn!(
            milestone_id = %claim.milestone_id,
            attempt = transfer.attempt,
            reason = %reason,
            "payout transfer failed, funds remain captured"
        );
        let transfer = ReleaseTransfer {
            status: TransferStatus::Failed {
                reason: reason.clone(),
            },
            updated_at: self.clock.now(),
            ..transfer
        };
        let recorded = self.guard.record_transfer(claim, transfer).await;
        self.guard.abandon(claim).await;
        recorded?;
        Err(EscrowError::TransferFailed {
            milestone_id: claim.milestone_id,
            reason,
        })
    }

    async fn settle(
        &self,
        claim: &Claim,
        actor: Actor,
        split: FeeSplit,
        destination: Option<DestinationAccountRef>,
        transfer_id: Option<TransferId>,
    ) -> Result<ReleaseOutcome, EscrowError> {
        let done = self
            .guard
            .commit(
                claim,
                MilestoneStatus::Completed,
                Transition::Release {
                    split,
                    destination,
                    transfer_id: transfer_id.clone(),
                },
                actor,
            )
            .await
            .map_err(|e| {
                tracing::error!(
                    milestone_id = %claim.milestone_id,
                    error = %e,
                    "payout settled but release transition failed"
                );
                e
            })?;
        Ok(ReleaseOutcome::Released {
            split,
            transfer_id,
            released_at: done
                .entry
                .milestone
                .released_at()
                .unwrap_or_else(|| self.clock.now()),
        })
    }
}
