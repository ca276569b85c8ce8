//! # Funding Orchestrator
//!
//! Captures the milestone amount from the client and moves the milestone
//! `pending → funded`. The ledger is only written after the gateway has
//! answered, and an ambiguous gateway failure is never read as success or
//! failure: the outcome is queried under the same idempotency key first.
//!
//! ## Gateway keys
//!
//! The milestone's idempotency key is sent verbatim for the first charge
//! and for every challenge or ambiguity retry. Only after a definitive
//! decline does the next `fund` move on to `<key>-r<n>`, so the client can
//! try another instrument without colliding with the declined request.

use std::sync::Arc;

use escrow_core::{
    Clock, ExternalPaymentId, MilestoneId, PaymentInstrumentRef, Principal, Role, Timestamp,
};
use escrow_gateway::{ChallengePayload, ChargeOutcome, ChargeRequest, GatewayError, PaymentGateway};
use escrow_ledger::{FundingAttempt, FundingStatus, Ledger, LedgerEntry, LeaseOperation};
use escrow_state::{Actor, MilestoneStatus, Transition};

use crate::access::require_role;
use crate::config::ReconcilePolicy;
use crate::error::EscrowError;
use crate::guard::{Claim, IdempotencyGuard};
use crate::telemetry::{self, FUNDING_TOTAL};

/// Message shown while an ambiguous payment is being confirmed.
pub const CONFIRMING_MESSAGE: &str = "We're confirming your payment, check back shortly.";

/// Result of [`FundingOrchestrator::fund`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FundingOutcome {
    /// Funds captured and the milestone is now funded.
    Funded {
        /// Gateway charge reference.
        external_payment_id: ExternalPaymentId,
        /// When the milestone was funded.
        funded_at: Timestamp,
    },
    /// The milestone was already funded; nothing was charged.
    AlreadyFunded {
        /// The existing charge reference.
        external_payment_id: ExternalPaymentId,
    },
    /// The client must complete strong authentication and call `fund`
    /// again.
    RequiresChallenge {
        /// Challenge to pass to the client unmodified.
        challenge: ChallengePayload,
    },
    /// The gateway's answer is unknown. The milestone stays pending until
    /// reconciliation resolves it.
    Confirming {
        /// User-facing message.
        message: &'static str,
    },
}

impl FundingOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Funded { .. } => "funded",
            Self::AlreadyFunded { .. } => "already_funded",
            Self::RequiresChallenge { .. } => "requires_challenge",
            Self::Confirming { .. } => "confirming",
        }
    }
}

/// Where a charge call left us.
enum ChargeStep {
    Answered(ChargeOutcome),
    Declined(String),
    Unknown(GatewayError),
    Unavailable(GatewayError),
}

impl From<Result<ChargeOutcome, GatewayError>> for ChargeStep {
    fn from(result: Result<ChargeOutcome, GatewayError>) -> Self {
        match result {
            Ok(outcome) => Self::Answered(outcome),
            Err(e) if e.is_ambiguous() => Self::Unknown(e),
            Err(GatewayError::Rejected { body, status, .. }) => {
                Self::Declined(format!("gateway rejected charge ({status}): {body}"))
            }
            Err(e) => Self::Unavailable(e),
        }
    }
}

fn already_funded(entry: &LedgerEntry) -> Option<FundingOutcome> {
    if entry.milestone.status() == MilestoneStatus::Pending {
        return None;
    }
    entry
        .milestone
        .external_payment_id()
        .map(|id| FundingOutcome::AlreadyFunded {
            external_payment_id: id.clone(),
        })
}

/// Drives `pending → funded`.
#[derive(Clone)]
pub struct FundingOrchestrator {
    ledger: Arc<dyn Ledger>,
    gateway: Arc<dyn PaymentGateway>,
    guard: IdempotencyGuard,
    clock: Arc<dyn Clock>,
    reconcile: ReconcilePolicy,
}

impl std::fmt::Debug for FundingOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FundingOrchestrator")
            .field("gateway", &self.gateway.gateway_name())
            .field("reconcile", &self.reconcile)
            .finish_non_exhaustive()
    }
}

impl FundingOrchestrator {
    /// Build the orchestrator.
    pub fn new(
        ledger: Arc<dyn Ledger>,
        gateway: Arc<dyn PaymentGateway>,
        guard: IdempotencyGuard,
        clock: Arc<dyn Clock>,
        reconcile: ReconcilePolicy,
    ) -> Self {
        Self {
            ledger,
            gateway,
            guard,
            clock,
            reconcile,
        }
    }

    /// Fund a pending milestone from `instrument`.
    ///
    /// Once the milestone is claimed the work runs on a detached task, so
    /// dropping the returned future does not cancel a submitted charge.
    ///
    /// # Errors
    ///
    /// - [`EscrowError::Forbidden`] unless the caller is the client.
    /// - [`EscrowError::ConflictingTransition`] while another operation
    ///   holds the milestone.
    /// - [`EscrowError::PaymentFailed`] when the gateway declines.
    #[tracing::instrument(skip(self, principal, instrument), fields(user = %principal.user()))]
    pub async fn fund(
        &self,
        principal: Principal,
        milestone_id: MilestoneId,
        instrument: PaymentInstrumentRef,
    ) -> Result<FundingOutcome, EscrowError> {
        let result = self.fund_inner(principal, milestone_id, instrument).await;
        let label = match &result {
            Ok(outcome) => outcome.label(),
            Err(EscrowError::PaymentFailed { .. }) => "declined",
            Err(EscrowError::ConflictingTransition { .. }) => "conflict",
            Err(_) => "error",
        };
        telemetry::count_outcome(FUNDING_TOTAL, label);
        tracing::info!(%milestone_id, outcome = label, "fund finished");
        result
    }

    async fn fund_inner(
        &self,
        principal: Principal,
        milestone_id: MilestoneId,
        instrument: PaymentInstrumentRef,
    ) -> Result<FundingOutcome, EscrowError> {
        let entry = self.ledger.get(milestone_id).await?;
        require_role(&entry.milestone, &principal, Role::Client, "fund")?;
        if let Some(done) = already_funded(&entry) {
            return Ok(done);
        }

        let claim = self.guard.claim(milestone_id, LeaseOperation::Fund).await?;
        let this = self.clone();
        tokio::spawn(async move { this.run(claim, principal, instrument).await })
            .await
            .map_err(|e| EscrowError::Internal(format!("funding task for {milestone_id} failed: {e}")))?
    }

    async fn run(
        &self,
        claim: Claim,
        principal: Principal,
        instrument: PaymentInstrumentRef,
    ) -> Result<FundingOutcome, EscrowError> {
        if let Some(done) = already_funded(&claim.entry) {
            self.guard.abandon(&claim).await;
            return Ok(done);
        }
        if claim.entry.milestone.status() != MilestoneStatus::Pending {
            self.guard.abandon(&claim).await;
            return Err(EscrowError::InvalidTransition {
                milestone_id: claim.milestone_id,
                from: claim.entry.milestone.status(),
                to: MilestoneStatus::Funded,
            });
        }
        let actor = Actor::Party(principal);

        let attempt = match claim.entry.latest_funding_attempt() {
            None => self.fresh_attempt(&claim, 0, instrument),
            Some(prior) => match &prior.status {
                FundingStatus::Succeeded {
                    external_payment_id,
                } => {
                    // Captured before, only the transition is missing.
                    let id = external_payment_id.clone();
                    return self.settle(&claim, actor, id).await;
                }
                FundingStatus::Declined { .. } => {
                    self.fresh_attempt(&claim, prior.attempt + 1, instrument)
                }
                FundingStatus::Unresolved => {
                    let prior = prior.clone();
                    tracing::info!(
                        milestone_id = %claim.milestone_id,
                        attempt = prior.attempt,
                        "previous charge unresolved, querying gateway"
                    );
                    match self.gateway.query_charge(&prior.gateway_key).await {
                        Ok(Some(outcome)) => {
                            return self.apply(&claim, actor, prior, outcome).await;
                        }
                        Ok(None) | Err(_) => prior,
                    }
                }
                FundingStatus::RequiresChallenge => prior.clone(),
            },
        };

        self.charge(claim, actor, attempt).await
    }

    fn fresh_attempt(
        &self,
        claim: &Claim,
        number: u32,
        instrument: PaymentInstrumentRef,
    ) -> FundingAttempt {
        FundingAttempt {
            attempt: number,
            gateway_key: claim.entry.milestone.idempotency_key().for_attempt(number),
            instrument,
            status: FundingStatus::Unresolved,
            updated_at: self.clock.now(),
        }
    }

    async fn charge(
        &self,
        claim: Claim,
        actor: Actor,
        attempt: FundingAttempt,
    ) -> Result<FundingOutcome, EscrowError> {
        let attempt = FundingAttempt {
            status: FundingStatus::Unresolved,
            updated_at: self.clock.now(),
            ..attempt
        };
        if let Err(e) = self.guard.record_funding(&claim, attempt.clone()).await {
            self.guard.abandon(&claim).await;
            return Err(e);
        }

        let request = ChargeRequest {
            amount: claim.entry.milestone.amount().clone(),
            instrument: attempt.instrument.clone(),
            idempotency_key: attempt.gateway_key.clone(),
            milestone_id: claim.milestone_id,
        };

        let mut step = ChargeStep::from(self.gateway.charge(&request).await);
        let mut queries = 0;
        loop {
            match step {
                ChargeStep::Answered(outcome) => {
                    return self.apply(&claim, actor, attempt, outcome).await;
                }
                ChargeStep::Declined(reason) => {
                    return self.decline(&claim, attempt, reason).await;
                }
                ChargeStep::Unavailable(e) => {
                    self.guard.abandon(&claim).await;
                    return Err(EscrowError::GatewayUnavailable {
                        reason: e.to_string(),
                    });
                }
                ChargeStep::Unknown(e) => {
                    if queries >= self.reconcile.attempts {
                        break;
                    }
                    tracing::warn!(
                        milestone_id = %claim.milestone_id,
                        key = %attempt.gateway_key,
                        error = %e,
                        query = queries + 1,
                        "charge outcome unknown, querying gateway"
                    );
                    tokio::time::sleep(self.reconcile.delay(queries)).await;
                    queries += 1;
                    step = match self.gateway.query_charge(&attempt.gateway_key).await {
                        Ok(Some(outcome)) => ChargeStep::Answered(outcome),
                        // Never received: resending under the same key is safe.
                        Ok(None) => ChargeStep::from(self.gateway.charge(&request).await),
                        Err(e) => ChargeStep::Unknown(e),
                    };
                }
            }
        }

        tracing::warn!(
            milestone_id = %claim.milestone_id,
            key = %attempt.gateway_key,
            "charge outcome still unknown, left for reconciliation"
        );
        self.guard.abandon(&claim).await;
        Ok(FundingOutcome::Confirming {
            message: CONFIRMING_MESSAGE,
        })
    }

    async fn apply(
        &self,
        claim: &Claim,
        actor: Actor,
        attempt: FundingAttempt,
        outcome: ChargeOutcome,
    ) -> Result<FundingOutcome, EscrowError> {
        match outcome {
            ChargeOutcome::Succeeded {
                external_payment_id,
            } => self.settle(claim, actor, external_payment_id).await,
            ChargeOutcome::RequiresChallenge { challenge } => {
                let attempt = FundingAttempt {
                    status: FundingStatus::RequiresChallenge,
                    updated_at: self.clock.now(),
                    ..attempt
                };
                let recorded = self.guard.record_funding(claim, attempt).await;
                self.guard.abandon(claim).await;
                recorded?;
                Ok(FundingOutcome::RequiresChallenge { challenge })
            }
            ChargeOutcome::Failed { reason } => self.decline(claim, attempt, reason).await,
        }
    }

    async fn decline(
        &self,
        claim: &Claim,
        attempt: FundingAttempt,
        reason: String,
    ) -> Result<FundingOutcome, EscrowError> {
        let attempt = FundingAttempt {
            status: FundingStatus::Declined {
                reason: reason.clone(),
            },
            updated_at: self.clock.now(),
            ..attempt
        };
        let recorded = self.guard.record_funding(claim, attempt).await;
        self.guard.abandon(claim).await;
        recorded?;
        Err(EscrowError::PaymentFailed {
            milestone_id: claim.milestone_id,
            reason,
        })
    }

    async fn settle(
        &self,
        claim: &Claim,
        actor: Actor,
        external_payment_id: ExternalPaymentId,
    ) -> Result<FundingOutcome, EscrowError> {
        let done = self
            .guard
            .commit(
                claim,
                MilestoneStatus::Pending,
                Transition::Fund {
                    external_payment_id: external_payment_id.clone(),
                },
                actor,
            )
            .await
            .map_err(|e| {
                tracing::error!(
                    milestone_id = %claim.milestone_id,
                    %external_payment_id,
                    error = %e,
                    "charge captured but funding transition failed"
                );
                e
            })?;
        Ok(FundingOutcome::Funded {
            funded_at: done
                .entry
                .milestone
                .funded_at()
                .unwrap_or_else(|| self.clock.now()),
            external_payment_id,
        })
    }
}
