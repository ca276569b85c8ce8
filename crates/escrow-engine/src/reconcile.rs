//! # Gateway Reconciliation
//!
//! Two ways to learn what the gateway did after an orchestrator gave up
//! waiting:
//!
//! - [`Reconciler::reconcile`] asks the gateway about a milestone's open
//!   funding attempt or release transfer and applies the answer.
//! - [`Reconciler::handle_gateway_event`] applies an event the gateway
//!   pushed (a webhook).
//!
//! Both act as [`Actor::Gateway`], which the ledger only lets through when
//! a recorded attempt backs the outcome. Both claim a `Reconcile` lease
//! first, so they never race an orchestrator that is still talking to the
//! gateway. A duplicate webhook lands on an already-settled milestone and
//! is reported as [`EventDisposition::Duplicate`].

use std::sync::Arc;

use escrow_core::{
    Clock, ExternalPaymentId, IdempotencyKey, MilestoneId, TransferGroup, TransferId,
};
use escrow_gateway::{ChargeOutcome, PaymentGateway, TransferOutcome};
use escrow_ledger::{
    FundingAttempt, FundingStatus, LeaseOperation, Ledger, LedgerEntry, ReleaseTransfer,
    TransferStatus,
};
use escrow_state::{Actor, MilestoneStatus, Transition};
use serde::{Deserialize, Serialize};

use crate::error::EscrowError;
use crate::guard::{Claim, IdempotencyGuard};
use crate::telemetry::{self, RECONCILE_TOTAL};

/// Result of [`Reconciler::reconcile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The charge had succeeded; the milestone is now funded.
    Funded {
        /// Gateway charge reference.
        external_payment_id: ExternalPaymentId,
    },
    /// The transfer had succeeded; the milestone is now released.
    Released {
        /// Gateway transfer reference.
        transfer_id: TransferId,
    },
    /// The charge was declined; the client may fund again.
    Declined {
        /// Gateway's reason.
        reason: String,
    },
    /// The charge waits on the client's authentication.
    AwaitingChallenge,
    /// The transfer failed; release may be retried.
    TransferFailed {
        /// Gateway's reason.
        reason: String,
    },
    /// The gateway could not tell yet.
    StillUnresolved,
    /// An orchestrator is working on the milestone right now.
    InFlight,
    /// No open attempt to reconcile.
    NothingToReconcile {
        /// Current status.
        status: MilestoneStatus,
    },
}

impl ReconcileOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Funded { .. } => "funded",
            Self::Released { .. } => "released",
            Self::Declined { .. } => "declined",
            Self::AwaitingChallenge => "awaiting_challenge",
            Self::TransferFailed { .. } => "transfer_failed",
            Self::StillUnresolved => "still_unresolved",
            Self::InFlight => "in_flight",
            Self::NothingToReconcile { .. } => "nothing_to_reconcile",
        }
    }
}

/// An asynchronous notification from the payment gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// A charge was captured.
    ChargeSucceeded {
        /// Key the charge was created under.
        idempotency_key: IdempotencyKey,
        /// Gateway charge reference.
        external_payment_id: ExternalPaymentId,
    },
    /// A charge was declined.
    ChargeFailed {
        /// Key the charge was created under.
        idempotency_key: IdempotencyKey,
        /// Gateway's reason.
        reason: String,
    },
    /// A payout transfer settled.
    TransferSucceeded {
        /// Group the transfer was tagged with.
        transfer_group: TransferGroup,
        /// Gateway transfer reference.
        transfer_id: TransferId,
    },
    /// A payout transfer failed.
    TransferFailed {
        /// Group the transfer was tagged with.
        transfer_group: TransferGroup,
        /// Key of the attempt that failed.
        idempotency_key: IdempotencyKey,
        /// Gateway's reason.
        reason: String,
    },
}

impl GatewayEvent {
    /// Event type name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChargeSucceeded { .. } => "charge_succeeded",
            Self::ChargeFailed { .. } => "charge_failed",
            Self::TransferSucceeded { .. } => "transfer_succeeded",
            Self::TransferFailed { .. } => "transfer_failed",
        }
    }
}

/// What happened to a [`GatewayEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDisposition {
    /// Applied; the milestone is now in `status`.
    Applied {
        /// Status after the event.
        status: MilestoneStatus,
    },
    /// Already reflected in the ledger.
    Duplicate,
    /// An operation is in flight; the gateway should redeliver later.
    Deferred,
    /// Not applicable to any recorded attempt.
    Ignored {
        /// Why the event was dropped.
        reason: &'static str,
    },
}

impl EventDisposition {
    fn label(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "event_applied",
            Self::Duplicate => "event_duplicate",
            Self::Deferred => "event_deferred",
            Self::Ignored { .. } => "event_ignored",
        }
    }
}

/// Applies gateway-side truth to the ledger.
#[derive(Clone)]
pub struct Reconciler {
    ledger: Arc<dyn Ledger>,
    gateway: Arc<dyn PaymentGateway>,
    guard: IdempotencyGuard,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("gateway", &self.gateway.gateway_name())
            .finish_non_exhaustive()
    }
}

/// Claim the row for reconciliation, or report that someone else has it.
macro_rules! claim_or {
    ($self:ident, $id:expr, $busy:expr) => {
        match $self.guard.claim($id, LeaseOperation::Reconcile).await {
            Ok(claim) => claim,
            Err(EscrowError::ConflictingTransition { .. }) => return Ok($busy),
            Err(e) => return Err(e),
        }
    };
}

impl Reconciler {
    /// Build the reconciler.
    pub fn new(
        ledger: Arc<dyn Ledger>,
        gateway: Arc<dyn PaymentGateway>,
        guard: IdempotencyGuard,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            gateway,
            guard,
            clock,
        }
    }

    /// Query the gateway about the milestone's open attempt and apply the
    /// answer.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile(
        &self,
        milestone_id: MilestoneId,
    ) -> Result<ReconcileOutcome, EscrowError> {
        let result = self.reconcile_inner(milestone_id).await;
        let label = result.as_ref().map_or("error", ReconcileOutcome::label);
        telemetry::count_outcome(RECONCILE_TOTAL, label);
        tracing::info!(%milestone_id, outcome = label, "reconciliation finished");
        result
    }

    async fn reconcile_inner(
        &self,
        milestone_id: MilestoneId,
    ) -> Result<ReconcileOutcome, EscrowError> {
        let claim = claim_or!(self, milestone_id, ReconcileOutcome::InFlight);
        let status = claim.entry.milestone.status();
        let outcome = match status {
            MilestoneStatus::Pending => match claim.entry.latest_funding_attempt().cloned() {
                Some(attempt) => return self.reconcile_charge(claim, attempt).await,
                None => ReconcileOutcome::NothingToReconcile { status },
            },
            MilestoneStatus::Completed => match claim.entry.release_transfer.clone() {
                Some(transfer) => return self.reconcile_transfer(claim, transfer).await,
                None => ReconcileOutcome::NothingToReconcile { status },
            },
            _ => ReconcileOutcome::NothingToReconcile { status },
        };
        self.guard.abandon(&claim).await;
        Ok(outcome)
    }

    async fn reconcile_charge(
        &self,
        claim: Claim,
        attempt: FundingAttempt,
    ) -> Result<ReconcileOutcome, EscrowError> {
        let answer = match &attempt.status {
            FundingStatus::Succeeded {
                external_payment_id,
            } => Some(ChargeOutcome::Succeeded {
                external_payment_id: external_payment_id.clone(),
            }),
            FundingStatus::Declined { .. } => {
                self.guard.abandon(&claim).await;
                return Ok(ReconcileOutcome::NothingToReconcile {
                    status: MilestoneStatus::Pending,
                });
            }
            FundingStatus::Unresolved | FundingStatus::RequiresChallenge => {
                match self.gateway.query_charge(&attempt.gateway_key).await {
                    Ok(answer) => answer,
                    Err(e) => {
                        tracing::warn!(
                            milestone_id = %claim.milestone_id,
                            gateway_key = %attempt.gateway_key,
                            error = %e,
                            "charge query failed"
                        );
                        None
                    }
                }
            }
        };

        match answer {
            Some(ChargeOutcome::Succeeded {
                external_payment_id,
            }) => {
                self.guard
                    .commit(
                        &claim,
                        MilestoneStatus::Pending,
                        Transition::Fund {
                            external_payment_id: external_payment_id.clone(),
                        },
                        Actor::Gateway,
                    )
                    .await?;
                Ok(ReconcileOutcome::Funded {
                    external_payment_id,
                })
            }
            Some(ChargeOutcome::Failed { reason }) => {
                self.mark_attempt(
                    &claim,
                    attempt,
                    FundingStatus::Declined {
                        reason: reason.clone(),
                    },
                )
                .await?;
                Ok(ReconcileOutcome::Declined { reason })
            }
            Some(ChargeOutcome::RequiresChallenge { .. }) => {
                self.mark_attempt(&claim, attempt, FundingStatus::RequiresChallenge)
                    .await?;
                Ok(ReconcileOutcome::AwaitingChallenge)
            }
            None => {
                self.guard.abandon(&claim).await;
                Ok(ReconcileOutcome::StillUnresolved)
            }
        }
    }

    async fn reconcile_transfer(
        &self,
        claim: Claim,
        transfer: ReleaseTransfer,
    ) -> Result<ReconcileOutcome, EscrowError> {
        let answer = match &transfer.status {
            TransferStatus::Succeeded { transfer_id } => Some(TransferOutcome::Succeeded {
                transfer_id: transfer_id.clone(),
            }),
            TransferStatus::Failed { reason } => {
                let reason = reason.clone();
                self.guard.abandon(&claim).await;
                return Ok(ReconcileOutcome::TransferFailed { reason });
            }
            TransferStatus::Unresolved => {
                match self.gateway.query_transfer(&transfer.gateway_key()).await {
                    Ok(answer) => answer,
                    Err(e) => {
                        tracing::warn!(
                            milestone_id = %claim.milestone_id,
                            gateway_key = %transfer.gateway_key(),
                            error = %e,
                            "transfer query failed"
                        );
                        None
                    }
                }
            }
        };

        match answer {
            Some(TransferOutcome::Succeeded { transfer_id }) => {
                self.settle_release(&claim, transfer, transfer_id.clone())
                    .await?;
                Ok(ReconcileOutcome::Released { transfer_id })
            }
            Some(TransferOutcome::Failed { reason }) => {
                self.mark_transfer(&claim, transfer, reason.clone()).await?;
                Ok(ReconcileOutcome::TransferFailed { reason })
            }
            None => {
                self.guard.abandon(&claim).await;
                Ok(ReconcileOutcome::StillUnresolved)
            }
        }
    }

    /// Apply a gateway-pushed event.
    #[tracing::instrument(skip(self, event), fields(kind = event.kind()))]
    pub async fn handle_gateway_event(
        &self,
        event: GatewayEvent,
    ) -> Result<EventDisposition, EscrowError> {
        let result = match event {
            GatewayEvent::ChargeSucceeded {
                idempotency_key,
                external_payment_id,
            } => {
                self.charge_event(&idempotency_key, Ok(external_payment_id))
                    .await
            }
            GatewayEvent::ChargeFailed {
                idempotency_key,
                reason,
            } => self.charge_event(&idempotency_key, Err(reason)).await,
            GatewayEvent::TransferSucceeded {
                transfer_group,
                transfer_id,
            } => self.transfer_event(&transfer_group, Ok(transfer_id)).await,
            GatewayEvent::TransferFailed {
                transfer_group,
                idempotency_key,
                reason,
            } => {
                self.transfer_event(&transfer_group, Err((idempotency_key, reason)))
                    .await
            }
        };
        let label = result.as_ref().map_or("event_error", EventDisposition::label);
        telemetry::count_outcome(RECONCILE_TOTAL, label);
        if let Ok(disposition) = &result {
            tracing::info!(?disposition, "gateway event handled");
        }
        result
    }

    async fn charge_event(
        &self,
        gateway_key: &IdempotencyKey,
        result: Result<ExternalPaymentId, String>,
    ) -> Result<EventDisposition, EscrowError> {
        let (base, attempt_no) = gateway_key.split_attempt();
        let milestone_id = match self.ledger.find_by_idempotency_key(&base).await? {
            Some(id) => id,
            None => match self.ledger.find_by_idempotency_key(gateway_key).await? {
                Some(id) => id,
                None => {
                    return Ok(EventDisposition::Ignored {
                        reason: "unknown idempotency key",
                    })
                }
            },
        };

        let entry = self.ledger.get(milestone_id).await?;
        if entry.milestone.status() != MilestoneStatus::Pending {
            return Ok(EventDisposition::Duplicate);
        }
        let Some(attempt) = find_attempt(&entry, gateway_key, attempt_no) else {
            return Ok(EventDisposition::Ignored {
                reason: "no recorded attempt for this key",
            });
        };
        if !attempt.status.is_open() {
            return Ok(EventDisposition::Duplicate);
        }

        let claim = claim_or!(self, milestone_id, EventDisposition::Deferred);
        match result {
            Ok(external_payment_id) => {
                let committed = self
                    .guard
                    .commit(
                        &claim,
                        MilestoneStatus::Pending,
                        Transition::Fund {
                            external_payment_id,
                        },
                        Actor::Gateway,
                    )
                    .await;
                applied_or_duplicate(committed.map(|_| MilestoneStatus::Funded))
            }
            Err(reason) => {
                self.mark_attempt(&claim, attempt, FundingStatus::Declined { reason })
                    .await?;
                Ok(EventDisposition::Applied {
                    status: MilestoneStatus::Pending,
                })
            }
        }
    }

    async fn transfer_event(
        &self,
        group: &TransferGroup,
        result: Result<TransferId, (IdempotencyKey, String)>,
    ) -> Result<EventDisposition, EscrowError> {
        let Some(milestone_id) = group.milestone_id() else {
            return Ok(EventDisposition::Ignored {
                reason: "transfer group does not name a milestone",
            });
        };
        let entry = match self.ledger.get(milestone_id).await {
            Ok(entry) => entry,
            Err(escrow_ledger::LedgerError::NotFound { .. }) => {
                return Ok(EventDisposition::Ignored {
                    reason: "unknown milestone",
                })
            }
            Err(e) => return Err(e.into()),
        };
        if entry.milestone.payout().is_some() {
            return Ok(EventDisposition::Duplicate);
        }
        if entry.milestone.status() != MilestoneStatus::Completed {
            return Ok(EventDisposition::Ignored {
                reason: "milestone is not awaiting a payout",
            });
        }
        let Some(transfer) = entry.release_transfer.clone() else {
            return Ok(EventDisposition::Ignored {
                reason: "no recorded transfer for this group",
            });
        };
        if let Err((key, _)) = &result {
            if *key != transfer.gateway_key() {
                return Ok(EventDisposition::Ignored {
                    reason: "failure is for an earlier transfer attempt",
                });
            }
        }

        let claim = claim_or!(self, milestone_id, EventDisposition::Deferred);
        match result {
            Ok(transfer_id) => {
                let committed = self.settle_release(&claim, transfer, transfer_id).await;
                applied_or_duplicate(committed.map(|()| MilestoneStatus::Released))
            }
            Err((_, reason)) => {
                if matches!(transfer.status, TransferStatus::Failed { .. }) {
                    self.guard.abandon(&claim).await;
                    return Ok(EventDisposition::Duplicate);
                }
                self.mark_transfer(&claim, transfer, reason).await?;
                Ok(EventDisposition::Applied {
                    status: MilestoneStatus::Completed,
                })
            }
        }
    }

    async fn settle_release(
        &self,
        claim: &Claim,
        transfer: ReleaseTransfer,
        transfer_id: TransferId,
    ) -> Result<(), EscrowError> {
        self.guard
            .commit(
                claim,
                MilestoneStatus::Completed,
                Transition::Release {
                    split: transfer.split,
                    destination: Some(transfer.destination),
                    transfer_id: Some(transfer_id),
                },
                Actor::Gateway,
            )
            .await
            .map(|_| ())
    }

    /// Record a non-terminal attempt status and drop the claim.
    async fn mark_attempt(
        &self,
        claim: &Claim,
        attempt: FundingAttempt,
        status: FundingStatus,
    ) -> Result<(), EscrowError> {
        let recorded = self
            .guard
            .record_funding(
                claim,
                FundingAttempt {
                    status,
                    updated_at: self.clock.now(),
                    ..attempt
                },
            )
            .await;
        self.guard.abandon(claim).await;
        recorded
    }

    async fn mark_transfer(
        &self,
        claim: &Claim,
        transfer: ReleaseTransfer,
        reason: String,
    ) -> Result<(), EscrowError> {
        let recorded = self
            .guard
            .record_transfer(
                claim,
                ReleaseTransfer {
                    status: TransferStatus::Failed { reason },
                    updated_at: self.clock.now(),
                    ..transfer
                },
            )
            .await;
        self.guard.abandon(claim).await;
        recorded
    }
}

fn find_attempt(
    entry: &LedgerEntry,
    gateway_key: &IdempotencyKey,
    attempt_no: u32,
) -> Option<FundingAttempt> {
    entry
        .funding_attempts
        .iter()
        .find(|a| &a.gateway_key == gateway_key || (attempt_no > 0 && a.attempt == attempt_no))
        .cloned()
}

/// A lost race against another writer means the event was already applied.
fn applied_or_duplicate(
    committed: Result<MilestoneStatus, EscrowError>,
) -> Result<EventDisposition, EscrowError> {
    match committed {
        Ok(status) => Ok(EventDisposition::Applied { status }),
        Err(EscrowError::ConflictingTransition { .. }) => Ok(EventDisposition::Duplicate),
        Err(e) => Err(e),
    }
}
