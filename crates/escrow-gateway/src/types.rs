//! Request and outcome types exchanged with the payment gateway.

use serde::{Deserialize, Serialize};

use escrow_core::{
    Currency, DestinationAccountRef, ExternalPaymentId, IdempotencyKey, MilestoneId, Money,
    PaymentInstrumentRef, TransferGroup, TransferId,
};

/// Opaque strong-authentication challenge, passed to the client unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChallengePayload(pub serde_json::Value);

/// A charge against a stored payment instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChargeRequest {
    /// Amount to capture.
    pub amount: Money,
    /// Instrument to charge.
    pub instrument: PaymentInstrumentRef,
    /// Key deduplicating this charge at the gateway.
    pub idempotency_key: IdempotencyKey,
    /// Milestone being funded, for the gateway's metadata.
    pub milestone_id: MilestoneId,
}

/// Result of a charge or a charge query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChargeOutcome {
    /// Funds captured.
    Succeeded {
        /// Gateway charge reference.
        external_payment_id: ExternalPaymentId,
    },
    /// The client must complete strong authentication first.
    RequiresChallenge {
        /// Challenge to hand to the client.
        challenge: ChallengePayload,
    },
    /// Declined.
    Failed {
        /// Gateway's reason.
        reason: String,
    },
}

/// A payout from a captured charge to a provider account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferRequest {
    /// Charge the funds come from.
    pub source_charge: ExternalPaymentId,
    /// Provider account credited.
    pub destination: DestinationAccountRef,
    /// Amount in minor units.
    pub amount: u64,
    /// Currency of the amount.
    pub currency: Currency,
    /// Tag grouping every payout attempt for the milestone.
    pub transfer_group: TransferGroup,
    /// Key deduplicating this attempt at the gateway.
    pub idempotency_key: IdempotencyKey,
}

/// Result of a transfer or a transfer query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransferOutcome {
    /// Paid out.
    Succeeded {
        /// Gateway transfer reference.
        transfer_id: TransferId,
    },
    /// Not paid out.
    Failed {
        /// Gateway's reason.
        reason: String,
    },
}
