//! # Ledger Records
//!
//! A [`LedgerEntry`] is the unit of mutual exclusion: the milestone itself
//! plus the idempotency bookkeeping kept alongside it. Leases, funding
//! attempts and release transfers are written under the same row lock as
//! the milestone's state, so no two workers can both believe they are the
//! one calling the gateway.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use escrow_core::{
    DestinationAccountRef, ExternalPaymentId, FeeSplit, IdempotencyKey, PaymentInstrumentRef,
    Timestamp, TransferGroup, TransferId,
};
use escrow_state::{Dispute, Milestone, MilestoneEvent};

// ── Leases ──────────────────────────────────────────────────────────

/// Opaque proof of lease ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken(Uuid);

impl LeaseToken {
    /// Mint a fresh token.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Operation a lease was taken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseOperation {
    /// Charging the client.
    Fund,
    /// Paying out the provider.
    Release,
    /// Re-querying the gateway for an unresolved attempt.
    Reconcile,
}

impl LeaseOperation {
    /// The canonical string name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fund => "fund",
            Self::Release => "release",
            Self::Reconcile => "reconcile",
        }
    }
}

impl std::fmt::Display for LeaseOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An in-flight operation's claim on a milestone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Ownership token.
    pub token: LeaseToken,
    /// What the holder is doing.
    pub operation: LeaseOperation,
    /// When it was taken.
    pub acquired_at: Timestamp,
    /// When it lapses if not released.
    pub expires_at: Timestamp,
}

impl Lease {
    /// Whether the lease still excludes other operations at `now`.
    pub fn is_live(&self, now: Timestamp) -> bool {
        now < self.expires_at
    }
}

// ── Funding attempts ────────────────────────────────────────────────

/// What is known about a charge request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FundingStatus {
    /// Sent (or about to be sent) with no known result.
    Unresolved,
    /// Captured.
    Succeeded {
        /// Gateway charge reference.
        external_payment_id: ExternalPaymentId,
    },
    /// Waiting on the client to complete strong authentication.
    RequiresChallenge,
    /// Definitively declined.
    Declined {
        /// Gateway's reason.
        reason: String,
    },
}

impl FundingStatus {
    /// Whether the gateway may still capture under this attempt's key.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Unresolved | Self::RequiresChallenge)
    }
}

/// One charge request against a milestone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingAttempt {
    /// Attempt number, starting at 0.
    pub attempt: u32,
    /// Key sent to the gateway.
    pub gateway_key: IdempotencyKey,
    /// Instrument charged.
    pub instrument: PaymentInstrumentRef,
    /// Latest known outcome.
    pub status: FundingStatus,
    /// Last time this record changed.
    pub updated_at: Timestamp,
}

// ── Release transfers ───────────────────────────────────────────────

/// What is known about a payout transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransferStatus {
    /// Sent (or about to be sent) with no known result.
    Unresolved,
    /// Paid out.
    Succeeded {
        /// Gateway transfer reference.
        transfer_id: TransferId,
    },
    /// Definitively failed; funds remain captured.
    Failed {
        /// Gateway's reason.
        reason: String,
    },
}

/// The payout transfer for a milestone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseTransfer {
    /// Split computed for the payout. Reused verbatim on retry.
    pub split: FeeSplit,
    /// Provider account paid.
    pub destination: DestinationAccountRef,
    /// Gateway grouping tag, stable for the milestone.
    pub transfer_group: TransferGroup,
    /// Attempt number, starting at 0. Bumped only after a definitive
    /// failure, so an ambiguous send is always retried under its own key.
    #[serde(default)]
    pub attempt: u32,
    /// Latest known outcome.
    pub status: TransferStatus,
    /// Last time this record changed.
    pub updated_at: Timestamp,
}

impl ReleaseTransfer {
    /// Key the gateway deduplicates this attempt under.
    pub fn gateway_key(&self) -> IdempotencyKey {
        self.transfer_group.attempt_key(self.attempt)
    }
}

// ── Entry ───────────────────────────────────────────────────────────

/// A milestone row with its bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// The milestone.
    pub milestone: Milestone,
    /// In-flight operation, if any.
    pub lease: Option<Lease>,
    /// Every charge request, oldest first.
    pub funding_attempts: Vec<FundingAttempt>,
    /// The payout transfer, once attempted.
    pub release_transfer: Option<ReleaseTransfer>,
    /// The dispute, once filed.
    pub dispute: Option<Dispute>,
    /// Incremented on every write.
    pub version: u64,
}

impl LedgerEntry {
    /// A fresh entry for a newly created milestone.
    pub fn new(milestone: Milestone) -> Self {
        Self {
            milestone,
            lease: None,
            funding_attempts: Vec::new(),
            release_transfer: None,
            dispute: None,
            version: 0,
        }
    }

    /// Most recent charge request.
    pub fn latest_funding_attempt(&self) -> Option<&FundingAttempt> {
        self.funding_attempts.last()
    }

    /// The lease if it is still live at `now`.
    pub fn live_lease(&self, now: Timestamp) -> Option<&Lease> {
        self.lease.as_ref().filter(|l| l.is_live(now))
    }
}

// ── Outbox ──────────────────────────────────────────────────────────

/// An event awaiting relay to audit and notification sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Monotonic position in the outbox.
    pub sequence: u64,
    /// The event.
    pub event: MilestoneEvent,
}
