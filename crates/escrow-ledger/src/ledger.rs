//! # Ledger Capability
//!
//! The source of truth for milestones. Implementations must serialize
//! writes per milestone and keep different milestones fully parallel.
//! There is deliberately no "set status" operation: the only way to move a
//! milestone is [`Ledger::transition`].

use async_trait::async_trait;
use chrono::Duration;

use escrow_core::{DestinationAccountRef, IdempotencyKey, MilestoneId, Timestamp, UserId};
use escrow_state::{Actor, DisputeWindow, Milestone, MilestoneEvent, MilestoneStatus, Transition};

use crate::error::LedgerError;
use crate::record::{
    FundingAttempt, Lease, LeaseOperation, LeaseToken, LedgerEntry, OutboxEntry, ReleaseTransfer,
};

/// A guarded state change.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    /// Milestone to move.
    pub milestone_id: MilestoneId,
    /// Status the caller observed. A mismatch at write time is a conflict.
    pub expected: MilestoneStatus,
    /// The transition.
    pub transition: Transition,
    /// Who is driving it.
    pub actor: Actor,
    /// Lease held by the caller, if any. Cleared on success.
    pub lease: Option<LeaseToken>,
    /// Effective time.
    pub at: Timestamp,
    /// Window applied to disputes.
    pub dispute_window: DisputeWindow,
}

/// Result of a committed transition.
#[derive(Debug, Clone)]
pub struct Transitioned {
    /// Entry after the write.
    pub entry: LedgerEntry,
    /// Event appended to the outbox.
    pub event: MilestoneEvent,
    /// Outbox position of the event.
    pub sequence: u64,
}

/// Persistent milestone store with transition-guarded mutators.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Store a newly created milestone.
    async fn create(&self, milestone: Milestone) -> Result<LedgerEntry, LedgerError>;

    /// Read a milestone and its bookkeeping.
    async fn get(&self, id: MilestoneId) -> Result<LedgerEntry, LedgerError>;

    /// Look up the milestone bound to an idempotency key.
    async fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<MilestoneId>, LedgerError>;

    /// Claim the milestone for an operation.
    ///
    /// Fails with [`LedgerError::LeaseHeld`] while another operation's
    /// lease is live. An expired lease is taken over.
    async fn acquire_lease(
        &self,
        id: MilestoneId,
        operation: LeaseOperation,
        now: Timestamp,
        ttl: Duration,
    ) -> Result<Lease, LedgerError>;

    /// Drop a lease. A no-op if `token` no longer holds it.
    async fn release_lease(&self, id: MilestoneId, token: LeaseToken) -> Result<(), LedgerError>;

    /// Insert or update a funding attempt (matched by attempt number).
    async fn record_funding_attempt(
        &self,
        id: MilestoneId,
        token: LeaseToken,
        attempt: FundingAttempt,
    ) -> Result<(), LedgerError>;

    /// Insert or update the release transfer.
    async fn record_release_transfer(
        &self,
        id: MilestoneId,
        token: LeaseToken,
        transfer: ReleaseTransfer,
    ) -> Result<(), LedgerError>;

    /// Atomically check and apply a transition, update the bookkeeping it
    /// settles, and append its event to the outbox.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::LeaseHeld`] if another operation's lease is live.
    /// - [`LedgerError::ConflictingTransition`] if the milestone is no
    ///   longer in `expected` and the requested edge was legal from it.
    /// - [`LedgerError::PayoutUnresolved`] for a dispute while the
    ///   recorded payout transfer has no known outcome.
    /// - [`LedgerError::Transition`] for any state-machine rejection.
    async fn transition(&self, request: TransitionRequest) -> Result<Transitioned, LedgerError>;

    /// Unacknowledged outbox entries, oldest first.
    async fn pending_events(&self, limit: usize) -> Result<Vec<OutboxEntry>, LedgerError>;

    /// Remove an outbox entry after it has been durably relayed.
    async fn acknowledge(&self, sequence: u64) -> Result<(), LedgerError>;
}

/// Provider → payable destination account mapping.
#[async_trait]
pub trait DestinationDirectory: Send + Sync {
    /// The provider's account, if one is on file.
    async fn get(&self, provider: UserId) -> Result<Option<DestinationAccountRef>, LedgerError>;

    /// Store `account` unless one is already on file. Returns the stored
    /// reference, which is the earlier one if a concurrent writer won.
    async fn put_if_absent(
        &self,
        provider: UserId,
        account: DestinationAccountRef,
    ) -> Result<DestinationAccountRef, LedgerError>;
}
