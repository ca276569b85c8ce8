//! # escrow-ledger — Milestone Ledger Capability
//!
//! The [`Ledger`] trait is the single source of truth for milestone
//! records. It exposes transition-guarded mutators only, keeps the
//! Idempotency Guard's bookkeeping (leases, funding attempts, release
//! transfers) in the same atomic unit as the milestone row, and appends
//! every transition's event to a transactional outbox.
//!
//! [`InMemoryLedger`] and [`InMemoryDestinationDirectory`] are the
//! reference implementations used by tests and single-process
//! deployments.

pub mod error;
pub mod ledger;
pub mod memory;
pub mod record;

pub use error::LedgerError;
pub use ledger::{DestinationDirectory, Ledger, TransitionRequest, Transitioned};
pub use memory::{InMemoryDestinationDirectory, InMemoryLedger};
pub use record::{
    FundingAttempt, FundingStatus, Lease, LeaseOperation, LeaseToken, LedgerEntry, OutboxEntry,
    ReleaseTransfer, TransferStatus,
};
