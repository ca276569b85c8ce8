//! # escrow-engine — Milestone Escrow Orchestration
//!
//! Moves client funds into escrow, pays providers out of it, and freezes
//! milestones under dispute, with exactly one financial effect per
//! operation no matter how often it is retried.
//!
//! ## Components
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`funding`] | `pending → funded`: charge, challenge, ambiguity reconciliation |
//! | [`release`] | `completed → released`: fee split, destination account, transfer |
//! | [`dispute`] | `completed/released → disputed` inside the dispute window |
//! | [`guard`] | Lease-based exclusion around every gateway call |
//! | [`reconcile`] | Gateway queries and webhooks applied as the gateway actor |
//! | [`relay`] | Outbox relay to the audit trail and party notifications |
//! | [`rate_limit`] | Per-caller, per-operation request allowance |
//! | [`service`] | [`EscrowService`], the facade wiring all of the above |
//!
//! ## Crate Policy
//!
//! - The ledger is only written after the gateway has answered.
//! - An ambiguous gateway failure is never reported as success or failure;
//!   callers get a "confirming" outcome until reconciliation settles it.
//! - Once a gateway call is claimed it runs on a detached task, so a
//!   caller dropping its future cannot abandon a charge or transfer
//!   half-recorded.

mod access;
pub mod config;
pub mod dispute;
pub mod error;
pub mod funding;
pub mod guard;
pub mod rate_limit;
pub mod reconcile;
pub mod relay;
pub mod release;
pub mod service;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, EngineConfig, RateLimitConfig, ReconcilePolicy};
pub use dispute::DisputeAdjudicator;
pub use error::EscrowError;
pub use funding::{FundingOrchestrator, FundingOutcome, CONFIRMING_MESSAGE};
pub use guard::{Claim, IdempotencyGuard};
pub use rate_limit::{FixedWindowRateLimiter, RateDecision, RateLimitKey, RateLimiter};
pub use reconcile::{EventDisposition, GatewayEvent, ReconcileOutcome, Reconciler};
pub use relay::{
    AuditChainError, AuditRecord, AuditSink, Delivery, EventRelay, MemoryAuditSink,
    MemoryNotifier, Notifier, RelayReport, SinkError, TracingNotifier,
};
pub use release::{ReleaseOrchestrator, ReleaseOutcome};
pub use service::{EscrowService, EscrowServiceBuilder};
pub use telemetry::{init_tracing, LogFormat, TelemetryError};
