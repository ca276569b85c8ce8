#![deny(missing_docs)]

//! # escrow-core — Foundational Types for the Escrow Engine
//!
//! This crate defines the domain primitives every other escrow crate is
//! built on. It depends on nothing internal.
//!
//! ## Key Design Principles
//!
//! 1. **Newtype wrappers for identifiers.** `MilestoneId`, `CaseId`,
//!    `UserId`, `IdempotencyKey`, `TransferGroup` and friends are distinct
//!    types with validated constructors. No bare strings cross an API.
//!
//! 2. **Minor units only.** `Money` carries a strictly positive `u64`
//!    amount in the currency's minor unit. Floating point never touches an
//!    amount, a fee rate, or a fee split.
//!
//! 3. **Deterministic fee split.** `FeeSplit::compute` rounds the platform
//!    fee up by at most one minor unit and always conserves the amount.
//!
//! 4. **UTC-only timestamps behind a `Clock`.** Time is read through an
//!    injected `Clock` so dispute-window boundaries are testable to the
//!    second.
//!
//! 5. **Authenticated principals.** A `Principal` is only ever produced by
//!    the identity layer; nothing in the engine accepts a role claim from a
//!    request payload.
//!
//! ## Crate Policy
//!
//! - No dependencies on other `escrow-*` crates.
//! - No `unsafe` code.
//! - No `panic!()` or `.unwrap()` outside tests.

pub mod error;
pub mod identity;
pub mod money;
pub mod principal;
pub mod temporal;

pub use error::ValidationError;
pub use identity::{
    CaseId, DestinationAccountRef, DisputeId, ExternalPaymentId, IdempotencyKey, MilestoneId,
    PaymentInstrumentRef, TransferGroup, TransferId, UserId,
};
pub use money::{Currency, FeeRate, FeeSplit, Money};
pub use principal::{Principal, Role};
pub use temporal::{Clock, ManualClock, SystemClock, Timestamp};
