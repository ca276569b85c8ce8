//! # escrow-state — Milestone Lifecycle State Machine
//!
//! Pure, synchronous domain logic for a milestone's lifecycle:
//!
//! - [`MilestoneStatus`] and its transition table.
//! - [`MilestoneState`], a tagged union holding exactly the fields each
//!   status has.
//! - [`Milestone::apply`], the single guarded mutator.
//! - [`Dispute`] records and the inclusive [`DisputeWindow`].
//! - [`MilestoneEvent`], emitted once per successful transition.
//!
//! No I/O happens here. Persistence and the payment gateway live in
//! `escrow-ledger` and `escrow-gateway`.

pub mod dispute;
pub mod error;
pub mod event;
pub mod milestone;
pub mod status;

pub use dispute::{Dispute, DisputeWindow};
pub use error::TransitionError;
pub use event::{MilestoneEvent, MilestoneEventKind};
pub use milestone::{
    Actor, CaseParties, Funding, Milestone, MilestoneDraft, MilestoneState, Payout, Transition,
};
pub use status::MilestoneStatus;
