//! # Milestone Aggregate
//!
//! A milestone's lifecycle data lives in a tagged union, [`MilestoneState`],
//! so each status carries exactly the fields that exist in it. A pending
//! milestone has no payment reference; a funded one always does. Illegal
//! field combinations cannot be constructed.
//!
//! The only mutator is [`Milestone::apply`]. It re-derives the caller's side
//! of the case from the milestone's own parties, checks the transition
//! table, enforces the dispute window, and returns the resulting event.

use serde::{Deserialize, Serialize};

use escrow_core::{
    CaseId, DestinationAccountRef, DisputeId, ExternalPaymentId, FeeSplit, IdempotencyKey,
    MilestoneId, Money, Principal, Role, Timestamp, TransferId, UserId, ValidationError,
};

use crate::dispute::{Dispute, DisputeWindow};
use crate::error::TransitionError;
use crate::event::{MilestoneEvent, MilestoneEventKind};
use crate::status::MilestoneStatus;

// ── Case parties ────────────────────────────────────────────────────

/// The two parties of a case, as resolved by the case service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseParties {
    case_id: CaseId,
    client: UserId,
    provider: UserId,
}

impl CaseParties {
    /// Client and provider must be different users.
    pub fn new(case_id: CaseId, client: UserId, provider: UserId) -> Result<Self, ValidationError> {
        if client == provider {
            return Err(ValidationError::SameParty);
        }
        Ok(Self {
            case_id,
            client,
            provider,
        })
    }

    /// The case.
    pub fn case_id(&self) -> CaseId {
        self.case_id
    }

    /// The paying party.
    pub fn client(&self) -> UserId {
        self.client
    }

    /// The performing party.
    pub fn provider(&self) -> UserId {
        self.provider
    }

    /// Which side `user` is on, if any.
    pub fn role_of(&self, user: UserId) -> Option<Role> {
        if user == self.client {
            Some(Role::Client)
        } else if user == self.provider {
            Some(Role::Provider)
        } else {
            None
        }
    }
}

/// Caller-supplied fields for a new milestone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneDraft {
    /// Human label.
    pub title: String,
    /// Amount to be held in escrow.
    pub amount: Money,
}

// ── State ───────────────────────────────────────────────────────────

/// Captured client funds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Funding {
    /// Gateway charge reference.
    pub external_payment_id: ExternalPaymentId,
    /// When funding was recorded.
    pub funded_at: Timestamp,
}

/// A completed payout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    /// Fee split applied.
    pub split: FeeSplit,
    /// Provider account paid, absent when the payee share was zero.
    pub destination: Option<DestinationAccountRef>,
    /// Gateway transfer reference, absent when the payee share was zero.
    pub transfer_id: Option<TransferId>,
    /// When the release was recorded.
    pub released_at: Timestamp,
}

/// Lifecycle data of a milestone, one variant per status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MilestoneState {
    /// Awaiting funding.
    Pending,
    /// Funds captured.
    Funded {
        /// Capture details.
        funding: Funding,
    },
    /// Work done, funds still held.
    Completed {
        /// Capture details.
        funding: Funding,
        /// When the provider marked the work done.
        completed_at: Timestamp,
    },
    /// Funds paid out.
    Released {
        /// Capture details.
        funding: Funding,
        /// When the provider marked the work done.
        completed_at: Timestamp,
        /// Payout details.
        payout: Payout,
    },
    /// Frozen for manual resolution.
    Disputed {
        /// Capture details.
        funding: Funding,
        /// When the provider marked the work done.
        completed_at: Timestamp,
        /// Payout details if the dispute followed a release.
        payout: Option<Payout>,
        /// The dispute record.
        dispute_id: DisputeId,
        /// When the dispute was filed.
        disputed_at: Timestamp,
    },
}

impl MilestoneState {
    /// Flat status of this state.
    pub fn status(&self) -> MilestoneStatus {
        match self {
            Self::Pending => MilestoneStatus::Pending,
            Self::Funded { .. } => MilestoneStatus::Funded,
            Self::Completed { .. } => MilestoneStatus::Completed,
            Self::Released { .. } => MilestoneStatus::Released,
            Self::Disputed { .. } => MilestoneStatus::Disputed,
        }
    }
}

// ── Transitions ─────────────────────────────────────────────────────

/// A requested state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// `pending → funded`.
    Fund {
        /// Gateway charge reference of the successful charge.
        external_payment_id: ExternalPaymentId,
    },
    /// `funded → completed`.
    Complete,
    /// `completed → released`.
    Release {
        /// Fee split applied to the milestone amount.
        split: FeeSplit,
        /// Provider account paid.
        destination: Option<DestinationAccountRef>,
        /// Gateway transfer reference.
        transfer_id: Option<TransferId>,
    },
    /// `completed | released → disputed`.
    Dispute {
        /// The dispute being filed.
        dispute: Dispute,
    },
}

impl Transition {
    /// Status this transition leads to.
    pub fn target(&self) -> MilestoneStatus {
        match self {
            Self::Fund { .. } => MilestoneStatus::Funded,
            Self::Complete => MilestoneStatus::Completed,
            Self::Release { .. } => MilestoneStatus::Released,
            Self::Dispute { .. } => MilestoneStatus::Disputed,
        }
    }

    /// Verb used in logs and errors.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Fund { .. } => "fund",
            Self::Complete => "complete",
            Self::Release { .. } => "release",
            Self::Dispute { .. } => "dispute",
        }
    }
}

/// Who is driving a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    /// An authenticated user.
    Party(Principal),
    /// The payment gateway confirming an outcome it reported.
    Gateway,
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Party(p) => write!(f, "{} ({})", p.user(), p.role()),
            Self::Gateway => f.write_str("gateway"),
        }
    }
}

// ── Milestone ───────────────────────────────────────────────────────

/// A billable, independently fundable and releasable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    id: MilestoneId,
    case_id: CaseId,
    client: UserId,
    provider: UserId,
    title: String,
    amount: Money,
    idempotency_key: IdempotencyKey,
    created_at: Timestamp,
    state: MilestoneState,
}

impl Milestone {
    /// Create a pending milestone. Parties are copied from the case and
    /// never change afterwards.
    pub fn create(
        parties: &CaseParties,
        draft: MilestoneDraft,
        idempotency_key: IdempotencyKey,
        created_at: Timestamp,
    ) -> Result<Self, ValidationError> {
        let title = draft.title.trim().to_string();
        if title.is_empty() {
            return Err(ValidationError::EmptyField { field: "title" });
        }
        Ok(Self {
            id: MilestoneId::new(),
            case_id: parties.case_id(),
            client: parties.client(),
            provider: parties.provider(),
            title,
            amount: draft.amount,
            idempotency_key,
            created_at,
            state: MilestoneState::Pending,
        })
    }

    /// Milestone identifier.
    pub fn id(&self) -> MilestoneId {
        self.id
    }

    /// Owning case.
    pub fn case_id(&self) -> CaseId {
        self.case_id
    }

    /// Paying party.
    pub fn client(&self) -> UserId {
        self.client
    }

    /// Performing party.
    pub fn provider(&self) -> UserId {
        self.provider
    }

    /// Human label.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Escrowed amount.
    pub fn amount(&self) -> &Money {
        &self.amount
    }

    /// Key anchoring every funding call for this milestone.
    pub fn idempotency_key(&self) -> &IdempotencyKey {
        &self.idempotency_key
    }

    /// Creation time.
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Full lifecycle state.
    pub fn state(&self) -> &MilestoneState {
        &self.state
    }

    /// Flat status.
    pub fn status(&self) -> MilestoneStatus {
        self.state.status()
    }

    /// Which side `user` is on, if any.
    pub fn role_of(&self, user: UserId) -> Option<Role> {
        if user == self.client {
            Some(Role::Client)
        } else if user == self.provider {
            Some(Role::Provider)
        } else {
            None
        }
    }

    /// The user on the given side.
    pub fn party(&self, role: Role) -> UserId {
        match role {
            Role::Client => self.client,
            Role::Provider => self.provider,
        }
    }

    /// Capture details, present once funded.
    pub fn funding(&self) -> Option<&Funding> {
        match &self.state {
            MilestoneState::Pending => None,
            MilestoneState::Funded { funding }
            | MilestoneState::Completed { funding, .. }
            | MilestoneState::Released { funding, .. }
            | MilestoneState::Disputed { funding, .. } => Some(funding),
        }
    }

    /// Gateway charge reference, present once funded.
    pub fn external_payment_id(&self) -> Option<&ExternalPaymentId> {
        self.funding().map(|f| &f.external_payment_id)
    }

    /// When funding was recorded.
    pub fn funded_at(&self) -> Option<Timestamp> {
        self.funding().map(|f| f.funded_at)
    }

    /// When the provider marked the work done.
    pub fn completed_at(&self) -> Option<Timestamp> {
        match &self.state {
            MilestoneState::Completed { completed_at, .. }
            | MilestoneState::Released { completed_at, .. }
            | MilestoneState::Disputed { completed_at, .. } => Some(*completed_at),
            _ => None,
        }
    }

    /// Payout details, present once released.
    pub fn payout(&self) -> Option<&Payout> {
        match &self.state {
            MilestoneState::Released { payout, .. } => Some(payout),
            MilestoneState::Disputed { payout, .. } => payout.as_ref(),
            _ => None,
        }
    }

    /// When the release was recorded.
    pub fn released_at(&self) -> Option<Timestamp> {
        self.payout().map(|p| p.released_at)
    }

    /// The open dispute, if any.
    pub fn dispute_id(&self) -> Option<DisputeId> {
        match &self.state {
            MilestoneState::Disputed { dispute_id, .. } => Some(*dispute_id),
            _ => None,
        }
    }

    /// Instant the dispute window is measured from: release if released,
    /// else completion.
    pub fn dispute_anchor(&self) -> Option<Timestamp> {
        self.released_at().or_else(|| self.completed_at())
    }

    /// Apply a transition and return the event it produces.
    ///
    /// Timestamps recorded on the milestone never go backwards: `at` is
    /// clamped to the previous lifecycle timestamp.
    ///
    /// # Errors
    ///
    /// - [`TransitionError::Forbidden`] if the actor may not drive this
    ///   transition on this milestone.
    /// - [`TransitionError::InvalidTransition`] if the edge is not in the
    ///   transition table.
    /// - [`TransitionError::DisputeWindowExpired`] for a late dispute.
    /// - [`TransitionError::Validation`] for an inconsistent fee split.
    pub fn apply(
        &mut self,
        transition: Transition,
        actor: &Actor,
        at: Timestamp,
        window: &DisputeWindow,
    ) -> Result<MilestoneEvent, TransitionError> {
        self.authorize(&transition, actor)?;

        let from = self.status();
        let to = transition.target();
        let invalid = TransitionError::InvalidTransition {
            milestone_id: self.id,
            from,
            to,
        };
        if !from.can_transition_to(to) {
            return Err(invalid);
        }

        let (next, kind, recipients) = match (&self.state, transition) {
            (MilestoneState::Pending, Transition::Fund { external_payment_id }) => {
                let funding = Funding {
                    external_payment_id: external_payment_id.clone(),
                    funded_at: at.max(self.created_at),
                };
                (
                    MilestoneState::Funded { funding },
                    MilestoneEventKind::Funded {
                        external_payment_id,
                        amount: self.amount.clone(),
                    },
                    vec![self.provider],
                )
            }
            (MilestoneState::Funded { funding }, Transition::Complete) => (
                MilestoneState::Completed {
                    funding: funding.clone(),
                    completed_at: at.max(funding.funded_at),
                },
                MilestoneEventKind::Completed,
                vec![self.client],
            ),
            (
                MilestoneState::Completed {
                    funding,
                    completed_at,
                },
                Transition::Release {
                    split,
                    destination,
                    transfer_id,
                },
            ) => {
                if split.total() != self.amount.amount() {
                    return Err(ValidationError::OutOfRange {
                        field: "fee split",
                        reason: "must sum to the milestone amount",
                    }
                    .into());
                }
                let payout = Payout {
                    split,
                    destination,
                    transfer_id: transfer_id.clone(),
                    released_at: at.max(*completed_at),
                };
                (
                    MilestoneState::Released {
                        funding: funding.clone(),
                        completed_at: *completed_at,
                        payout,
                    },
                    MilestoneEventKind::Released {
                        payee_amount: split.payee_amount,
                        platform_fee: split.platform_fee,
                        transfer_id,
                    },
                    vec![self.provider],
                )
            }
            (
                MilestoneState::Completed {
                    funding,
                    completed_at,
                },
                Transition::Dispute { dispute },
            ) => self.disputed(funding, *completed_at, None, dispute, at, window)?,
            (
                MilestoneState::Released {
                    funding,
                    completed_at,
                    payout,
                },
                Transition::Dispute { dispute },
            ) => self.disputed(
                funding,
                *completed_at,
                Some(payout.clone()),
                dispute,
                at,
                window,
            )?,
            _ => return Err(invalid),
        };

        self.state = next;
        let occurred_at = self.lifecycle_time().unwrap_or(at);
        Ok(MilestoneEvent {
            milestone_id: self.id,
            case_id: self.case_id,
            occurred_at,
            recipients,
            kind,
        })
    }

    fn disputed(
        &self,
        funding: &Funding,
        completed_at: Timestamp,
        payout: Option<Payout>,
        dispute: Dispute,
        at: Timestamp,
        window: &DisputeWindow,
    ) -> Result<(MilestoneState, MilestoneEventKind, Vec<UserId>), TransitionError> {
        let anchor = payout
            .as_ref()
            .map(|p| p.released_at)
            .unwrap_or(completed_at);
        if !window.is_open(anchor, at) {
            return Err(TransitionError::DisputeWindowExpired {
                milestone_id: self.id,
                anchor,
                deadline: window.deadline(anchor),
            });
        }
        let recipient = self.party(dispute.filed_by.counterparty());
        Ok((
            MilestoneState::Disputed {
                funding: funding.clone(),
                completed_at,
                payout,
                dispute_id: dispute.id,
                disputed_at: at.max(anchor),
            },
            MilestoneEventKind::Disputed {
                dispute_id: dispute.id,
                filed_by: dispute.filed_by,
                reason: dispute.reason,
            },
            vec![recipient],
        ))
    }

    /// Timestamp recorded by the most recent transition.
    fn lifecycle_time(&self) -> Option<Timestamp> {
        match &self.state {
            MilestoneState::Pending => None,
            MilestoneState::Funded { funding } => Some(funding.funded_at),
            MilestoneState::Completed { completed_at, .. } => Some(*completed_at),
            MilestoneState::Released { payout, .. } => Some(payout.released_at),
            MilestoneState::Disputed { disputed_at, .. } => Some(*disputed_at),
        }
    }

    fn authorize(&self, transition: &Transition, actor: &Actor) -> Result<(), TransitionError> {
        let forbid = |reason| TransitionError::Forbidden {
            milestone_id: self.id,
            actor: actor.to_string(),
            action: transition.action(),
            reason,
        };

        let principal = match actor {
            Actor::Gateway => {
                return match transition {
                    Transition::Fund { .. } | Transition::Release { .. } => Ok(()),
                    _ => Err(forbid("the gateway only confirms payment outcomes")),
                };
            }
            Actor::Party(principal) => principal,
        };

        let role = self
            .role_of(principal.user())
            .ok_or_else(|| forbid("caller is not a party to this milestone"))?;
        if role != principal.role() {
            return Err(forbid("session role does not match the caller's side of the case"));
        }

        match transition {
            Transition::Fund { .. } | Transition::Release { .. } if role != Role::Client => {
                Err(forbid("only the client may do this"))
            }
            Transition::Complete if role != Role::Provider => {
                Err(forbid("only the provider may do this"))
            }
            Transition::Dispute { dispute }
                if dispute.milestone_id != self.id
                    || dispute.filed_by_user != principal.user()
                    || dispute.filed_by != role =>
            {
                Err(forbid("dispute record does not match the caller"))
            }
            _ => Ok(()),
        }
    }
}
