//! Test seeding shared by the engine's unit tests.

use std::sync::Arc;

use escrow_core::{
    CaseId, Clock, Currency, ExternalPaymentId, FeeRate, FeeSplit, IdempotencyKey, ManualClock,
    MilestoneId, Money, PaymentInstrumentRef, Principal, Role, Timestamp, UserId,
};
use escrow_ledger::{
    FundingAttempt, FundingStatus, InMemoryLedger, LeaseOperation, Ledger, TransitionRequest,
};
use escrow_state::{Actor, CaseParties, DisputeWindow, Milestone, MilestoneDraft, MilestoneStatus, Transition};

pub(crate) struct Seeded {
    pub ledger: Arc<InMemoryLedger>,
    pub clock: Arc<ManualClock>,
    pub client: Principal,
    pub provider: Principal,
    pub milestone_id: MilestoneId,
    pub key: IdempotencyKey,
}

pub(crate) fn start() -> Timestamp {
    Timestamp::parse("2026-01-01T00:00:00Z").unwrap()
}

/// A milestone of `amount` usd cents walked up to `target` through the
/// ledger directly.
pub(crate) async fn seed(amount: u64, target: MilestoneStatus) -> Seeded {
    let ledger = Arc::new(InMemoryLedger::new());
    let clock = Arc::new(ManualClock::new(start()));
    let client = UserId::new();
    let provider = UserId::new();
    let parties = CaseParties::new(CaseId::new(), client, provider).unwrap();
    let milestone = Milestone::create(
        &parties,
        MilestoneDraft {
            title: "Milestone".into(),
            amount: Money::new(amount, Currency::new("usd").unwrap()).unwrap(),
        },
        IdempotencyKey::generate(),
        clock.now(),
    )
    .unwrap();
    let milestone_id = milestone.id();
    let key = milestone.idempotency_key().clone();
    ledger.create(milestone).await.unwrap();

    let seeded = Seeded {
        ledger,
        clock,
        client: Principal::authenticated(client, Role::Client),
        provider: Principal::authenticated(provider, Role::Provider),
        milestone_id,
        key,
    };
    if target == MilestoneStatus::Pending {
        return seeded;
    }

    let lease = seeded
        .ledger
        .acquire_lease(
            milestone_id,
            LeaseOperation::Fund,
            seeded.clock.now(),
            chrono::Duration::seconds(60),
        )
        .await
        .unwrap();
    seeded
        .ledger
        .record_funding_attempt(
            milestone_id,
            lease.token,
            FundingAttempt {
                attempt: 0,
                gateway_key: seeded.key.clone(),
                instrument: PaymentInstrumentRef::new("pm_card_visa").unwrap(),
                status: FundingStatus::Unresolved,
                updated_at: seeded.clock.now(),
            },
        )
        .await
        .unwrap();
    seeded
        .step(
            MilestoneStatus::Pending,
            Transition::Fund {
                external_payment_id: ExternalPaymentId::new("ch_seed").unwrap(),
            },
            seeded.client,
            Some(lease.token),
        )
        .await;
    if target == MilestoneStatus::Funded {
        return seeded;
    }

    seeded
        .step(MilestoneStatus::Funded, Transition::Complete, seeded.provider, None)
        .await;
    if target == MilestoneStatus::Completed {
        return seeded;
    }

    seeded
        .step(
            MilestoneStatus::Completed,
            Transition::Release {
                split: FeeSplit::compute(amount, FeeRate::DEFAULT),
                destination: None,
                transfer_id: None,
            },
            seeded.client,
            None,
        )
        .await;
    assert_eq!(target, MilestoneStatus::Released, "cannot seed {target}");
    seeded
}

impl Seeded {
    async fn step(
        &self,
        expected: MilestoneStatus,
        transition: Transition,
        by: Principal,
        lease: Option<escrow_ledger::LeaseToken>,
    ) {
        self.ledger
            .transition(TransitionRequest {
                milestone_id: self.milestone_id,
                expected,
                transition,
                actor: Actor::Party(by),
                lease,
                at: self.clock.now(),
                dispute_window: DisputeWindow::default(),
            })
            .await
            .unwrap();
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }
}
