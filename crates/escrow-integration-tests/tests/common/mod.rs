//! Shared harness: one service over an in-memory ledger, a mock gateway
//! and a manual clock, with a client and a provider on one case.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use escrow_core::{
    CaseId, Clock, Currency, DestinationAccountRef, ManualClock, MilestoneId, Money, PaymentInstrumentRef, Principal, Role,
    Timestamp, UserId,
};
use escrow_engine::{
    EngineConfig, EscrowService, FundingOutcome, MemoryAuditSink, MemoryNotifier, RateLimitConfig,
    ReconcilePolicy, ReleaseOutcome,
};
use escrow_gateway::MockGateway;
use escrow_ledger::{DestinationDirectory, InMemoryDestinationDirectory, InMemoryLedger};
use escrow_state::{CaseParties, Milestone, MilestoneDraft, MilestoneStatus};

pub const VISA: &str = "pm_card_visa";

pub struct World {
    pub service: EscrowService,
    pub ledger: Arc<InMemoryLedger>,
    pub gateway: Arc<MockGateway>,
    pub directory: Arc<InMemoryDestinationDirectory>,
    pub clock: Arc<ManualClock>,
    pub audit: Arc<MemoryAuditSink>,
    pub notifier: Arc<MemoryNotifier>,
    pub parties: CaseParties,
    pub client: Principal,
    pub provider: Principal,
}

/// Test configuration: fast reconciliation and a limit nobody reaches.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        reconcile: ReconcilePolicy {
            attempts: 2,
            base_delay: Duration::from_millis(1),
        },
        rate_limit: RateLimitConfig {
            max_requests: 10_000,
            window: chrono::Duration::seconds(60),
        },
        ..EngineConfig::default()
    }
}

pub fn start() -> Timestamp {
    Timestamp::parse("2026-05-04T12:00:00Z").unwrap()
}

pub fn instrument(name: &str) -> PaymentInstrumentRef {
    PaymentInstrumentRef::new(name).unwrap()
}

pub fn usd(amount: u64) -> Money {
    Money::new(amount, Currency::new("usd").unwrap()).unwrap()
}

impl World {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let ledger = Arc::new(InMemoryLedger::new());
        let gateway = Arc::new(MockGateway::new());
        let directory = Arc::new(InMemoryDestinationDirectory::new());
        let clock = Arc::new(ManualClock::new(start()));
        let audit = Arc::new(MemoryAuditSink::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let service = EscrowService::builder(ledger.clone(), gateway.clone())
            .with_directory(directory.clone())
            .with_clock(clock.clone())
            .with_audit_sink(audit.clone())
            .with_notifier(notifier.clone())
            .with_config(config)
            .build();

        let client = UserId::new();
        let provider = UserId::new();
        Self {
            service,
            ledger,
            gateway,
            directory,
            clock,
            audit,
            notifier,
            parties: CaseParties::new(CaseId::new(), client, provider).unwrap(),
            client: Principal::authenticated(client, Role::Client),
            provider: Principal::authenticated(provider, Role::Provider),
        }
    }

    pub fn stranger(&self) -> Principal {
        Principal::authenticated(UserId::new(), Role::Client)
    }

    pub async fn create(&self, amount: u64) -> Milestone {
        self.service
            .create_milestone(
                self.client,
                self.parties,
                MilestoneDraft {
                    title: "Deliverable".into(),
                    amount: usd(amount),
                },
            )
            .await
            .unwrap()
    }

    pub async fn funded(&self, amount: u64) -> MilestoneId {
        let id = self.create(amount).await.id();
        let outcome = self
            .service
            .fund(self.client, id, instrument(VISA))
            .await
            .unwrap();
        assert!(matches!(outcome, FundingOutcome::Funded { .. }), "{outcome:?}");
        id
    }

    pub async fn completed(&self, amount: u64) -> MilestoneId {
        let id = self.funded(amount).await;
        self.service.mark_complete(self.provider, id).await.unwrap();
        id
    }

    pub async fn released(&self, amount: u64) -> MilestoneId {
        let id = self.completed(amount).await;
        let outcome = self.service.release(self.client, id).await.unwrap();
        assert!(matches!(outcome, ReleaseOutcome::Released { .. }), "{outcome:?}");
        id
    }

    /// A milestone of `amount` driven to `status` through the service.
    pub async fn at(&self, status: MilestoneStatus, amount: u64) -> MilestoneId {
        match status {
            MilestoneStatus::Pending => self.create(amount).await.id(),
            MilestoneStatus::Funded => self.funded(amount).await,
            MilestoneStatus::Completed => self.completed(amount).await,
            MilestoneStatus::Released => self.released(amount).await,
            MilestoneStatus::Disputed => {
                let id = self.completed(amount).await;
                self.service
                    .dispute(self.client, id, "quality", "work not as agreed")
                    .await
                    .unwrap();
                id
            }
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub async fn destination_of(&self, who: Principal) -> Option<DestinationAccountRef> {
        self.directory.get(who.user()).await.unwrap()
    }

    pub async fn status(&self, id: MilestoneId) -> MilestoneStatus {
        self.service.milestone(self.client, id).await.unwrap().status()
    }
}
