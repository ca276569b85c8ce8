//! # Escrow Service
//!
//! The facade the embedding application calls. It wires the orchestrators
//! to one ledger, one gateway and one clock, throttles callers, and keeps
//! the event relay next to the ledger it drains.
//!
//! Every method takes an authenticated [`Principal`]; roles are re-derived
//! from the milestone's parties on each call.

use std::sync::Arc;

use escrow_core::{
    Clock, IdempotencyKey, MilestoneId, PaymentInstrumentRef, Principal, Role, SystemClock,
};
use escrow_gateway::PaymentGateway;
use escrow_ledger::{
    DestinationDirectory, InMemoryDestinationDirectory, Ledger, TransitionRequest,
};
use escrow_state::{Actor, CaseParties, Dispute, Milestone, MilestoneDraft, Transition};

use crate::access::{party_role, require_role};
use crate::config::EngineConfig;
use crate::dispute::DisputeAdjudicator;
use crate::error::EscrowError;
use crate::funding::{FundingOrchestrator, FundingOutcome};
use crate::guard::IdempotencyGuard;
use crate::rate_limit::{FixedWindowRateLimiter, RateDecision, RateLimitKey, RateLimiter};
use crate::reconcile::{EventDisposition, GatewayEvent, ReconcileOutcome, Reconciler};
use crate::relay::{AuditSink, EventRelay, MemoryAuditSink, Notifier, RelayReport, TracingNotifier};
use crate::release::{ReleaseOrchestrator, ReleaseOutcome};

/// Assembles an [`EscrowService`].
pub struct EscrowServiceBuilder {
    ledger: Arc<dyn Ledger>,
    gateway: Arc<dyn PaymentGateway>,
    directory: Option<Arc<dyn DestinationDirectory>>,
    clock: Option<Arc<dyn Clock>>,
    limiter: Option<Arc<dyn RateLimiter>>,
    audit: Option<Arc<dyn AuditSink>>,
    notifier: Option<Arc<dyn Notifier>>,
    config: EngineConfig,
}

impl EscrowServiceBuilder {
    /// Use `directory` for provider destination accounts.
    pub fn with_directory(mut self, directory: Arc<dyn DestinationDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Read time from `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Throttle callers with `limiter`.
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Relay events to `audit`.
    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Relay notifications to `notifier`.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Replace the engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the service. Unset parts default to in-process
    /// implementations and the system clock.
    pub fn build(self) -> EscrowService {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let directory = self
            .directory
            .unwrap_or_else(|| Arc::new(InMemoryDestinationDirectory::new()));
        let limiter = self
            .limiter
            .unwrap_or_else(|| Arc::new(FixedWindowRateLimiter::new(config.rate_limit)));
        let audit = self
            .audit
            .unwrap_or_else(|| Arc::new(MemoryAuditSink::new()));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(TracingNotifier));

        let guard = IdempotencyGuard::new(
            self.ledger.clone(),
            clock.clone(),
            config.lease_ttl,
            config.dispute_window,
        );
        let funding = FundingOrchestrator::new(
            self.ledger.clone(),
            self.gateway.clone(),
            guard.clone(),
            clock.clone(),
            config.reconcile,
        );
        let release = ReleaseOrchestrator::new(
            self.ledger.clone(),
            directory,
            self.gateway.clone(),
            guard.clone(),
            clock.clone(),
            config.fee_rate,
            config.reconcile,
        );
        let disputes =
            DisputeAdjudicator::new(self.ledger.clone(), clock.clone(), config.dispute_window);
        let reconciler =
            Reconciler::new(self.ledger.clone(), self.gateway.clone(), guard, clock.clone());
        let relay = Arc::new(EventRelay::new(self.ledger.clone(), audit, notifier));

        tracing::info!(
            gateway = self.gateway.gateway_name(),
            fee_bps = config.fee_rate.bps(),
            "escrow service ready"
        );

        EscrowService {
            ledger: self.ledger,
            clock,
            limiter,
            config,
            funding,
            release,
            disputes,
            reconciler,
            relay,
        }
    }
}

/// Milestone escrow operations.
pub struct EscrowService {
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    limiter: Arc<dyn RateLimiter>,
    config: EngineConfig,
    funding: FundingOrchestrator,
    release: ReleaseOrchestrator,
    disputes: DisputeAdjudicator,
    reconciler: Reconciler,
    relay: Arc<EventRelay>,
}

impl std::fmt::Debug for EscrowService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscrowService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EscrowService {
    /// Start assembling a service over `ledger` and `gateway`.
    pub fn builder(
        ledger: Arc<dyn Ledger>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> EscrowServiceBuilder {
        EscrowServiceBuilder {
            ledger,
            gateway,
            directory: None,
            clock: None,
            limiter: None,
            audit: None,
            notifier: None,
            config: EngineConfig::default(),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn throttle(
        &self,
        operation: &'static str,
        principal: &Principal,
    ) -> Result<(), EscrowError> {
        let key = RateLimitKey {
            operation,
            caller: principal.user(),
        };
        match self.limiter.check(key, self.clock.now()).await {
            RateDecision::Allowed { .. } => Ok(()),
            RateDecision::Limited { retry_after_secs } => Err(EscrowError::RateLimited {
                operation,
                retry_after_secs,
            }),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Create a pending milestone on a case. Either party may create one.
    pub async fn create_milestone(
        &self,
        principal: Principal,
        parties: CaseParties,
        draft: MilestoneDraft,
    ) -> Result<Milestone, EscrowError> {
        self.throttle("create_milestone", &principal).await?;
        match parties.role_of(principal.user()) {
            Some(role) if role == principal.role() => {}
            _ => {
                return Err(EscrowError::Forbidden {
                    reason: format!(
                        "{} is not the {} of case {}",
                        principal.user(),
                        principal.role(),
                        parties.case_id()
                    ),
                })
            }
        }
        let milestone = Milestone::create(
            &parties,
            draft,
            IdempotencyKey::generate(),
            self.clock.now(),
        )?;
        let entry = self.ledger.create(milestone).await?;
        tracing::info!(
            milestone_id = %entry.milestone.id(),
            case_id = %entry.milestone.case_id(),
            amount = entry.milestone.amount().amount(),
            "milestone created"
        );
        Ok(entry.milestone)
    }

    /// Charge the client and fund the milestone.
    pub async fn fund(
        &self,
        principal: Principal,
        milestone_id: MilestoneId,
        instrument: PaymentInstrumentRef,
    ) -> Result<FundingOutcome, EscrowError> {
        self.throttle("fund", &principal).await?;
        self.funding.fund(principal, milestone_id, instrument).await
    }

    /// The provider reports the work done.
    pub async fn mark_complete(
        &self,
        principal: Principal,
        milestone_id: MilestoneId,
    ) -> Result<Milestone, EscrowError> {
        self.throttle("mark_complete", &principal).await?;
        let entry = self.ledger.get(milestone_id).await?;
        require_role(&entry.milestone, &principal, Role::Provider, "complete")?;
        let done = self
            .ledger
            .transition(TransitionRequest {
                milestone_id,
                expected: entry.milestone.status(),
                transition: Transition::Complete,
                actor: Actor::Party(principal),
                lease: None,
                at: self.clock.now(),
                dispute_window: self.config.dispute_window,
            })
            .await?;
        tracing::info!(%milestone_id, "milestone marked complete");
        Ok(done.entry.milestone)
    }

    /// Pay the provider and release the milestone.
    pub async fn release(
        &self,
        principal: Principal,
        milestone_id: MilestoneId,
    ) -> Result<ReleaseOutcome, EscrowError> {
        self.throttle("release", &principal).await?;
        self.release.release(principal, milestone_id).await
    }

    /// File a dispute.
    pub async fn dispute(
        &self,
        principal: Principal,
        milestone_id: MilestoneId,
        reason: &str,
        description: &str,
    ) -> Result<Dispute, EscrowError> {
        self.throttle("dispute", &principal).await?;
        self.disputes
            .dispute(principal, milestone_id, reason, description)
            .await
    }

    /// A milestone as seen by one of its parties.
    pub async fn milestone(
        &self,
        principal: Principal,
        milestone_id: MilestoneId,
    ) -> Result<Milestone, EscrowError> {
        let entry = self.ledger.get(milestone_id).await?;
        party_role(&entry.milestone, &principal)?;
        Ok(entry.milestone)
    }

    // ── Gateway side ────────────────────────────────────────────────

    /// Re-query the gateway for a milestone stuck on an unknown outcome.
    pub async fn reconcile(
        &self,
        milestone_id: MilestoneId,
    ) -> Result<ReconcileOutcome, EscrowError> {
        self.reconciler.reconcile(milestone_id).await
    }

    /// Apply a webhook from the gateway.
    pub async fn handle_gateway_event(
        &self,
        event: GatewayEvent,
    ) -> Result<EventDisposition, EscrowError> {
        self.reconciler.handle_gateway_event(event).await
    }

    // ── Events ──────────────────────────────────────────────────────

    /// Relay every pending outbox event now.
    pub async fn drain_events(&self) -> Result<RelayReport, EscrowError> {
        self.relay.drain_all().await
    }

    /// The relay, for running it on an interval.
    pub fn relay(&self) -> Arc<EventRelay> {
        Arc::clone(&self.relay)
    }
}
