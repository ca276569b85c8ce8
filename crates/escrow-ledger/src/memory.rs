//! # In-Memory Ledger
//!
//! Reference [`Ledger`] and [`DestinationDirectory`] backed by process
//! memory. Each milestone row sits behind its own mutex; the map lock is
//! only held long enough to find the row, so writes to different
//! milestones never contend. Lock order is always row, then outbox.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use parking_lot::{Mutex, RwLock};

use escrow_core::{DestinationAccountRef, IdempotencyKey, MilestoneId, Timestamp, UserId};
use escrow_state::{Actor, Milestone, MilestoneEvent, Transition, TransitionError};

use crate::error::LedgerError;
use crate::ledger::{DestinationDirectory, Ledger, TransitionRequest, Transitioned};
use crate::record::{
    FundingAttempt, FundingStatus, Lease, LeaseOperation, LeaseToken, LedgerEntry, OutboxEntry,
    ReleaseTransfer, TransferStatus,
};

type Row = Arc<Mutex<LedgerEntry>>;

#[derive(Debug, Default)]
struct Outbox {
    next_sequence: u64,
    entries: BTreeMap<u64, OutboxEntry>,
}

impl Outbox {
    fn append(&mut self, event: MilestoneEvent) -> u64 {
        self.next_sequence += 1;
        let sequence = self.next_sequence;
        self.entries.insert(sequence, OutboxEntry { sequence, event });
        sequence
    }
}

/// Process-local [`Ledger`].
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    rows: RwLock<HashMap<MilestoneId, Row>>,
    keys: RwLock<HashMap<IdempotencyKey, MilestoneId>>,
    outbox: Mutex<Outbox>,
}

impl InMemoryLedger {
    /// An empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored milestones.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// Whether no milestones are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn row(&self, id: MilestoneId) -> Result<Row, LedgerError> {
        self.rows
            .read()
            .get(&id)
            .cloned()
            .ok_or(LedgerError::NotFound { milestone_id: id })
    }
}

fn require_lease(entry: &LedgerEntry, token: LeaseToken) -> Result<(), LedgerError> {
    match &entry.lease {
        Some(lease) if lease.token == token => Ok(()),
        _ => Err(LedgerError::LeaseLost {
            milestone_id: entry.milestone.id(),
        }),
    }
}

/// Whether a recorded attempt backs a gateway-reported outcome.
fn gateway_backed(entry: &LedgerEntry, transition: &Transition) -> bool {
    match transition {
        Transition::Fund { .. } => entry
            .funding_attempts
            .iter()
            .any(|a| a.status.is_open() || matches!(a.status, FundingStatus::Succeeded { .. })),
        Transition::Release { .. } => entry.release_transfer.is_some(),
        _ => false,
    }
}

/// Whether money may have left for the payee without the ledger knowing.
fn payout_unresolved(entry: &LedgerEntry) -> bool {
    entry
        .release_transfer
        .as_ref()
        .is_some_and(|t| t.status == TransferStatus::Unresolved)
}

/// Settle the bookkeeping a committed transition resolves.
fn settle(entry: &mut LedgerEntry, transition: Transition, at: Timestamp) {
    match transition {
        Transition::Fund {
            external_payment_id,
        } => {
            if let Some(attempt) = entry.funding_attempts.last_mut() {
                if attempt.status.is_open() {
                    attempt.status = FundingStatus::Succeeded {
                        external_payment_id,
                    };
                    attempt.updated_at = at;
                }
            }
        }
        Transition::Release {
            transfer_id: Some(transfer_id),
            ..
        } => {
            if let Some(transfer) = entry.release_transfer.as_mut() {
                transfer.status = TransferStatus::Succeeded { transfer_id };
                transfer.updated_at = at;
            }
        }
        Transition::Dispute { dispute } => entry.dispute = Some(dispute),
        Transition::Release { .. } | Transition::Complete => {}
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn create(&self, milestone: Milestone) -> Result<LedgerEntry, LedgerError> {
        let id = milestone.id();
        let mut rows = self.rows.write();
        let mut keys = self.keys.write();
        if rows.contains_key(&id) {
            return Err(LedgerError::AlreadyExists { milestone_id: id });
        }
        if keys.contains_key(milestone.idempotency_key()) {
            return Err(LedgerError::DuplicateIdempotencyKey {
                key: milestone.idempotency_key().clone(),
            });
        }
        keys.insert(milestone.idempotency_key().clone(), id);
        let entry = LedgerEntry::new(milestone);
        rows.insert(id, Arc::new(Mutex::new(entry.clone())));
        Ok(entry)
    }

    async fn get(&self, id: MilestoneId) -> Result<LedgerEntry, LedgerError> {
        let row = self.row(id)?;
        let entry = row.lock().clone();
        Ok(entry)
    }

    async fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<MilestoneId>, LedgerError> {
        Ok(self.keys.read().get(key).copied())
    }

    async fn acquire_lease(
        &self,
        id: MilestoneId,
        operation: LeaseOperation,
        now: Timestamp,
        ttl: Duration,
    ) -> Result<Lease, LedgerError> {
        let row = self.row(id)?;
        let mut entry = row.lock();
        if let Some(held) = entry.live_lease(now) {
            return Err(LedgerError::LeaseHeld {
                milestone_id: id,
                operation: held.operation,
                expires_at: held.expires_at,
            });
        }
        if let Some(stale) = &entry.lease {
            tracing::warn!(
                milestone_id = %id,
                operation = %stale.operation,
                expired_at = %stale.expires_at,
                "taking over expired lease"
            );
        }
        let lease = Lease {
            token: LeaseToken::new(),
            operation,
            acquired_at: now,
            expires_at: now.saturating_add(ttl),
        };
        entry.lease = Some(lease.clone());
        entry.version += 1;
        Ok(lease)
    }

    async fn release_lease(&self, id: MilestoneId, token: LeaseToken) -> Result<(), LedgerError> {
        let row = self.row(id)?;
        let mut entry = row.lock();
        if entry.lease.as_ref().is_some_and(|l| l.token == token) {
            entry.lease = None;
            entry.version += 1;
        }
        Ok(())
    }

    async fn record_funding_attempt(
        &self,
        id: MilestoneId,
        token: LeaseToken,
        attempt: FundingAttempt,
    ) -> Result<(), LedgerError> {
        let row = self.row(id)?;
        let mut entry = row.lock();
        require_lease(&entry, token)?;
        let slot = entry
            .funding_attempts
            .iter()
            .position(|a| a.attempt == attempt.attempt);
        match slot {
            Some(i) => entry.funding_attempts[i] = attempt,
            None => entry.funding_attempts.push(attempt),
        }
        entry.version += 1;
        Ok(())
    }

    async fn record_release_transfer(
        &self,
        id: MilestoneId,
        token: LeaseToken,
        transfer: ReleaseTransfer,
    ) -> Result<(), LedgerError> {
        let row = self.row(id)?;
        let mut entry = row.lock();
        require_lease(&entry, token)?;
        entry.release_transfer = Some(transfer);
        entry.version += 1;
        Ok(())
    }

    async fn transition(&self, request: TransitionRequest) -> Result<Transitioned, LedgerError> {
        let TransitionRequest {
            milestone_id,
            expected,
            transition,
            actor,
            lease,
            at,
            dispute_window,
        } = request;

        let row = self.row(milestone_id)?;
        let mut entry = row.lock();

        if let Some(held) = entry.live_lease(at) {
            if Some(held.token) != lease {
                return Err(LedgerError::LeaseHeld {
                    milestone_id,
                    operation: held.operation,
                    expires_at: held.expires_at,
                });
            }
        }

        let actual = entry.milestone.status();
        let target = transition.target();
        if actual != expected {
            return Err(if expected.can_transition_to(target) {
                LedgerError::ConflictingTransition {
                    milestone_id,
                    expected,
                    actual,
                }
            } else {
                TransitionError::InvalidTransition {
                    milestone_id,
                    from: actual,
                    to: target,
                }
                .into()
            });
        }

        if matches!(actor, Actor::Gateway) && !gateway_backed(&entry, &transition) {
            return Err(TransitionError::Forbidden {
                milestone_id,
                actor: actor.to_string(),
                action: transition.action(),
                reason: "no recorded attempt backs this outcome",
            }
            .into());
        }

        if matches!(transition, Transition::Dispute { .. }) && payout_unresolved(&entry) {
            return Err(LedgerError::PayoutUnresolved { milestone_id });
        }

        let mut milestone = entry.milestone.clone();
        let event = milestone.apply(transition.clone(), &actor, at, &dispute_window)?;

        entry.milestone = milestone;
        settle(&mut entry, transition, at);
        if lease.is_some() && entry.lease.as_ref().map(|l| l.token) == lease {
            entry.lease = None;
        }
        entry.version += 1;

        let sequence = self.outbox.lock().append(event.clone());
        tracing::debug!(
            milestone_id = %milestone_id,
            from = %actual,
            to = %target,
            sequence,
            "ledger transition committed"
        );

        Ok(Transitioned {
            entry: entry.clone(),
            event,
            sequence,
        })
    }

    async fn pending_events(&self, limit: usize) -> Result<Vec<OutboxEntry>, LedgerError> {
        Ok(self
            .outbox
            .lock()
            .entries
            .values()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn acknowledge(&self, sequence: u64) -> Result<(), LedgerError> {
        self.outbox.lock().entries.remove(&sequence);
        Ok(())
    }
}

/// Process-local [`DestinationDirectory`].
#[derive(Debug, Default)]
pub struct InMemoryDestinationDirectory {
    accounts: RwLock<HashMap<UserId, DestinationAccountRef>>,
}

impl InMemoryDestinationDirectory {
    /// An empty directory.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DestinationDirectory for InMemoryDestinationDirectory {
    async fn get(&self, provider: UserId) -> Result<Option<DestinationAccountRef>, LedgerError> {
        Ok(self.accounts.read().get(&provider).cloned())
    }

    async fn put_if_absent(
        &self,
        provider: UserId,
        account: DestinationAccountRef,
    ) -> Result<DestinationAccountRef, LedgerError> {
        Ok(self
            .accounts
            .write()
            .entry(provider)
            .or_insert(account)
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use escrow_core::{
        CaseId, Currency, ExternalPaymentId, FeeRate, FeeSplit, Money, PaymentInstrumentRef,
        Principal, Role, TransferGroup,
    };
    use escrow_state::{
        CaseParties, Dispute, DisputeWindow, MilestoneDraft, MilestoneEventKind, MilestoneStatus,
    };

    struct Fixture {
        ledger: InMemoryLedger,
        id: MilestoneId,
        key: IdempotencyKey,
        client: Principal,
        provider: Principal,
        now: Timestamp,
    }

    async fn fixture() -> Fixture {
        let client = Principal::authenticated(UserId::new(), Role::Client);
        let provider = Principal::authenticated(UserId::new(), Role::Provider);
        let parties = CaseParties::new(CaseId::new(), client.user(), provider.user()).unwrap();
        let key = IdempotencyKey::generate();
        let now = Timestamp::parse("2026-04-01T12:00:00Z").unwrap();
        let milestone = Milestone::create(
            &parties,
            MilestoneDraft {
                title: "Contract review".into(),
                amount: Money::new(5_000, Currency::new("usd").unwrap()).unwrap(),
            },
            key.clone(),
            now,
        )
        .unwrap();
        let id = milestone.id();
        let ledger = InMemoryLedger::new();
        ledger.create(milestone).await.unwrap();
        Fixture {
            ledger,
            id,
            key,
            client,
            provider,
            now,
        }
    }

    fn fund_request(f: &Fixture, actor: Actor, lease: Option<LeaseToken>) -> TransitionRequest {
        TransitionRequest {
            milestone_id: f.id,
            expected: MilestoneStatus::Pending,
            transition: Transition::Fund {
                external_payment_id: ExternalPaymentId::new("ch_123").unwrap(),
            },
            actor,
            lease,
            at: f.now,
            dispute_window: DisputeWindow::default(),
        }
    }

    fn attempt(f: &Fixture, status: FundingStatus) -> FundingAttempt {
        FundingAttempt {
            attempt: 0,
            gateway_key: f.key.clone(),
            instrument: PaymentInstrumentRef::new("pm_card_visa").unwrap(),
            status,
            updated_at: f.now,
        }
    }

    fn ttl() -> Duration {
        Duration::seconds(120)
    }

    #[tokio::test]
    async fn create_and_lookup_by_key() {
        let f = fixture().await;
        assert_eq!(f.ledger.len(), 1);
        assert_eq!(
            f.ledger.find_by_idempotency_key(&f.key).await.unwrap(),
            Some(f.id)
        );
        let entry = f.ledger.get(f.id).await.unwrap();
        assert_eq!(entry.milestone.status(), MilestoneStatus::Pending);
        assert_eq!(entry.version, 0);
    }

    #[tokio::test]
    async fn duplicate_key_rejected() {
        let f = fixture().await;
        let parties = CaseParties::new(CaseId::new(), UserId::new(), UserId::new()).unwrap();
        let other = Milestone::create(
            &parties,
            MilestoneDraft {
                title: "Other".into(),
                amount: Money::new(1, Currency::new("usd").unwrap()).unwrap(),
            },
            f.key.clone(),
            f.now,
        )
        .unwrap();
        assert!(matches!(
            f.ledger.create(other).await.unwrap_err(),
            LedgerError::DuplicateIdempotencyKey { .. }
        ));
    }

    #[tokio::test]
    async fn missing_milestone_is_not_found() {
        let f = fixture().await;
        let missing = MilestoneId::new();
        assert_eq!(
            f.ledger.get(missing).await.unwrap_err(),
            LedgerError::NotFound {
                milestone_id: missing
            }
        );
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_expiry() {
        let f = fixture().await;
        let first = f
            .ledger
            .acquire_lease(f.id, LeaseOperation::Fund, f.now, ttl())
            .await
            .unwrap();
        let err = f
            .ledger
            .acquire_lease(f.id, LeaseOperation::Fund, f.now, ttl())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::LeaseHeld { .. }));

        let later = f.now.saturating_add(ttl());
        let second = f
            .ledger
            .acquire_lease(f.id, LeaseOperation::Reconcile, later, ttl())
            .await
            .unwrap();
        assert_ne!(first.token, second.token);

        // The superseded holder can no longer write bookkeeping.
        let err = f
            .ledger
            .record_funding_attempt(f.id, first.token, attempt(&f, FundingStatus::Unresolved))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::LeaseLost { .. }));
    }

    #[tokio::test]
    async fn transition_settles_attempt_and_clears_lease() {
        let f = fixture().await;
        let lease = f
            .ledger
            .acquire_lease(f.id, LeaseOperation::Fund, f.now, ttl())
            .await
            .unwrap();
        f.ledger
            .record_funding_attempt(f.id, lease.token, attempt(&f, FundingStatus::Unresolved))
            .await
            .unwrap();

        let done = f
            .ledger
            .transition(fund_request(&f, Actor::Party(f.client), Some(lease.token)))
            .await
            .unwrap();
        assert_eq!(done.entry.milestone.status(), MilestoneStatus::Funded);
        assert!(done.entry.lease.is_none());
        assert!(matches!(
            done.entry.latest_funding_attempt().unwrap().status,
            FundingStatus::Succeeded { .. }
        ));
        assert!(matches!(done.event.kind, MilestoneEventKind::Funded { .. }));
    }

    #[tokio::test]
    async fn live_lease_blocks_other_writers() {
        let f = fixture().await;
        f.ledger
            .acquire_lease(f.id, LeaseOperation::Fund, f.now, ttl())
            .await
            .unwrap();
        let err = f
            .ledger
            .transition(fund_request(&f, Actor::Party(f.client), None))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::LeaseHeld { .. }));
    }

    #[tokio::test]
    async fn stale_expectation_is_a_conflict() {
        let f = fixture().await;
        f.ledger
            .transition(fund_request(&f, Actor::Party(f.client), None))
            .await
            .unwrap();
        let err = f
            .ledger
            .transition(fund_request(&f, Actor::Party(f.client), None))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::ConflictingTransition {
                milestone_id: f.id,
                expected: MilestoneStatus::Pending,
                actual: MilestoneStatus::Funded,
            }
        );
    }

    #[tokio::test]
    async fn stale_view_conflicts_but_illegal_edge_is_invalid() {
        let f = fixture().await;
        let err = f
            .ledger
            .transition(TransitionRequest {
                expected: MilestoneStatus::Funded,
                transition: Transition::Complete,
                ..fund_request(&f, Actor::Party(f.provider), None)
            })
            .await
            .unwrap_err();
        // Pending → Completed is not an edge; the caller's stale view
        // (Funded) would have allowed it, so this is a conflict.
        assert!(matches!(err, LedgerError::ConflictingTransition { .. }));

        let err = f
            .ledger
            .transition(TransitionRequest {
                expected: MilestoneStatus::Completed,
                transition: Transition::Complete,
                ..fund_request(&f, Actor::Party(f.provider), None)
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Transition(TransitionError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn gateway_needs_a_recorded_attempt() {
        let f = fixture().await;
        let err = f
            .ledger
            .transition(fund_request(&f, Actor::Gateway, None))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Transition(TransitionError::Forbidden { .. })
        ));

        let lease = f
            .ledger
            .acquire_lease(f.id, LeaseOperation::Fund, f.now, ttl())
            .await
            .unwrap();
        f.ledger
            .record_funding_attempt(f.id, lease.token, attempt(&f, FundingStatus::Unresolved))
            .await
            .unwrap();
        f.ledger.release_lease(f.id, lease.token).await.unwrap();
        f.ledger
            .transition(fund_request(&f, Actor::Gateway, None))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dispute_waits_for_an_unresolved_payout() {
        let f = fixture().await;
        f.ledger
            .transition(fund_request(&f, Actor::Party(f.client), None))
            .await
            .unwrap();
        f.ledger
            .transition(TransitionRequest {
                expected: MilestoneStatus::Funded,
                transition: Transition::Complete,
                ..fund_request(&f, Actor::Party(f.provider), None)
            })
            .await
            .unwrap();

        let lease = f
            .ledger
            .acquire_lease(f.id, LeaseOperation::Release, f.now, ttl())
            .await
            .unwrap();
        let transfer = ReleaseTransfer {
            split: FeeSplit::compute(5_000, FeeRate::DEFAULT),
            destination: DestinationAccountRef::new("acct_1").unwrap(),
            transfer_group: TransferGroup::for_milestone(&f.id),
            attempt: 0,
            status: TransferStatus::Unresolved,
            updated_at: f.now,
        };
        f.ledger
            .record_release_transfer(f.id, lease.token, transfer.clone())
            .await
            .unwrap();
        f.ledger.release_lease(f.id, lease.token).await.unwrap();

        let dispute = |f: &Fixture| TransitionRequest {
            expected: MilestoneStatus::Completed,
            transition: Transition::Dispute {
                dispute: Dispute::file(f.id, Role::Client, f.client.user(), "not delivered", "", f.now)
                    .unwrap(),
            },
            ..fund_request(f, Actor::Party(f.client), None)
        };
        let err = f.ledger.transition(dispute(&f)).await.unwrap_err();
        assert_eq!(err, LedgerError::PayoutUnresolved { milestone_id: f.id });
        let entry = f.ledger.get(f.id).await.unwrap();
        assert_eq!(entry.milestone.status(), MilestoneStatus::Completed);
        assert!(entry.dispute.is_none());

        // Once the gateway has answered, the dispute goes through.
        let lease = f
            .ledger
            .acquire_lease(f.id, LeaseOperation::Reconcile, f.now, ttl())
            .await
            .unwrap();
        f.ledger
            .record_release_transfer(
                f.id,
                lease.token,
                ReleaseTransfer {
                    status: TransferStatus::Failed {
                        reason: "account_closed".into(),
                    },
                    ..transfer
                },
            )
            .await
            .unwrap();
        f.ledger.release_lease(f.id, lease.token).await.unwrap();
        let done = f.ledger.transition(dispute(&f)).await.unwrap();
        assert_eq!(done.entry.milestone.status(), MilestoneStatus::Disputed);
    }

    #[tokio::test]
    async fn outbox_preserves_order_until_acknowledged() {
        let f = fixture().await;
        f.ledger
            .transition(fund_request(&f, Actor::Party(f.client), None))
            .await
            .unwrap();
        f.ledger
            .transition(TransitionRequest {
                expected: MilestoneStatus::Funded,
                transition: Transition::Complete,
                ..fund_request(&f, Actor::Party(f.provider), None)
            })
            .await
            .unwrap();

        let pending = f.ledger.pending_events(10).await.unwrap();
        let names: Vec<_> = pending.iter().map(|e| e.event.name()).collect();
        assert_eq!(names, ["MilestoneFunded", "MilestoneCompleted"]);
        assert!(pending[0].sequence < pending[1].sequence);

        f.ledger.acknowledge(pending[0].sequence).await.unwrap();
        let rest = f.ledger.pending_events(10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].event.name(), "MilestoneCompleted");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_identical_transitions_have_one_winner() {
        let f = Arc::new(fixture().await);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let f = Arc::clone(&f);
            handles.push(tokio::spawn(async move {
                f.ledger
                    .transition(fund_request(&f, Actor::Party(f.client), None))
                    .await
            }));
        }
        let mut wins = 0;
        let mut conflicts = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => wins += 1,
                Err(LedgerError::ConflictingTransition { .. }) => conflicts += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!((wins, conflicts), (1, 15));
        assert_eq!(f.ledger.pending_events(100).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn directory_first_writer_wins() {
        let dir = InMemoryDestinationDirectory::new();
        let provider = UserId::new();
        assert!(dir.get(provider).await.unwrap().is_none());
        let a = DestinationAccountRef::new("acct_a").unwrap();
        let b = DestinationAccountRef::new("acct_b").unwrap();
        assert_eq!(dir.put_if_absent(provider, a.clone()).await.unwrap(), a);
        assert_eq!(dir.put_if_absent(provider, b).await.unwrap(), a);
        assert_eq!(dir.get(provider).await.unwrap(), Some(a));
    }
}
