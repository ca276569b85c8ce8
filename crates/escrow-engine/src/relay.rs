//! # Event Relay
//!
//! Drains the ledger's transactional outbox into the audit and
//! notification sinks. Transitions never call a sink inline, so a sink
//! outage cannot block or fail a financial transition.
//!
//! ## Delivery rules
//!
//! - [`AuditSink::record`] must succeed before an outbox entry is
//!   acknowledged. On failure the drain stops, leaving that entry and
//!   everything after it for the next drain, so audit order matches
//!   commit order.
//! - [`Notifier::notify`] is spawned once per recipient after the audit
//!   write. Its failures are logged and otherwise ignored.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use thiserror::Error;

use escrow_core::{MilestoneId, UserId};
use escrow_ledger::{Ledger, OutboxEntry};
use escrow_state::MilestoneEvent;

use crate::error::EscrowError;
use crate::telemetry;

/// Hash preceding the first audit record.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Errors reported by sinks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The sink could not accept the event.
    #[error("{sink} unavailable: {reason}")]
    Unavailable {
        /// Sink name.
        sink: &'static str,
        /// Underlying failure.
        reason: String,
    },
    /// The event could not be encoded for the sink.
    #[error("failed to encode event for {sink}: {reason}")]
    Encoding {
        /// Sink name.
        sink: &'static str,
        /// Encoder error.
        reason: String,
    },
}

/// Append-only audit trail.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Durably record an outbox entry. Recording the same sequence twice
    /// must not create a second record.
    async fn record(&self, entry: &OutboxEntry) -> Result<(), SinkError>;
}

/// User-facing notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Tell `user` about an event.
    async fn notify(
        &self,
        user: UserId,
        event_kind: &str,
        payload: &serde_json::Value,
    ) -> Result<(), SinkError>;
}

// ── Relay ───────────────────────────────────────────────────────────

/// Result of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    /// Entries audited and acknowledged.
    pub audited: usize,
    /// Notifications dispatched.
    pub notifications: usize,
    /// Whether the drain stopped at an entry the audit sink refused.
    pub stalled: bool,
}

/// Moves outbox entries to the sinks.
pub struct EventRelay {
    ledger: Arc<dyn Ledger>,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn Notifier>,
    batch_size: usize,
}

impl std::fmt::Debug for EventRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRelay")
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl EventRelay {
    /// Default number of entries read per drain.
    pub const DEFAULT_BATCH_SIZE: usize = 100;

    /// Build a relay over `ledger`'s outbox.
    pub fn new(
        ledger: Arc<dyn Ledger>,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            ledger,
            audit,
            notifier,
            batch_size: Self::DEFAULT_BATCH_SIZE,
        }
    }

    /// Override the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Relay one batch of pending events.
    pub async fn drain(&self) -> Result<RelayReport, EscrowError> {
        let pending = self.ledger.pending_events(self.batch_size).await?;
        let mut report = RelayReport::default();

        for entry in pending {
            if let Err(e) = self.audit.record(&entry).await {
                tracing::warn!(
                    sequence = entry.sequence,
                    milestone_id = %entry.event.milestone_id,
                    error = %e,
                    "audit sink refused event, relay will retry"
                );
                report.stalled = true;
                break;
            }
            telemetry::count_relayed("audit");
            self.ledger.acknowledge(entry.sequence).await?;
            report.audited += 1;
            report.notifications += self.dispatch_notifications(&entry.event);
        }

        Ok(report)
    }

    /// Drain until the outbox is empty or the audit sink stalls.
    pub async fn drain_all(&self) -> Result<RelayReport, EscrowError> {
        let mut total = RelayReport::default();
        loop {
            let report = self.drain().await?;
            total.audited += report.audited;
            total.notifications += report.notifications;
            if report.stalled || report.audited < self.batch_size {
                total.stalled = report.stalled;
                return Ok(total);
            }
        }
    }

    /// Drain on a fixed interval until `shutdown` flips to `true`.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.drain_all().await {
                        tracing::error!(error = %e, "event relay drain failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("event relay stopping");
                        return;
                    }
                }
            }
        }
    }

    fn dispatch_notifications(&self, event: &MilestoneEvent) -> usize {
        let payload = match serde_json::to_value(event) {
            Ok(p) => Arc::new(p),
            Err(e) => {
                tracing::error!(
                    milestone_id = %event.milestone_id,
                    error = %e,
                    "could not encode event for notification"
                );
                return 0;
            }
        };
        let kind = event.name();
        for &user in &event.recipients {
            let notifier = Arc::clone(&self.notifier);
            let payload = Arc::clone(&payload);
            let milestone_id = event.milestone_id;
            tokio::spawn(async move {
                match notifier.notify(user, kind, &payload).await {
                    Ok(()) => telemetry::count_relayed("notify"),
                    Err(e) => tracing::warn!(
                        %milestone_id,
                        %user,
                        event = kind,
                        error = %e,
                        "notification failed"
                    ),
                }
            });
        }
        event.recipients.len()
    }
}

// ── Audit sink ──────────────────────────────────────────────────────

/// One link in the audit hash chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    /// Outbox sequence the record came from.
    pub sequence: u64,
    /// Event name, e.g. "MilestoneReleased".
    pub event_name: String,
    /// The milestone concerned.
    pub milestone_id: MilestoneId,
    /// Serialized event.
    pub payload: serde_json::Value,
    /// Hash of the previous record, or [`GENESIS_HASH`].
    pub prev_hash: String,
    /// SHA-256 over `prev_hash` and the serialized payload, hex encoded.
    pub hash: String,
}

/// Where an audit chain failed verification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuditChainError {
    /// A record does not point at its predecessor.
    #[error("audit record {index} does not link to its predecessor")]
    BrokenLink {
        /// Position in the chain.
        index: usize,
    },
    /// A record's hash does not match its contents.
    #[error("audit record {index} hash mismatch")]
    HashMismatch {
        /// Position in the chain.
        index: usize,
    },
}

fn chain_hash(prev_hash: &str, payload: &serde_json::Value) -> Result<String, serde_json::Error> {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(serde_json::to_vec(payload)?);
    Ok(hasher.finalize().iter().map(|b| format!("{b:02x}")).collect())
}

#[derive(Debug, Default)]
struct AuditLog {
    records: Vec<AuditRecord>,
    unavailable: bool,
}

/// Hash-chained in-memory audit trail.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    log: Mutex<AuditLog>,
}

impl MemoryAuditSink {
    /// An empty audit trail.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while unavailable every `record` fails.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.log.lock().unavailable = unavailable;
    }

    /// Snapshot of the chain.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.log.lock().records.clone()
    }

    /// Recompute every link of the chain.
    pub fn verify(&self) -> Result<(), AuditChainError> {
        let log = self.log.lock();
        let mut prev = GENESIS_HASH.to_string();
        for (index, record) in log.records.iter().enumerate() {
            if record.prev_hash != prev {
                return Err(AuditChainError::BrokenLink { index });
            }
            let expected = chain_hash(&record.prev_hash, &record.payload)
                .map_err(|_| AuditChainError::HashMismatch { index })?;
            if record.hash != expected {
                return Err(AuditChainError::HashMismatch { index });
            }
            prev = record.hash.clone();
        }
        Ok(())
    }

    #[cfg(test)]
    fn tamper(&self, index: usize, payload: serde_json::Value) {
        self.log.lock().records[index].payload = payload;
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, entry: &OutboxEntry) -> Result<(), SinkError> {
        const SINK: &str = "memory audit";
        let payload = serde_json::to_value(&entry.event).map_err(|e| SinkError::Encoding {
            sink: SINK,
            reason: e.to_string(),
        })?;

        let mut log = self.log.lock();
        if log.unavailable {
            return Err(SinkError::Unavailable {
                sink: SINK,
                reason: "audit store offline".into(),
            });
        }
        if log.records.iter().any(|r| r.sequence == entry.sequence) {
            return Ok(());
        }
        let prev_hash = log
            .records
            .last()
            .map(|r| r.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let hash = chain_hash(&prev_hash, &payload).map_err(|e| SinkError::Encoding {
            sink: SINK,
            reason: e.to_string(),
        })?;
        log.records.push(AuditRecord {
            sequence: entry.sequence,
            event_name: entry.event.name().to_string(),
            milestone_id: entry.event.milestone_id,
            payload,
            prev_hash,
            hash,
        });
        Ok(())
    }
}

// ── Notifiers ───────────────────────────────────────────────────────

/// Notifier that writes each notification to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(
        &self,
        user: UserId,
        event_kind: &str,
        payload: &serde_json::Value,
    ) -> Result<(), SinkError> {
        tracing::info!(%user, event = event_kind, %payload, "notification");
        Ok(())
    }
}

/// A delivered notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Recipient.
    pub user: UserId,
    /// Event name.
    pub event_kind: String,
    /// Event payload.
    pub payload: serde_json::Value,
}

#[derive(Debug, Default)]
struct Inbox {
    deliveries: Vec<Delivery>,
    failing: bool,
}

/// Notifier that keeps deliveries in memory.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    inbox: Mutex<Inbox>,
}

impl MemoryNotifier {
    /// An empty inbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every delivery fail while `failing` is set.
    pub fn set_failing(&self, failing: bool) {
        self.inbox.lock().failing = failing;
    }

    /// Delivered notifications, in delivery order.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.inbox.lock().deliveries.clone()
    }

    /// Wait until at least `count` notifications arrived or `timeout`
    /// elapsed. Returns whether the count was reached.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.inbox.lock().deliveries.len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(
        &self,
        user: UserId,
        event_kind: &str,
        payload: &serde_json::Value,
    ) -> Result<(), SinkError> {
        let mut inbox = self.inbox.lock();
        if inbox.failing {
            return Err(SinkError::Unavailable {
                sink: "memory notifier",
                reason: "delivery refused".into(),
            });
        }
        inbox.deliveries.push(Delivery {
            user,
            event_kind: event_kind.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use escrow_core::{CaseId, Currency, ExternalPaymentId, Money, Timestamp};
    use escrow_state::MilestoneEventKind;

    fn entry(sequence: u64) -> OutboxEntry {
        OutboxEntry {
            sequence,
            event: MilestoneEvent {
                milestone_id: MilestoneId::new(),
                case_id: CaseId::new(),
                occurred_at: Timestamp::parse("2026-01-01T00:00:00Z").unwrap(),
                recipients: vec![UserId::new()],
                kind: MilestoneEventKind::Funded {
                    external_payment_id: ExternalPaymentId::new("ch_1").unwrap(),
                    amount: Money::new(500, Currency::new("usd").unwrap()).unwrap(),
                },
            },
        }
    }

    #[tokio::test]
    async fn audit_chain_links_and_verifies() {
        let sink = MemoryAuditSink::new();
        for seq in 1..=3 {
            sink.record(&entry(seq)).await.unwrap();
        }
        let records = sink.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].prev_hash, GENESIS_HASH);
        assert_eq!(records[1].prev_hash, records[0].hash);
        assert_eq!(records[0].event_name, "MilestoneFunded");
        sink.verify().unwrap();
    }

    #[tokio::test]
    async fn audit_record_is_idempotent_per_sequence() {
        let sink = MemoryAuditSink::new();
        let e = entry(7);
        sink.record(&e).await.unwrap();
        sink.record(&e).await.unwrap();
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn tampering_breaks_verification() {
        let sink = MemoryAuditSink::new();
        sink.record(&entry(1)).await.unwrap();
        sink.record(&entry(2)).await.unwrap();
        sink.tamper(0, serde_json::json!({ "forged": true }));
        assert_eq!(
            sink.verify(),
            Err(AuditChainError::HashMismatch { index: 0 })
        );
    }

    #[tokio::test]
    async fn unavailable_audit_sink_refuses() {
        let sink = MemoryAuditSink::new();
        sink.set_unavailable(true);
        assert!(sink.record(&entry(1)).await.is_err());
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn memory_notifier_records_and_fails_on_demand() {
        let notifier = MemoryNotifier::new();
        let user = UserId::new();
        notifier
            .notify(user, "MilestoneFunded", &serde_json::json!({}))
            .await
            .unwrap();
        notifier.set_failing(true);
        assert!(notifier
            .notify(user, "MilestoneFunded", &serde_json::json!({}))
            .await
            .is_err());
        assert_eq!(notifier.deliveries().len(), 1);
        assert!(notifier.wait_for(1, Duration::from_millis(10)).await);
    }
}
