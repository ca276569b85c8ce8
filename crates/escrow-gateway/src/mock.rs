//! # Mock Payment Gateway
//!
//! Deterministic in-process gateway for tests and local development. It is
//! idempotent exactly like a real gateway: one charge and one transfer
//! outcome per idempotency key (a declined transfer stays declined for its
//! key), one successful transfer per transfer group, one account per
//! provider.
//!
//! Instrument conventions:
//! - `pm_card_declined` is declined.
//! - `pm_card_challenge` requires strong authentication until
//!   [`MockGateway::complete_challenge`] is called for the key.
//! - Every other instrument succeeds.
//!
//! Faults can be queued per operation to simulate lost requests, lost
//! responses, and outages.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use escrow_core::{
    DestinationAccountRef, ExternalPaymentId, IdempotencyKey, TransferGroup, TransferId, UserId,
};

use crate::error::GatewayError;
use crate::gateway::PaymentGateway;
use crate::types::{ChallengePayload, ChargeOutcome, ChargeRequest, TransferOutcome, TransferRequest};

/// Instrument the mock always declines.
pub const DECLINED_INSTRUMENT: &str = "pm_card_declined";

/// Instrument the mock challenges until authenticated.
pub const CHALLENGE_INSTRUMENT: &str = "pm_card_challenge";

/// Gateway operation a fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    /// [`PaymentGateway::charge`].
    Charge,
    /// [`PaymentGateway::query_charge`].
    QueryCharge,
    /// [`PaymentGateway::ensure_destination_account`].
    EnsureDestination,
    /// [`PaymentGateway::transfer`].
    Transfer,
    /// [`PaymentGateway::query_transfer`].
    QueryTransfer,
}

impl MockOperation {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Charge => "charge",
            Self::QueryCharge => "query_charge",
            Self::EnsureDestination => "ensure_destination_account",
            Self::Transfer => "transfer",
            Self::QueryTransfer => "query_transfer",
        }
    }
}

/// A failure injected into the next call of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFault {
    /// The request never reaches the gateway.
    LostRequest,
    /// The gateway executes the request but the response is lost.
    LostResponse,
    /// The gateway answers 503 without executing the request.
    Unavailable,
    /// The gateway definitively declines (charge or transfer only).
    Decline(String),
}

#[derive(Debug, Default)]
struct MockState {
    charges: HashMap<IdempotencyKey, ChargeOutcome>,
    authenticated: HashSet<IdempotencyKey>,
    accounts: HashMap<UserId, DestinationAccountRef>,
    transfers: HashMap<IdempotencyKey, TransferOutcome>,
    paid_groups: HashMap<TransferGroup, TransferOutcome>,
    transferred: HashMap<TransferGroup, u64>,
    faults: HashMap<MockOperation, VecDeque<MockFault>>,
    next_id: u64,
    charges_created: u64,
    charge_calls: u64,
    transfers_created: u64,
    transfer_calls: u64,
    accounts_created: u64,
}

impl MockState {
    fn mint(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}_mock_{:06}", self.next_id)
    }

    fn take_fault(&mut self, op: MockOperation) -> Option<MockFault> {
        self.faults.get_mut(&op).and_then(VecDeque::pop_front)
    }

    /// Promote a challenged charge whose challenge has been completed.
    fn settle_challenge(&mut self, key: &IdempotencyKey) -> Option<ChargeOutcome> {
        let needs_promotion = matches!(
            self.charges.get(key),
            Some(ChargeOutcome::RequiresChallenge { .. })
        ) && self.authenticated.contains(key);
        if needs_promotion {
            let id = self.mint("ch");
            let outcome = ChargeOutcome::Succeeded {
                external_payment_id: ExternalPaymentId::new(id).ok()?,
            };
            self.charges.insert(key.clone(), outcome);
        }
        self.charges.get(key).cloned()
    }
}

fn fault_error(op: MockOperation, fault: &MockFault) -> GatewayError {
    match fault {
        MockFault::LostRequest => GatewayError::Transport {
            operation: op.as_str().to_string(),
            reason: "connection refused".into(),
        },
        MockFault::LostResponse => GatewayError::Transport {
            operation: op.as_str().to_string(),
            reason: "connection reset after request was sent".into(),
        },
        MockFault::Unavailable => GatewayError::ServerError {
            operation: op.as_str().to_string(),
            status: 503,
            body: "service unavailable".into(),
        },
        MockFault::Decline(reason) => GatewayError::Rejected {
            operation: op.as_str().to_string(),
            status: 402,
            body: reason.clone(),
        },
    }
}

/// Deterministic in-memory [`PaymentGateway`].
#[derive(Debug, Default)]
pub struct MockGateway {
    state: Mutex<MockState>,
    delay: Mutex<Option<Duration>>,
}

impl MockGateway {
    /// A gateway with no faults and no delay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a fault for the next call of `op`.
    pub fn inject_fault(&self, op: MockOperation, fault: MockFault) {
        self.state
            .lock()
            .faults
            .entry(op)
            .or_default()
            .push_back(fault);
    }

    /// Delay every charge and transfer by `delay` before it executes.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Mark the client's strong authentication for `key` as completed.
    pub fn complete_challenge(&self, key: &IdempotencyKey) {
        self.state.lock().authenticated.insert(key.clone());
    }

    /// Distinct charges the gateway has created.
    pub fn charges_created(&self) -> u64 {
        self.state.lock().charges_created
    }

    /// Total charge calls received, including replays and faults.
    pub fn charge_calls(&self) -> u64 {
        self.state.lock().charge_calls
    }

    /// Distinct successful transfers executed.
    pub fn transfers_created(&self) -> u64 {
        self.state.lock().transfers_created
    }

    /// Total transfer calls received, including replays and faults.
    pub fn transfer_calls(&self) -> u64 {
        self.state.lock().transfer_calls
    }

    /// Destination accounts provisioned.
    pub fn accounts_created(&self) -> u64 {
        self.state.lock().accounts_created
    }

    /// The gateway's view of the charge under `key`.
    pub fn charge_outcome(&self, key: &IdempotencyKey) -> Option<ChargeOutcome> {
        self.state.lock().charges.get(key).cloned()
    }

    /// The successful transfer for `group`, if any attempt paid out.
    pub fn transfer_outcome(&self, group: &TransferGroup) -> Option<TransferOutcome> {
        self.state.lock().paid_groups.get(group).cloned()
    }

    /// Minor units actually moved for `group`.
    pub fn transferred_amount(&self, group: &TransferGroup) -> Option<u64> {
        self.state.lock().transferred.get(group).copied()
    }

    async fn pause(&self) {
        let delay = *self.delay.lock();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, GatewayError> {
        const OP: MockOperation = MockOperation::Charge;
        self.pause().await;
        let mut state = self.state.lock();
        state.charge_calls += 1;
        let fault = state.take_fault(OP);
        match &fault {
            Some(f @ (MockFault::LostRequest | MockFault::Unavailable)) => {
                return Err(fault_error(OP, f))
            }
            Some(f @ MockFault::Decline(_)) => return Err(fault_error(OP, f)),
            _ => {}
        }

        let key = &request.idempotency_key;
        let outcome = match state.settle_challenge(key) {
            Some(existing) => existing,
            None => {
                let outcome = match request.instrument.as_str() {
                    DECLINED_INSTRUMENT => ChargeOutcome::Failed {
                        reason: "card_declined".into(),
                    },
                    CHALLENGE_INSTRUMENT if !state.authenticated.contains(key) => {
                        ChargeOutcome::RequiresChallenge {
                            challenge: ChallengePayload(serde_json::json!({
                                "type": "three_d_secure",
                                "redirect_url": format!("https://gateway.test/3ds/{}", key.as_str()),
                            })),
                        }
                    }
                    _ => {
                        let id = state.mint("ch");
                        ChargeOutcome::Succeeded {
                            external_payment_id: ExternalPaymentId::new(id).map_err(|e| {
                                GatewayError::Deserialization {
                                    operation: OP.as_str().into(),
                                    reason: e.to_string(),
                                }
                            })?,
                        }
                    }
                };
                state.charges_created += 1;
                state.charges.insert(key.clone(), outcome.clone());
                outcome
            }
        };

        if let Some(f @ MockFault::LostResponse) = &fault {
            return Err(fault_error(OP, f));
        }
        Ok(outcome)
    }

    async fn query_charge(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<ChargeOutcome>, GatewayError> {
        const OP: MockOperation = MockOperation::QueryCharge;
        let mut state = self.state.lock();
        if let Some(f) = state.take_fault(OP) {
            return Err(fault_error(OP, &f));
        }
        Ok(state.settle_challenge(key))
    }

    async fn ensure_destination_account(
        &self,
        provider: UserId,
    ) -> Result<DestinationAccountRef, GatewayError> {
        const OP: MockOperation = MockOperation::EnsureDestination;
        let mut state = self.state.lock();
        let fault = state.take_fault(OP);
        if let Some(f @ (MockFault::LostRequest | MockFault::Unavailable | MockFault::Decline(_))) =
            &fault
        {
            return Err(fault_error(OP, f));
        }
        let account = match state.accounts.get(&provider) {
            Some(existing) => existing.clone(),
            None => {
                let id = state.mint("acct");
                let account = DestinationAccountRef::new(id).map_err(|e| {
                    GatewayError::Deserialization {
                        operation: OP.as_str().into(),
                        reason: e.to_string(),
                    }
                })?;
                state.accounts_created += 1;
                state.accounts.insert(provider, account.clone());
                account
            }
        };
        if let Some(f @ MockFault::LostResponse) = &fault {
            return Err(fault_error(OP, f));
        }
        Ok(account)
    }

    async fn transfer(&self, request: &TransferRequest) -> Result<TransferOutcome, GatewayError> {
        const OP: MockOperation = MockOperation::Transfer;
        self.pause().await;
        let mut state = self.state.lock();
        state.transfer_calls += 1;
        let fault = state.take_fault(OP);
        if let Some(f @ (MockFault::LostRequest | MockFault::Unavailable)) = &fault {
            return Err(fault_error(OP, f));
        }

        let key = &request.idempotency_key;
        let outcome = match state.transfers.get(key) {
            Some(existing) => existing.clone(),
            None => {
                let paid = state.paid_groups.get(&request.transfer_group).cloned();
                let outcome = match (&fault, paid) {
                    (Some(MockFault::Decline(reason)), _) => TransferOutcome::Failed {
                        reason: reason.clone(),
                    },
                    (_, Some(paid)) => paid,
                    _ if request.amount == 0 => {
                        return Err(GatewayError::Rejected {
                            operation: OP.as_str().into(),
                            status: 400,
                            body: "amount must be positive".into(),
                        })
                    }
                    _ => {
                        let id = state.mint("tr");
                        let paid = TransferOutcome::Succeeded {
                            transfer_id: TransferId::new(id).map_err(|e| {
                                GatewayError::Deserialization {
                                    operation: OP.as_str().into(),
                                    reason: e.to_string(),
                                }
                            })?,
                        };
                        state.transfers_created += 1;
                        state
                            .transferred
                            .insert(request.transfer_group.clone(), request.amount);
                        state
                            .paid_groups
                            .insert(request.transfer_group.clone(), paid.clone());
                        paid
                    }
                };
                state.transfers.insert(key.clone(), outcome.clone());
                outcome
            }
        };

        if let Some(f @ MockFault::LostResponse) = &fault {
            return Err(fault_error(OP, f));
        }
        Ok(outcome)
    }

    async fn query_transfer(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<TransferOutcome>, GatewayError> {
        const OP: MockOperation = MockOperation::QueryTransfer;
        let mut state = self.state.lock();
        if let Some(f) = state.take_fault(OP) {
            return Err(fault_error(OP, &f));
        }
        Ok(state.transfers.get(key).cloned())
    }

    fn gateway_name(&self) -> &str {
        "mock"
    }
}
