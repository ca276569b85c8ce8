//! # PaymentGateway Capability
//!
//! The escrow engine talks to the external money-movement provider only
//! through this trait. Implementations must be idempotent on the keys they
//! are given: a charge or transfer repeated with the same idempotency key
//! has at most one financial effect, and a definitive failure is replayed
//! for that key rather than retried.

use async_trait::async_trait;

use escrow_core::{DestinationAccountRef, IdempotencyKey, UserId};

use crate::error::GatewayError;
use crate::types::{ChargeOutcome, ChargeRequest, TransferOutcome, TransferRequest};

/// External payment gateway.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create (or replay) a charge.
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, GatewayError>;

    /// Outcome of the charge made under `key`, or `None` if the gateway
    /// never saw one.
    async fn query_charge(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<ChargeOutcome>, GatewayError>;

    /// The provider's payable account, provisioned on first call.
    async fn ensure_destination_account(
        &self,
        provider: UserId,
    ) -> Result<DestinationAccountRef, GatewayError>;

    /// Create (or replay) the transfer made under the request's key.
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferOutcome, GatewayError>;

    /// Outcome of the transfer made under `key`, or `None` if the gateway
    /// never saw one.
    async fn query_transfer(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<TransferOutcome>, GatewayError>;

    /// Human-readable name of the implementation.
    fn gateway_name(&self) -> &str;
}
