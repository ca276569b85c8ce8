//! # HTTP Payment Gateway Adapter
//!
//! Wraps a `reqwest::Client` with the gateway base URL and bearer
//! authentication, and maps HTTP responses onto [`ChargeOutcome`] and
//! [`TransferOutcome`].
//!
//! ## Error Handling
//!
//! - Connection failures and lost responses map to
//!   [`GatewayError::Transport`], timeouts to [`GatewayError::Timeout`],
//!   5xx to [`GatewayError::ServerError`]. All are ambiguous.
//! - 4xx responses map to [`GatewayError::Rejected`] (definitive).
//! - A 2xx body that fails to decode maps to
//!   [`GatewayError::Deserialization`], which is ambiguous because the
//!   gateway did act on the request.
//!
//! ## Retry
//!
//! Charges, transfers and account provisioning are POSTed once with an
//! `Idempotency-Key` header. Only the outcome queries are retried on
//! transport failure, as configured by [`GatewayConfig::query_retry`].

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use escrow_core::{DestinationAccountRef, ExternalPaymentId, IdempotencyKey, TransferId, UserId};

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::gateway::PaymentGateway;
use crate::retry::{retry_send, RetryPolicy};
use crate::types::{ChallengePayload, ChargeOutcome, ChargeRequest, TransferOutcome, TransferRequest};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum ChargeWire {
    Succeeded { id: String },
    RequiresChallenge { challenge: serde_json::Value },
    Failed { reason: String },
}

impl ChargeWire {
    fn into_outcome(self, operation: &str) -> Result<ChargeOutcome, GatewayError> {
        Ok(match self {
            Self::Succeeded { id } => ChargeOutcome::Succeeded {
                external_payment_id: ExternalPaymentId::new(id)
                    .map_err(|e| decode_error(operation, e))?,
            },
            Self::RequiresChallenge { challenge } => ChargeOutcome::RequiresChallenge {
                challenge: ChallengePayload(challenge),
            },
            Self::Failed { reason } => ChargeOutcome::Failed { reason },
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum TransferWire {
    Succeeded { id: String },
    Failed { reason: String },
}

impl TransferWire {
    fn into_outcome(self, operation: &str) -> Result<TransferOutcome, GatewayError> {
        Ok(match self {
            Self::Succeeded { id } => TransferOutcome::Succeeded {
                transfer_id: TransferId::new(id).map_err(|e| decode_error(operation, e))?,
            },
            Self::Failed { reason } => TransferOutcome::Failed { reason },
        })
    }
}

#[derive(Debug, Deserialize)]
struct AccountWire {
    id: String,
}

fn decode_error(operation: &str, e: impl std::fmt::Display) -> GatewayError {
    GatewayError::Deserialization {
        operation: operation.to_string(),
        reason: e.to_string(),
    }
}

// ── Adapter ─────────────────────────────────────────────────────────

/// Real HTTP client for the payment gateway.
#[derive(Debug)]
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: Url,
    timeout_ms: u64,
    query_retry: RetryPolicy,
}

impl HttpPaymentGateway {
    /// Create a new adapter from configuration.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    reqwest::header::HeaderValue::from_str(&format!(
                        "Bearer {}",
                        config.api_key.as_str()
                    ))
                    .map_err(|_| GatewayError::NotConfigured {
                        reason: "invalid API key characters".into(),
                    })?,
                );
                headers.insert(
                    reqwest::header::CONTENT_TYPE,
                    reqwest::header::HeaderValue::from_static("application/json"),
                );
                headers
            })
            .build()
            .map_err(|e| GatewayError::NotConfigured {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url,
            timeout_ms: config.timeout_secs.saturating_mul(1_000),
            query_retry: config.query_retry,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, GatewayError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| GatewayError::NotConfigured {
                reason: format!("base URL {} cannot carry a path", self.base_url),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn send_error(&self, operation: &str, e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout {
                operation: operation.to_string(),
                elapsed_ms: self.timeout_ms,
            }
        } else {
            GatewayError::Transport {
                operation: operation.to_string(),
                reason: e.to_string(),
            }
        }
    }

    /// Map non-2xx statuses onto the error taxonomy.
    async fn check(
        &self,
        resp: reqwest::Response,
        operation: &str,
    ) -> Result<reqwest::Response, GatewayError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        if status.is_server_error() {
            Err(GatewayError::ServerError {
                operation: operation.to_string(),
                status: status.as_u16(),
                body,
            })
        } else {
            Err(GatewayError::Rejected {
                operation: operation.to_string(),
                status: status.as_u16(),
                body,
            })
        }
    }

    async fn decode<T: DeserializeOwned>(
        resp: reqwest::Response,
        operation: &str,
    ) -> Result<T, GatewayError> {
        resp.json::<T>()
            .await
            .map_err(|e| decode_error(operation, e))
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, GatewayError> {
        const OP: &str = "charge";
        let url = self.endpoint(&["v1", "charges"])?;
        let body = serde_json::json!({
            "amount": request.amount.amount(),
            "currency": request.amount.currency().as_str(),
            "payment_instrument": request.instrument.as_str(),
            "metadata": { "milestone_id": request.milestone_id.as_uuid().to_string() },
        });
        let resp = self
            .client
            .post(url)
            .header(IDEMPOTENCY_HEADER, request.idempotency_key.as_str())
            .json(&body)
            .send()
            .await
            .map_err(|e| self.send_error(OP, e))?;
        let resp = self.check(resp, OP).await?;
        Self::decode::<ChargeWire>(resp, OP)
            .await?
            .into_outcome(OP)
    }

    async fn query_charge(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<ChargeOutcome>, GatewayError> {
        const OP: &str = "query_charge";
        let url = self.endpoint(&["v1", "charges", "by-idempotency-key", key.as_str()])?;
        let resp = retry_send(&self.query_retry, || self.client.get(url.clone()).send())
            .await
            .map_err(|e| self.send_error(OP, e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = self.check(resp, OP).await?;
        Self::decode::<ChargeWire>(resp, OP)
            .await?
            .into_outcome(OP)
            .map(Some)
    }

    async fn ensure_destination_account(
        &self,
        provider: UserId,
    ) -> Result<DestinationAccountRef, GatewayError> {
        const OP: &str = "ensure_destination_account";
        let url = self.endpoint(&["v1", "destination-accounts"])?;
        let provider_ref = provider.as_uuid().simple().to_string();
        let resp = self
            .client
            .post(url)
            .header(IDEMPOTENCY_HEADER, format!("dest_{provider_ref}"))
            .json(&serde_json::json!({ "provider_ref": provider_ref }))
            .send()
            .await
            .map_err(|e| self.send_error(OP, e))?;
        let resp = self.check(resp, OP).await?;
        let account: AccountWire = Self::decode(resp, OP).await?;
        DestinationAccountRef::new(account.id).map_err(|e| decode_error(OP, e))
    }

    async fn transfer(&self, request: &TransferRequest) -> Result<TransferOutcome, GatewayError> {
        const OP: &str = "transfer";
        let url = self.endpoint(&["v1", "transfers"])?;
        let body = serde_json::json!({
            "source_charge": request.source_charge.as_str(),
            "destination": request.destination.as_str(),
            "amount": request.amount,
            "currency": request.currency.as_str(),
            "transfer_group": request.transfer_group.as_str(),
        });
        let resp = self
            .client
            .post(url)
            .header(IDEMPOTENCY_HEADER, request.idempotency_key.as_str())
            .json(&body)
            .send()
            .await
            .map_err(|e| self.send_error(OP, e))?;
        let resp = self.check(resp, OP).await?;
        Self::decode::<TransferWire>(resp, OP)
            .await?
            .into_outcome(OP)
    }

    async fn query_transfer(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<TransferOutcome>, GatewayError> {
        const OP: &str = "query_transfer";
        let url = self.endpoint(&["v1", "transfers", "by-idempotency-key", key.as_str()])?;
        let resp = retry_send(&self.query_retry, || self.client.get(url.clone()).send())
            .await
            .map_err(|e| self.send_error(OP, e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = self.check(resp, OP).await?;
        Self::decode::<TransferWire>(resp, OP)
            .await?
            .into_outcome(OP)
            .map(Some)
    }

    fn gateway_name(&self) -> &str {
        "http"
    }
}
