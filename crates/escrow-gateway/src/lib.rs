//! # escrow-gateway — Payment Gateway Capability
//!
//! The escrow engine moves money only through [`PaymentGateway`]: charging
//! the client's instrument, provisioning the provider's payable account,
//! transferring the provider's share, and querying the outcome of any of
//! those after an ambiguous failure.
//!
//! ## Implementations
//!
//! - [`HttpPaymentGateway`]: `reqwest` adapter for a real gateway API,
//!   configured by [`GatewayConfig`].
//! - [`MockGateway`]: deterministic in-memory gateway with fault injection,
//!   used by tests and local runs.
//!
//! ## Ambiguity
//!
//! Every call returns a [`GatewayError`] on failure, classified by
//! [`GatewayError::is_ambiguous`]. An ambiguous failure means the gateway
//! may have acted; callers resolve it with `query_charge` or
//! `query_transfer` instead of assuming failure.

pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod mock;
pub mod retry;
pub mod types;

pub use config::{ConfigError, GatewayConfig};
pub use error::GatewayError;
pub use gateway::PaymentGateway;
pub use http::HttpPaymentGateway;
pub use mock::{MockFault, MockGateway, MockOperation, CHALLENGE_INSTRUMENT, DECLINED_INSTRUMENT};
pub use retry::RetryPolicy;
pub use types::{ChallengePayload, ChargeOutcome, ChargeRequest, TransferOutcome, TransferRequest};
