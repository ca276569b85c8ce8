//! Payment gateway client configuration.
//!
//! Loaded from the environment in deployments, or constructed directly in
//! tests that point the adapter at a local mock server.

use std::time::Duration;

use url::Url;
use zeroize::Zeroizing;

use crate::retry::RetryPolicy;

/// Default request timeout.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Configuration for [`HttpPaymentGateway`](crate::HttpPaymentGateway).
///
/// Custom `Debug` implementation redacts the `api_key` field to prevent
/// credential leakage in log output.
#[derive(Clone)]
pub struct GatewayConfig {
    /// Base URL of the gateway API.
    pub base_url: Url,
    /// Bearer token for API authentication. Zeroized on drop.
    pub api_key: Zeroizing<String>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Resend policy for outcome queries.
    pub query_retry: RetryPolicy,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("timeout_secs", &self.timeout_secs)
            .field("query_retry", &self.query_retry)
            .finish()
    }
}

impl GatewayConfig {
    /// Build a configuration with the default timeout.
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: parse_url("base_url", base_url)?,
            api_key: Zeroizing::new(api_key.into()),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            query_retry: RetryPolicy::default(),
        })
    }

    /// Load configuration from environment variables.
    ///
    /// Variables:
    /// - `GATEWAY_BASE_URL` (required)
    /// - `GATEWAY_API_KEY` (required)
    /// - `GATEWAY_TIMEOUT_SECS` (default: 30)
    /// - `GATEWAY_QUERY_RETRIES` (default: 3)
    /// - `GATEWAY_QUERY_RETRY_BASE_MS` (default: 200)
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url =
            std::env::var("GATEWAY_BASE_URL").map_err(|_| ConfigError::Missing("GATEWAY_BASE_URL"))?;
        let api_key = Zeroizing::new(
            std::env::var("GATEWAY_API_KEY").map_err(|_| ConfigError::Missing("GATEWAY_API_KEY"))?,
        );
        let timeout_secs = env_number("GATEWAY_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?;
        let query_retry = RetryPolicy {
            retries: env_number("GATEWAY_QUERY_RETRIES", RetryPolicy::DEFAULT_RETRIES)?,
            base_delay: Duration::from_millis(env_number(
                "GATEWAY_QUERY_RETRY_BASE_MS",
                RetryPolicy::DEFAULT_BASE_DELAY_MS,
            )?),
        };
        Ok(Self {
            base_url: parse_url("GATEWAY_BASE_URL", &base_url)?,
            api_key,
            timeout_secs,
            query_retry,
        })
    }
}

fn env_number<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var, value: raw }),
        Err(_) => Ok(default),
    }
}

fn parse_url(name: &str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|e| ConfigError::InvalidUrl(name.to_string(), e.to_string()))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is unset.
    #[error("{0} environment variable is required")]
    Missing(&'static str),
    /// A URL failed to parse.
    #[error("invalid URL for {0}: {1}")]
    InvalidUrl(String, String),
    /// A numeric variable failed to parse.
    #[error("invalid value {value:?} for {var}")]
    InvalidNumber {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },
}
