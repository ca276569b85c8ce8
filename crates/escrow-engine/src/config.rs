//! Engine configuration.
//!
//! Loaded from `ESCROW_*` environment variables in deployments; tests
//! build it directly or through [`EngineConfig::from_lookup`].

use std::time::Duration;

use escrow_core::{FeeRate, ValidationError};
use escrow_state::DisputeWindow;

const DEFAULT_LEASE_TTL_SECS: i64 = 120;
const DEFAULT_RECONCILE_ATTEMPTS: u32 = 3;
const DEFAULT_RECONCILE_BASE_DELAY_MS: u64 = 200;
const DEFAULT_RATE_LIMIT_MAX: u32 = 30;
const DEFAULT_RATE_LIMIT_WINDOW_SECS: i64 = 60;

/// Errors from loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable could not be parsed.
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// How ambiguous gateway outcomes are re-queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilePolicy {
    /// Queries made before giving up and reporting "confirming".
    pub attempts: u32,
    /// Delay before the first query; doubles on each subsequent one.
    pub base_delay: Duration,
}

impl ReconcilePolicy {
    /// Delay before query number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RECONCILE_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RECONCILE_BASE_DELAY_MS),
        }
    }
}

/// Fixed-window rate limit applied per (operation, caller).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests allowed per window.
    pub max_requests: u32,
    /// Window length.
    pub window: chrono::Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_RATE_LIMIT_MAX,
            window: chrono::Duration::seconds(DEFAULT_RATE_LIMIT_WINDOW_SECS),
        }
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Platform fee applied on release.
    pub fee_rate: FeeRate,
    /// How long after completion or release disputes are accepted.
    pub dispute_window: DisputeWindow,
    /// How long a claimed operation excludes others before it lapses.
    pub lease_ttl: chrono::Duration,
    /// Ambiguous-outcome reconciliation.
    pub reconcile: ReconcilePolicy,
    /// Per-caller request allowance.
    pub rate_limit: RateLimitConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fee_rate: FeeRate::DEFAULT,
            dispute_window: DisputeWindow::default(),
            lease_ttl: chrono::Duration::seconds(DEFAULT_LEASE_TTL_SECS),
            reconcile: ReconcilePolicy::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Variables (all optional):
    /// - `ESCROW_FEE_RATE` (decimal fraction, default: 0.10)
    /// - `ESCROW_DISPUTE_WINDOW_DAYS` (default: 30)
    /// - `ESCROW_LEASE_TTL_SECS` (default: 120)
    /// - `ESCROW_RECONCILE_ATTEMPTS` (default: 3)
    /// - `ESCROW_RECONCILE_BASE_DELAY_MS` (default: 200)
    /// - `ESCROW_RATE_LIMIT_MAX` (default: 30)
    /// - `ESCROW_RATE_LIMIT_WINDOW_SECS` (default: 60)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let fee_rate = match lookup("ESCROW_FEE_RATE") {
            Some(raw) => raw
                .parse::<FeeRate>()
                .map_err(|e| invalid("ESCROW_FEE_RATE", &raw, e))?,
            None => defaults.fee_rate,
        };

        let dispute_window = match lookup("ESCROW_DISPUTE_WINDOW_DAYS") {
            Some(raw) => {
                let days: i64 = parse_number("ESCROW_DISPUTE_WINDOW_DAYS", &raw)?;
                DisputeWindow::days(days)
                    .map_err(|e| invalid("ESCROW_DISPUTE_WINDOW_DAYS", &raw, e))?
            }
            None => defaults.dispute_window,
        };

        let lease_ttl = match lookup("ESCROW_LEASE_TTL_SECS") {
            Some(raw) => {
                let secs: i64 = parse_number("ESCROW_LEASE_TTL_SECS", &raw)?;
                positive_seconds("ESCROW_LEASE_TTL_SECS", &raw, secs)?
            }
            None => defaults.lease_ttl,
        };

        let attempts = match lookup("ESCROW_RECONCILE_ATTEMPTS") {
            Some(raw) => parse_number("ESCROW_RECONCILE_ATTEMPTS", &raw)?,
            None => defaults.reconcile.attempts,
        };

        let base_delay = match lookup("ESCROW_RECONCILE_BASE_DELAY_MS") {
            Some(raw) => Duration::from_millis(parse_number("ESCROW_RECONCILE_BASE_DELAY_MS", &raw)?),
            None => defaults.reconcile.base_delay,
        };

        let max_requests = match lookup("ESCROW_RATE_LIMIT_MAX") {
            Some(raw) => {
                let max: u32 = parse_number("ESCROW_RATE_LIMIT_MAX", &raw)?;
                if max == 0 {
                    return Err(ConfigError::Invalid {
                        var: "ESCROW_RATE_LIMIT_MAX",
                        value: raw,
                        reason: "must be at least 1".into(),
                    });
                }
                max
            }
            None => defaults.rate_limit.max_requests,
        };

        let window = match lookup("ESCROW_RATE_LIMIT_WINDOW_SECS") {
            Some(raw) => {
                let secs: i64 = parse_number("ESCROW_RATE_LIMIT_WINDOW_SECS", &raw)?;
                positive_seconds("ESCROW_RATE_LIMIT_WINDOW_SECS", &raw, secs)?
            }
            None => defaults.rate_limit.window,
        };

        Ok(Self {
            fee_rate,
            dispute_window,
            lease_ttl,
            reconcile: ReconcilePolicy {
                attempts,
                base_delay,
            },
            rate_limit: RateLimitConfig {
                max_requests,
                window,
            },
        })
    }
}

fn invalid(var: &'static str, raw: &str, e: ValidationError) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: raw.to_string(),
        reason: e.to_string(),
    }
}

fn parse_number<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn positive_seconds(
    var: &'static str,
    raw: &str,
    secs: i64,
) -> Result<chrono::Duration, ConfigError> {
    chrono::Duration::try_seconds(secs)
        .filter(|d| *d > chrono::Duration::zero())
        .ok_or_else(|| ConfigError::Invalid {
            var,
            value: raw.to_string(),
            reason: "must be a positive number of seconds".into(),
        })
}
