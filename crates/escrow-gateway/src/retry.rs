//! Backoff for outcome queries.
//!
//! `query_charge` and `query_transfer` are reads keyed by an idempotency
//! key, so resending them is harmless. Charges and transfers never come
//! through here: their ambiguity is resolved by querying, not resending.

use std::future::Future;
use std::time::Duration;

/// How an outcome query is retried after a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Resends after the first try. Zero sends once.
    pub retries: u32,
    /// Pause before the first resend; doubles on each later one.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Default resends per query.
    pub const DEFAULT_RETRIES: u32 = 3;
    /// Default first pause, in milliseconds.
    pub const DEFAULT_BASE_DELAY_MS: u64 = 200;

    /// Never resend.
    pub const NONE: Self = Self {
        retries: 0,
        base_delay: Duration::ZERO,
    };

    /// Pause before resend number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(retry.min(16)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: Self::DEFAULT_RETRIES,
            base_delay: Duration::from_millis(Self::DEFAULT_BASE_DELAY_MS),
        }
    }
}

/// Run `send` until it returns `Ok` or the policy's resends run out.
///
/// Only an `Err` from `send` counts as a failure. For `reqwest` that is a
/// transport failure; an HTTP error status is an `Ok` response the caller
/// classifies itself.
pub(crate) async fn retry_send<T, E, F, Fut>(policy: &RetryPolicy, send: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut retry = 0;
    loop {
        match send().await {
            Ok(value) => return Ok(value),
            Err(e) if retry >= policy.retries => return Err(e),
            Err(e) => {
                let delay = policy.delay(retry);
                tracing::warn!(
                    retry = retry + 1,
                    retries = policy.retries,
                    ?delay,
                    error = %e,
                    "gateway query failed, resending"
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
        }
    }
}
