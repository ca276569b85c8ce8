//! # Rate Limiting
//!
//! Request allowances are an injected capability so that several service
//! instances can share one limit store. [`FixedWindowRateLimiter`] is the
//! in-process reference implementation; its windows are evicted once they
//! expire so the key space cannot grow without bound.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use escrow_core::{Timestamp, UserId};

use crate::config::RateLimitConfig;

/// Checks between opportunistic sweeps of expired windows.
const EVICTION_INTERVAL: u64 = 256;

/// What a rate limit is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Operation being throttled (e.g. "fund").
    pub operation: &'static str,
    /// The calling user.
    pub caller: UserId,
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Proceed.
    Allowed {
        /// Requests left in the current window.
        remaining: u32,
    },
    /// Reject until the window resets.
    Limited {
        /// Seconds until the window resets.
        retry_after_secs: u64,
    },
}

/// Shared request-allowance store.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one request for `key` at `now` and decide whether it may run.
    async fn check(&self, key: RateLimitKey, now: Timestamp) -> RateDecision;
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: Timestamp,
    count: u32,
}

#[derive(Debug, Default)]
struct Windows {
    by_key: HashMap<RateLimitKey, Window>,
    checks: u64,
}

/// Fixed-window limiter held in process memory.
#[derive(Debug)]
pub struct FixedWindowRateLimiter {
    config: RateLimitConfig,
    windows: Mutex<Windows>,
}

impl FixedWindowRateLimiter {
    /// A limiter allowing `config.max_requests` per `config.window`.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(Windows::default()),
        }
    }

    /// Drop every window that has ended by `now`. Returns how many.
    pub fn evict_expired(&self, now: Timestamp) -> usize {
        let mut windows = self.windows.lock();
        Self::sweep(&mut windows.by_key, now, self.config.window)
    }

    /// Number of tracked windows.
    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().by_key.len()
    }

    fn sweep(
        by_key: &mut HashMap<RateLimitKey, Window>,
        now: Timestamp,
        window: chrono::Duration,
    ) -> usize {
        let before = by_key.len();
        by_key.retain(|_, w| now.since(w.started_at) < window);
        before - by_key.len()
    }
}

#[async_trait]
impl RateLimiter for FixedWindowRateLimiter {
    async fn check(&self, key: RateLimitKey, now: Timestamp) -> RateDecision {
        let mut windows = self.windows.lock();
        windows.checks += 1;
        if windows.checks % EVICTION_INTERVAL == 0 {
            let evicted = Self::sweep(&mut windows.by_key, now, self.config.window);
            if evicted > 0 {
                tracing::debug!(evicted, "evicted expired rate limit windows");
            }
        }

        let length = self.config.window;
        let window = windows.by_key.entry(key).or_insert(Window {
            started_at: now,
            count: 0,
        });
        if now.since(window.started_at) >= length {
            *window = Window {
                started_at: now,
                count: 0,
            };
        }

        if window.count >= self.config.max_requests {
            let resets_at = window.started_at.saturating_add(length);
            let retry_after_secs = u64::try_from(resets_at.since(now).num_seconds()).unwrap_or(0);
            tracing::warn!(
                operation = key.operation,
                caller = %key.caller,
                retry_after_secs,
                "rate limit exceeded"
            );
            RateDecision::Limited { retry_after_secs }
        } else {
            window.count += 1;
            RateDecision::Allowed {
                remaining: self.config.max_requests - window.count,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32) -> FixedWindowRateLimiter {
        FixedWindowRateLimiter::new(RateLimitConfig {
            max_requests: max,
            window: chrono::Duration::seconds(60),
        })
    }

    fn at(s: &str) -> Timestamp {
        Timestamp::parse(s).unwrap()
    }

    #[tokio::test]
    async fn limits_within_a_window_then_resets() {
        let limiter = limiter(2);
        let key = RateLimitKey {
            operation: "fund",
            caller: UserId::new(),
        };
        let t0 = at("2026-01-01T00:00:00Z");
        assert_eq!(
            limiter.check(key, t0).await,
            RateDecision::Allowed { remaining: 1 }
        );
        assert_eq!(
            limiter.check(key, t0).await,
            RateDecision::Allowed { remaining: 0 }
        );
        assert_eq!(
            limiter.check(key, at("2026-01-01T00:00:20Z")).await,
            RateDecision::Limited {
                retry_after_secs: 40
            }
        );
        assert!(matches!(
            limiter.check(key, at("2026-01-01T00:01:00Z")).await,
            RateDecision::Allowed { .. }
        ));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = limiter(1);
        let t0 = at("2026-01-01T00:00:00Z");
        let user = UserId::new();
        let fund = RateLimitKey {
            operation: "fund",
            caller: user,
        };
        let release = RateLimitKey {
            operation: "release",
            caller: user,
        };
        assert!(matches!(limiter.check(fund, t0).await, RateDecision::Allowed { .. }));
        assert!(matches!(limiter.check(release, t0).await, RateDecision::Allowed { .. }));
        assert!(matches!(limiter.check(fund, t0).await, RateDecision::Limited { .. }));
    }

    #[tokio::test]
    async fn expired_windows_are_evicted() {
        let limiter = limiter(5);
        let t0 = at("2026-01-01T00:00:00Z");
        for _ in 0..3 {
            let key = RateLimitKey {
                operation: "fund",
                caller: UserId::new(),
            };
            limiter.check(key, t0).await;
        }
        assert_eq!(limiter.tracked_keys(), 3);
        assert_eq!(limiter.evict_expired(at("2026-01-01T00:00:30Z")), 0);
        assert_eq!(limiter.evict_expired(at("2026-01-01T00:01:00Z")), 3);
        assert_eq!(limiter.tracked_keys(), 0);
    }
}
