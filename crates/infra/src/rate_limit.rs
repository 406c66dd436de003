//! Sliding-window rate limiter backed by a sorted set per resource.
//!
//! Each admitted request is a member scored by its timestamp in ms. A check
//! prunes members older than the window, counts the rest and records the new
//! request in one atomic batch. A denied request removes its own member again,
//! so rejected traffic never extends the window.
//!
//! Store failures fail open: the request is admitted and the decision says so.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use texforge_core::{Clock, SystemClock};

use crate::store::{Batch, KeySpace, RecordStore, StoreError};

pub const DEFAULT_MAX_REQUESTS: u32 = 10;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

pub const RATE_LIMIT_WOULD_BE_EXCEEDED: &str = "Rate limit would be exceeded";
pub const RATE_LIMIT_CHECK_FAILED: &str = "Rate limit check failed, allowing request";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            window: DEFAULT_WINDOW,
        }
    }
}

impl RateLimitPolicy {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    /// Message attached to a denied request.
    pub fn exceeded_message(&self) -> String {
        format!(
            "Rate limit exceeded. Maximum {} compilations per {} seconds.",
            self.max_requests,
            self.window.as_secs()
        )
    }

    fn window_ms(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RateLimitDecision {
    fn fail_open(remaining: u32, reset_at: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_at,
            error: Some(RATE_LIMIT_CHECK_FAILED.to_string()),
        }
    }

    /// Seconds until the window resets, never negative.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        u64::try_from((self.reset_at - now).num_seconds()).unwrap_or_default()
    }
}

fn to_u32(n: i64) -> u32 {
    u32::try_from(n.max(0)).unwrap_or(u32::MAX)
}

#[derive(Debug, Clone)]
pub struct RateLimiter<S> {
    store: S,
    keys: KeySpace,
    clock: Arc<dyn Clock>,
}

impl<S: RecordStore> RateLimiter<S> {
    pub fn new(store: S, keys: KeySpace) -> Self {
        Self::with_clock(store, keys, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, keys: KeySpace, clock: Arc<dyn Clock>) -> Self {
        Self { store, keys, clock }
    }

    fn reset_at(&self, now: DateTime<Utc>, policy: RateLimitPolicy) -> DateTime<Utc> {
        chrono::Duration::from_std(policy.window)
            .ok()
            .and_then(|window| now.checked_add_signed(window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Admit or deny one request against `resource`, recording it when admitted.
    pub async fn check_and_consume(
        &self,
        resource: &str,
        policy: RateLimitPolicy,
    ) -> RateLimitDecision {
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();
        let reset_at = self.reset_at(now, policy);
        let key = self.keys.rate_limit(resource);
        let member = format!("{now_ms}-{}", Uuid::now_v7().simple());

        let batch = Batch::new()
            .zrem_range_by_score(&key, 0, now_ms.saturating_sub(policy.window_ms()))
            .zcard(&key)
            .zadd(&key, now_ms, &member)
            .expire(&key, policy.window);

        let count = match self.count_from(batch, 1).await {
            Ok(count) => count,
            Err(e) => {
                warn!(resource, error = %e, "rate limiter unavailable; allowing request");
                return RateLimitDecision::fail_open(policy.max_requests.saturating_sub(1), reset_at);
            }
        };

        if count >= i64::from(policy.max_requests) {
            if let Err(e) = self.store.zrem(&key, &member).await {
                warn!(resource, error = %e, "failed to withdraw denied request from window");
            }
            info!(resource, count, "rate limit exceeded");
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at,
                error: Some(policy.exceeded_message()),
            };
        }

        RateLimitDecision {
            allowed: true,
            remaining: to_u32(i64::from(policy.max_requests) - count - 1),
            reset_at,
            error: None,
        }
    }

    /// Report the current window without recording a request.
    pub async fn status(&self, resource: &str, policy: RateLimitPolicy) -> RateLimitDecision {
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();
        let reset_at = self.reset_at(now, policy);
        let key = self.keys.rate_limit(resource);

        let batch = Batch::new()
            .zrem_range_by_score(&key, 0, now_ms.saturating_sub(policy.window_ms()))
            .zcard(&key);

        match self.count_from(batch, 1).await {
            Ok(count) => {
                let allowed = count < i64::from(policy.max_requests);
                RateLimitDecision {
                    allowed,
                    remaining: to_u32(i64::from(policy.max_requests) - count),
                    reset_at,
                    error: (!allowed).then(|| RATE_LIMIT_WOULD_BE_EXCEEDED.to_string()),
                }
            }
            Err(e) => {
                warn!(resource, error = %e, "rate limiter unavailable");
                RateLimitDecision::fail_open(policy.max_requests, reset_at)
            }
        }
    }

    /// Forget every request recorded for `resource`.
    pub async fn reset(&self, resource: &str) -> Result<(), StoreError> {
        self.store.del(&self.keys.rate_limit(resource)).await?;
        Ok(())
    }

    async fn count_from(&self, batch: Batch, index: usize) -> Result<i64, StoreError> {
        let mut replies = self.store.execute(batch).await?;
        if index >= replies.len() {
            return Err(StoreError::UnexpectedReply(format!(
                "rate limit batch returned {} replies",
                replies.len()
            )));
        }
        replies.swap_remove(index).into_int()
    }
}
