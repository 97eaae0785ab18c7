//! Component C: a fixed-window rate limiter over the cache's atomic
//! increment-with-expiry primitive.
//!
//! Adapted from the keyed-limiter shape of a reqwest-era token-bucket
//! limiter (see DESIGN.md) to the fixed-window counter semantics this
//! service needs: one atomic increment per call, expiry stamped only on the
//! first write in a window, no refill-rate arithmetic.

use std::sync::Arc;

use chrono::Utc;

use crate::cache::Cache;
use crate::error::AppError;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: i64,
    pub retry_after: i64,
}

#[derive(Clone)]
pub struct RateLimiter {
    cache: Arc<dyn Cache>,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    /// Check and record one call against `name:key` within `limit` calls per
    /// `window`. On cache failure, fails open (allowed=true) and logs —
    /// infrastructure glitches must never block legitimate traffic.
    pub async fn check(
        &self,
        name: &str,
        key: &str,
        limit: i64,
        window: chrono::Duration,
    ) -> RateLimitResult {
        let cache_key = format!("rl:{name}:{key}");
        match self.cache.increment_with_expiry(&cache_key, window).await {
            Ok((count, expires_at)) => {
                let retry_after = (expires_at - Utc::now()).num_seconds().max(0);
                if count <= limit {
                    RateLimitResult {
                        allowed: true,
                        remaining: limit - count,
                        retry_after: 0,
                    }
                } else {
                    RateLimitResult {
                        allowed: false,
                        remaining: 0,
                        retry_after,
                    }
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, name, "rate limiter cache failure, failing open");
                RateLimitResult {
                    allowed: true,
                    remaining: limit,
                    retry_after: 0,
                }
            }
        }
    }

    pub async fn enforce(
        &self,
        name: &str,
        key: &str,
        limit: i64,
        window: chrono::Duration,
    ) -> Result<(), AppError> {
        let result = self.check(name, key, limit, window).await;
        if result.allowed {
            Ok(())
        } else {
            Err(AppError::RateLimited {
                retry_after: result.retry_after,
            })
        }
    }

    /// Single-slot variant used as a short-lived cross-process mutex
    /// (Component I's per-patrol lock): `limit=1` over `hold` makes the
    /// first caller in the window the sole holder, reusing the same
    /// atomic increment-with-expiry primitive rather than a separate lock
    /// table.
    pub async fn try_acquire(&self, name: &str, key: &str, hold: chrono::Duration) -> bool {
        self.check(name, key, 1, hold).await.allowed
    }

    /// Release a single-slot lock early so a later caller need not wait out
    /// the full hold duration.
    pub async fn release(&self, name: &str, key: &str) -> Result<(), AppError> {
        self.cache.delete(&format!("rl:{name}:{key}")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(InMemoryCache::new()))
    }

    #[tokio::test]
    async fn test_allows_up_to_limit() {
        let rl = limiter();
        for i in 1..=3 {
            let result = rl.check("device_authorize", "1.2.3.4", 3, chrono::Duration::minutes(1)).await;
            assert!(result.allowed, "call {i} should be allowed");
        }
    }

    #[tokio::test]
    async fn test_blocks_past_limit() {
        let rl = limiter();
        for _ in 1..=3 {
            rl.check("x", "k", 3, chrono::Duration::minutes(1)).await;
        }
        let result = rl.check("x", "k", 3, chrono::Duration::minutes(1)).await;
        assert!(!result.allowed);
        assert!(result.retry_after > 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_independent() {
        let rl = limiter();
        for _ in 1..=3 {
            rl.check("x", "k1", 3, chrono::Duration::minutes(1)).await;
        }
        let result = rl.check("x", "k2", 3, chrono::Duration::minutes(1)).await;
        assert!(result.allowed);
    }

    #[tokio::test]
    async fn test_try_acquire_is_single_slot() {
        let rl = limiter();
        assert!(rl.try_acquire("lock", "section-1:patrol-1", chrono::Duration::seconds(5)).await);
        assert!(!rl.try_acquire("lock", "section-1:patrol-1", chrono::Duration::seconds(5)).await);
        rl.release("lock", "section-1:patrol-1").await.unwrap();
        assert!(rl.try_acquire("lock", "section-1:patrol-1", chrono::Duration::seconds(5)).await);
    }

    #[tokio::test]
    async fn test_enforce_returns_rate_limited_error() {
        let rl = limiter();
        for _ in 1..=1 {
            rl.check("x", "k", 1, chrono::Duration::minutes(1)).await;
        }
        let err = rl.enforce("x", "k", 1, chrono::Duration::minutes(1)).await;
        assert!(matches!(err, Err(AppError::RateLimited { .. })));
    }
}
