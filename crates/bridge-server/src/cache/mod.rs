//! Component A: a TTL-bounded key-value cache.
//!
//! Used for rate-limit counters, block states, short-lived OAuth state
//! tokens, and cached patrol-score responses. Block state is deliberately
//! kept here rather than in the persistent store (see DESIGN.md) so it
//! expires naturally and is re-established from upstream response headers
//! the next time it is in force.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::InMemoryCache;
pub use sqlite::SqliteCache;

/// A TTL-bounded key-value store.
///
/// Implementations MUST treat an expired entry as absent on read without
/// requiring an explicit sweep; the periodic cleanup job is a housekeeping
/// optimisation, not a correctness requirement.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, crate::error::AppError>;

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: chrono::Duration,
    ) -> Result<(), crate::error::AppError>;

    async fn delete(&self, key: &str) -> Result<(), crate::error::AppError>;

    /// Atomically increment the counter at `key`, setting its expiry to
    /// `now + window` if this is the first increment (the counter does not
    /// exist or has already expired). Returns the post-increment count.
    ///
    /// This is the fixed-window primitive the rate limiter (Component C)
    /// builds on: count-then-compare, not refill-rate arithmetic.
    async fn increment_with_expiry(
        &self,
        key: &str,
        window: chrono::Duration,
    ) -> Result<(i64, DateTime<Utc>), crate::error::AppError>;

    /// Remove all expired entries. Best-effort; callers MUST NOT depend on
    /// this for correctness, only for bounding storage growth.
    async fn sweep_expired(&self) -> Result<u64, crate::error::AppError>;
}
