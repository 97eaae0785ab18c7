//! Shared pre-flight check for the two block signals a response from
//! upstream can assert: the service-wide `perm_blocked` flag and a
//! per-user temporary `blocked:<user>` entry (§4.D, §5 ordering guarantees).
//!
//! Both H and I consult this before issuing an upstream call. The checks
//! are not linearised with upstream setting them (see DESIGN.md): the
//! worst case is one extra upstream request that re-establishes the gate
//! from its own response headers.

use chrono::{DateTime, Utc};

use crate::cache::Cache;
use crate::error::AppError;

pub async fn ensure_not_blocked(cache: &dyn Cache, osm_user_id: &str) -> Result<(), AppError> {
    if cache.get("perm_blocked").await?.is_some() {
        return Err(AppError::ServiceBlocked);
    }
    if let Some(value) = cache.get(&format!("blocked:{osm_user_id}")).await? {
        let blocked_until: DateTime<Utc> = value
            .parse()
            .unwrap_or_else(|_| Utc::now() + chrono::Duration::seconds(60));
        let retry_after = (blocked_until - Utc::now()).num_seconds().max(1);
        return Err(AppError::UserBlocked { retry_after });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;

    #[tokio::test]
    async fn test_passes_when_clear() {
        let cache = InMemoryCache::new();
        assert!(ensure_not_blocked(&cache, "user-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_fails_on_perm_blocked() {
        let cache = InMemoryCache::new();
        cache.set_with_ttl("perm_blocked", "1", chrono::Duration::hours(1)).await.unwrap();
        let result = ensure_not_blocked(&cache, "user-1").await;
        assert!(matches!(result, Err(AppError::ServiceBlocked)));
    }

    #[tokio::test]
    async fn test_fails_on_user_blocked_with_retry_after() {
        let cache = InMemoryCache::new();
        let until = Utc::now() + chrono::Duration::seconds(3600);
        cache
            .set_with_ttl("blocked:user-1", &until.to_rfc3339(), chrono::Duration::seconds(3600))
            .await
            .unwrap();
        let result = ensure_not_blocked(&cache, "user-1").await;
        match result {
            Err(AppError::UserBlocked { retry_after }) => assert!(retry_after > 3500),
            other => panic!("expected UserBlocked, got {other:?}"),
        }
    }
}
