//! In-process `Cache` implementation.
//!
//! Scoped to tests and single-instance deployments: it holds no state that
//! survives a process restart and is not shared across instances, mirroring
//! the companion server's `SessionStore` (a `HashMap` behind an
//! `Arc`-free `RwLock`, sized for one process).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use super::Cache;
use crate::error::AppError;

struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

struct Counter {
    count: i64,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    counters: HashMap<String, Counter>,
}

/// An in-memory `Cache`. Cheap to construct; clone the `Arc` you wrap it in
/// to share across handlers.
pub struct InMemoryCache {
    inner: RwLock<Inner>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let inner = self.inner.read().await;
        Ok(inner.entries.get(key).and_then(|e| {
            if e.expires_at > Utc::now() {
                Some(e.value.clone())
            } else {
                None
            }
        }))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError> {
        let mut inner = self.inner.write().await;
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Utc::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        let mut inner = self.inner.write().await;
        inner.entries.remove(key);
        inner.counters.remove(key);
        Ok(())
    }

    async fn increment_with_expiry(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<(i64, DateTime<Utc>), AppError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let fresh = match inner.counters.get(key) {
            Some(c) if c.expires_at > now => false,
            _ => true,
        };
        if fresh {
            let expires_at = now + window;
            inner.counters.insert(
                key.to_string(),
                Counter {
                    count: 1,
                    expires_at,
                },
            );
            Ok((1, expires_at))
        } else {
            let counter = inner.counters.get_mut(key).expect("checked above");
            counter.count += 1;
            Ok((counter.count, counter.expires_at))
        }
    }

    async fn sweep_expired(&self) -> Result<u64, AppError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let before = inner.entries.len() + inner.counters.len();
        inner.entries.retain(|_, e| e.expires_at > now);
        inner.counters.retain(|_, c| c.expires_at > now);
        let after = inner.entries.len() + inner.counters.len();
        Ok((before - after) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let cache = InMemoryCache::new();
        cache.set_with_ttl("k", "v", Duration::seconds(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_expired_entry_absent() {
        let cache = InMemoryCache::new();
        cache
            .set_with_ttl("k", "v", Duration::milliseconds(-1))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_increment_resets_after_window() {
        let cache = InMemoryCache::new();
        let (first, _) = cache
            .increment_with_expiry("rl:x", Duration::milliseconds(-1))
            .await
            .unwrap();
        assert_eq!(first, 1);
        let (second, _) = cache
            .increment_with_expiry("rl:x", Duration::seconds(60))
            .await
            .unwrap();
        // previous window already expired, so this starts a fresh window
        assert_eq!(second, 1);
    }

    #[tokio::test]
    async fn test_increment_accumulates_within_window() {
        let cache = InMemoryCache::new();
        cache
            .increment_with_expiry("rl:y", Duration::seconds(60))
            .await
            .unwrap();
        let (count, _) = cache
            .increment_with_expiry("rl:y", Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_delete_removes_both_maps() {
        let cache = InMemoryCache::new();
        cache.set_with_ttl("k", "v", Duration::seconds(60)).await.unwrap();
        cache
            .increment_with_expiry("k", Duration::seconds(60))
            .await
            .unwrap();
        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
        let (count, _) = cache
            .increment_with_expiry("k", Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
