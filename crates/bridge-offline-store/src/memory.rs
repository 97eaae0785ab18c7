//! In-memory `Storage`: the reference backend used by every native test in
//! this crate, and the fallback when the store is linked into a
//! non-wasm32 host (e.g. a desktop shell embedding the same admin UI code).
//!
//! Mirrors `bridge-server`'s `cache::memory::InMemoryCache`: state lives
//! behind a single `RwLock`-guarded `Inner`, sized for one process, holding
//! nothing that needs to survive a restart.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{
    CanonicalPatrol, PatrolRow, PatrolSyncOutcome, PatrolSyncResult, PendingSyncBatch,
    RetryPolicy, SectionRecord, SectionScores, SyncBatchEntry, UserMetadata,
};
use crate::storage::{next_sync_time, Storage};

type SectionKey = (String, String);
type PatrolKey = (String, String, String);

#[derive(Default)]
struct Inner {
    sections: HashMap<SectionKey, SectionRecord>,
    patrols: HashMap<PatrolKey, PatrolRow>,
    metadata: HashMap<String, UserMetadata>,
}

/// An in-memory `Storage`. Cheap to construct; wrap in an `Rc`/`Arc` to
/// share across callers within one tab.
#[derive(Default)]
pub struct InMemoryStorage {
    inner: RwLock<Inner>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn patrol_key(user_id: &str, section_id: &str, patrol_id: &str) -> PatrolKey {
    (user_id.to_string(), section_id.to_string(), patrol_id.to_string())
}

fn section_key(user_id: &str, section_id: &str) -> SectionKey {
    (user_id.to_string(), section_id.to_string())
}

fn patrols_for_section<'a>(
    patrols: &'a HashMap<PatrolKey, PatrolRow>,
    user_id: &str,
    section_id: &str,
) -> impl Iterator<Item = &'a PatrolRow> {
    patrols
        .iter()
        .filter(move |((u, s, _), _)| u == user_id && s == section_id)
        .map(|(_, row)| row)
}

#[async_trait(?Send)]
impl Storage for InMemoryStorage {
    async fn get_scores_for_section(
        &self,
        user_id: &str,
        section_id: &str,
    ) -> Result<Option<SectionScores>, StoreError> {
        let inner = self.inner.read().await;
        let Some(section) = inner.sections.get(&section_key(user_id, section_id)) else {
            return Ok(None);
        };
        let mut patrols: Vec<PatrolRow> = patrols_for_section(&inner.patrols, user_id, section_id)
            .cloned()
            .collect();
        patrols.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Some(SectionScores {
            section: section.clone(),
            patrols,
        }))
    }

    async fn add_pending_points(
        &self,
        user_id: &str,
        section_id: &str,
        patrol_id: &str,
        delta: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let key = patrol_key(user_id, section_id, patrol_id);
        let row = inner
            .patrols
            .get_mut(&key)
            .ok_or_else(|| StoreError::PatrolNotFound {
                section_id: section_id.to_string(),
                patrol_id: patrol_id.to_string(),
            })?;
        row.pending_delta += delta;
        let section = inner
            .sections
            .get_mut(&section_key(user_id, section_id))
            .ok_or_else(|| StoreError::SectionNotFound {
                user_id: user_id.to_string(),
                section_id: section_id.to_string(),
            })?;
        section.ui_revision += 1;
        Ok(())
    }

    async fn set_canonical_patrol_list(
        &self,
        user_id: &str,
        section_id: &str,
        patrols: Vec<CanonicalPatrol>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let listed: HashMap<String, CanonicalPatrol> =
            patrols.into_iter().map(|p| (p.id.clone(), p)).collect();

        let stale: Vec<PatrolKey> = inner
            .patrols
            .keys()
            .filter(|(u, s, p)| u == user_id && s == section_id && !listed.contains_key(p))
            .cloned()
            .collect();
        for key in stale {
            inner.patrols.remove(&key);
        }

        for (id, canonical) in listed {
            let key = patrol_key(user_id, section_id, &id);
            inner
                .patrols
                .entry(key)
                .and_modify(|row| {
                    row.name = canonical.name.clone();
                    row.committed_score = canonical.score;
                })
                .or_insert_with(|| PatrolRow::new(section_id, id, canonical.name, canonical.score));
        }

        let section = inner
            .sections
            .entry(section_key(user_id, section_id))
            .or_insert_with(|| SectionRecord::new(user_id, section_id));
        section.last_refresh = Some(now);
        section.error = None;
        section.ui_revision += 1;
        Ok(())
    }

    async fn acquire_pending_for_sync(
        &self,
        user_id: &str,
        section_id: &str,
        lock_duration: Duration,
    ) -> Result<PendingSyncBatch, StoreError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let lock_id = Uuid::new_v4();
        let deadline = now + lock_duration;

        let matching: Vec<PatrolKey> = inner
            .patrols
            .iter()
            .filter(|((u, s, _), row)| u == user_id && s == section_id && row.eligible_for_sync(now))
            .map(|(key, _)| key.clone())
            .collect();

        let mut entries = Vec::with_capacity(matching.len());
        for key in matching {
            let row = inner.patrols.get_mut(&key).expect("key came from this map");
            row.lock_id = Some(lock_id);
            row.lock_timeout = Some(deadline);
            entries.push(SyncBatchEntry {
                patrol_id: row.patrol_id.clone(),
                pending_delta: row.pending_delta,
            });
        }

        Ok(PendingSyncBatch { lock_id, entries })
    }

    async fn release_pending_for_sync(
        &self,
        user_id: &str,
        section_id: &str,
        lock_id: Uuid,
        results: Vec<PatrolSyncResult>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        for result in results {
            let key = patrol_key(user_id, section_id, &result.patrol_id);
            let Some(row) = inner.patrols.get_mut(&key) else {
                continue;
            };
            if row.lock_id != Some(lock_id) {
                // Lock already expired and re-acquired by someone else; leave it alone.
                continue;
            }
            match result.outcome {
                PatrolSyncOutcome::Success { new_committed_score } => {
                    row.committed_score = new_committed_score;
                    row.pending_delta = 0;
                    row.retry_after = RetryPolicy::Ready;
                    row.error_message = None;
                }
                PatrolSyncOutcome::TemporaryFailure { message } => {
                    row.retry_after = RetryPolicy::After(Utc::now() + Duration::minutes(5));
                    row.error_message = Some(message);
                }
                PatrolSyncOutcome::PermanentFailure { message } => {
                    row.retry_after = RetryPolicy::Permanent;
                    row.error_message = Some(message);
                }
            }
            row.lock_id = None;
            row.lock_timeout = None;
        }
        Ok(())
    }

    async fn acquire_section_sync_lock(
        &self,
        user_id: &str,
        section_id: &str,
        lock_duration: Duration,
    ) -> Result<Option<Uuid>, StoreError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let section = inner
            .sections
            .entry(section_key(user_id, section_id))
            .or_insert_with(|| SectionRecord::new(user_id, section_id));

        if let Some(timeout) = section.sync_lock_timeout {
            if timeout > now {
                return Ok(None);
            }
        }

        let lock_id = Uuid::new_v4();
        section.sync_lock_id = Some(lock_id);
        section.sync_lock_timeout = Some(now + lock_duration);
        Ok(Some(lock_id))
    }

    async fn release_section_sync_lock(
        &self,
        user_id: &str,
        section_id: &str,
        lock_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let Some(section) = inner.sections.get_mut(&section_key(user_id, section_id)) else {
            return Ok(());
        };
        if section.sync_lock_id != Some(lock_id) {
            return Err(StoreError::LockMismatch {
                section_id: section_id.to_string(),
                lock_id: lock_id.to_string(),
            });
        }
        section.sync_lock_id = None;
        section.sync_lock_timeout = None;
        Ok(())
    }

    async fn get_next_sync_time(
        &self,
        user_id: &str,
        section_id: &str,
    ) -> Result<Option<chrono::DateTime<Utc>>, StoreError> {
        let inner = self.inner.read().await;
        let now = Utc::now();
        let instants: Vec<_> = patrols_for_section(&inner.patrols, user_id, section_id)
            .filter_map(|row| match row.retry_after {
                RetryPolicy::After(at) => Some(at),
                _ => None,
            })
            .collect();
        Ok(next_sync_time(instants, now))
    }

    async fn update_section_sync_timing(
        &self,
        user_id: &str,
        section_id: &str,
    ) -> Result<(), StoreError> {
        let next = self.get_next_sync_time(user_id, section_id).await?;
        let mut inner = self.inner.write().await;
        let section = inner
            .sections
            .entry(section_key(user_id, section_id))
            .or_insert_with(|| SectionRecord::new(user_id, section_id));
        section.last_sync_attempt = Some(Utc::now());
        section.next_retry_time = next;
        Ok(())
    }

    async fn mark_all_pending_as_failed(
        &self,
        user_id: &str,
        section_id: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let deadline = Utc::now() + Duration::minutes(5);
        for ((u, s, _), row) in inner.patrols.iter_mut() {
            if u == user_id && s == section_id && row.pending_delta != 0 {
                row.retry_after = RetryPolicy::After(deadline);
                row.error_message = Some(message.to_string());
            }
        }
        Ok(())
    }

    async fn clear_permanent_errors(&self, user_id: &str, section_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        for ((u, s, _), row) in inner.patrols.iter_mut() {
            if u == user_id && s == section_id && row.retry_after == RetryPolicy::Permanent {
                row.retry_after = RetryPolicy::Ready;
            }
        }
        Ok(())
    }

    async fn delete_user_data(&self, user_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.sections.retain(|(u, _), _| u != user_id);
        inner.patrols.retain(|(u, _, _), _| u != user_id);
        inner.metadata.remove(user_id);
        Ok(())
    }

    async fn get_user_metadata(&self, user_id: &str) -> Result<Option<UserMetadata>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.metadata.get(user_id).cloned())
    }

    async fn upsert_user_metadata(&self, metadata: UserMetadata) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.metadata.insert(metadata.user_id.clone(), metadata);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canonical(id: &str, name: &str, score: i64) -> CanonicalPatrol {
        CanonicalPatrol {
            id: id.to_string(),
            name: name.to_string(),
            score,
        }
    }

    #[tokio::test]
    async fn add_pending_points_requires_existing_row() {
        let store = InMemoryStorage::new();
        let err = store
            .add_pending_points("user-1", "section-1", "patrol-1", 3)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PatrolNotFound { .. }));
    }

    #[tokio::test]
    async fn canonical_list_preserves_pending_delta_and_deletes_missing() {
        let store = InMemoryStorage::new();
        store
            .set_canonical_patrol_list(
                "user-1",
                "section-1",
                vec![canonical("patrol-1", "Eagles", 100), canonical("patrol-2", "Hawks", 50)],
            )
            .await
            .unwrap();
        store
            .add_pending_points("user-1", "section-1", "patrol-1", 5)
            .await
            .unwrap();

        // A refresh that drops patrol-2 and renames patrol-1 must keep the pending delta.
        store
            .set_canonical_patrol_list("user-1", "section-1", vec![canonical("patrol-1", "Eagles Renamed", 100)])
            .await
            .unwrap();

        let scores = store
            .get_scores_for_section("user-1", "section-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scores.patrols.len(), 1);
        let row = &scores.patrols[0];
        assert_eq!(row.name, "Eagles Renamed");
        assert_eq!(row.pending_delta, 5);
        assert_eq!(row.displayed_score(), 105);
    }

    #[tokio::test]
    async fn concurrent_additions_coalesce_into_one_sync_batch_entry() {
        let store = InMemoryStorage::new();
        store
            .set_canonical_patrol_list("user-1", "section-1", vec![canonical("patrol-1", "Eagles", 100)])
            .await
            .unwrap();
        for _ in 0..3 {
            store
                .add_pending_points("user-1", "section-1", "patrol-1", 1)
                .await
                .unwrap();
        }

        let lock_id = store
            .acquire_section_sync_lock("user-1", "section-1", Duration::seconds(30))
            .await
            .unwrap()
            .expect("lock should be free");

        let batch = store
            .acquire_pending_for_sync("user-1", "section-1", Duration::seconds(10))
            .await
            .unwrap();
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].pending_delta, 3);

        store
            .release_pending_for_sync(
                "user-1",
                "section-1",
                batch.lock_id,
                vec![PatrolSyncResult {
                    patrol_id: "patrol-1".to_string(),
                    outcome: PatrolSyncOutcome::Success {
                        new_committed_score: 103,
                    },
                }],
            )
            .await
            .unwrap();
        store
            .release_section_sync_lock("user-1", "section-1", lock_id)
            .await
            .unwrap();

        let scores = store
            .get_scores_for_section("user-1", "section-1")
            .await
            .unwrap()
            .unwrap();
        let row = &scores.patrols[0];
        assert_eq!(row.committed_score, 103);
        assert_eq!(row.pending_delta, 0);
    }

    #[tokio::test]
    async fn second_sync_lock_holder_blocked_until_expiry() {
        let store = InMemoryStorage::new();
        let first = store
            .acquire_section_sync_lock("user-1", "section-1", Duration::seconds(30))
            .await
            .unwrap();
        assert!(first.is_some());

        let second = store
            .acquire_section_sync_lock("user-1", "section-1", Duration::seconds(30))
            .await
            .unwrap();
        assert!(second.is_none(), "a live lock must block a second holder");
    }

    #[tokio::test]
    async fn only_lock_holder_can_release_section_lock() {
        let store = InMemoryStorage::new();
        let lock_id = store
            .acquire_section_sync_lock("user-1", "section-1", Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();

        let err = store
            .release_section_sync_lock("user-1", "section-1", Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LockMismatch { .. }));

        store
            .release_section_sync_lock("user-1", "section-1", lock_id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn permanent_failure_excluded_until_cleared() {
        let store = InMemoryStorage::new();
        store
            .set_canonical_patrol_list("user-1", "section-1", vec![canonical("patrol-1", "Eagles", 100)])
            .await
            .unwrap();
        store
            .add_pending_points("user-1", "section-1", "patrol-1", 1)
            .await
            .unwrap();

        store
            .release_pending_for_sync(
                "user-1",
                "section-1",
                Uuid::new_v4(), // no lock held yet; release is a no-op match check below
                vec![],
            )
            .await
            .unwrap();

        let batch = store
            .acquire_pending_for_sync("user-1", "section-1", Duration::seconds(10))
            .await
            .unwrap();
        assert_eq!(batch.entries.len(), 1);
        store
            .release_pending_for_sync(
                "user-1",
                "section-1",
                batch.lock_id,
                vec![PatrolSyncResult {
                    patrol_id: "patrol-1".to_string(),
                    outcome: PatrolSyncOutcome::PermanentFailure {
                        message: "rejected".to_string(),
                    },
                }],
            )
            .await
            .unwrap();

        let excluded = store
            .acquire_pending_for_sync("user-1", "section-1", Duration::seconds(10))
            .await
            .unwrap();
        assert!(excluded.entries.is_empty(), "permanently failed row must stay excluded");

        store.clear_permanent_errors("user-1", "section-1").await.unwrap();
        let included = store
            .acquire_pending_for_sync("user-1", "section-1", Duration::seconds(10))
            .await
            .unwrap();
        assert_eq!(included.entries.len(), 1);
    }

    #[tokio::test]
    async fn delete_user_data_does_not_touch_other_users() {
        let store = InMemoryStorage::new();
        store
            .set_canonical_patrol_list("user-1", "section-1", vec![canonical("patrol-1", "Eagles", 100)])
            .await
            .unwrap();
        store
            .set_canonical_patrol_list("user-2", "section-1", vec![canonical("patrol-1", "Hawks", 10)])
            .await
            .unwrap();

        store.delete_user_data("user-1").await.unwrap();

        assert!(store
            .get_scores_for_section("user-1", "section-1")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .get_scores_for_section("user-2", "section-1")
            .await
            .unwrap()
            .is_some());
    }
}
