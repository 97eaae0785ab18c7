//! `Storage` backed by a real browser IndexedDB database, for the wasm32
//! target the admin UI actually ships.
//!
//! Schema: three object stores, `sections` (key `[user_id, section_id]`),
//! `patrols` (key `[user_id, section_id, patrol_id]`), and `metadata` (key
//! `user_id`), each with a `by_user` index for the scans `delete_user_data`
//! and the section-scoped reads need. Every record round-trips through
//! `serde_wasm_bindgen` rather than `JsValue::from_serde`, which
//! `indexed_db_futures`'s own examples deprecated in favor of the former.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use indexed_db_futures::prelude::*;
use js_sys::Array;
use uuid::Uuid;
use wasm_bindgen::JsValue;
use web_sys::IdbTransactionMode;

use crate::error::StoreError;
use crate::model::{
    CanonicalPatrol, PatrolRow, PatrolSyncOutcome, PatrolSyncResult, PendingSyncBatch,
    RetryPolicy, SectionRecord, SectionScores, SyncBatchEntry, UserMetadata,
};
use crate::storage::{next_sync_time, Storage};

const DB_NAME: &str = "bridge-offline-store";
const DB_VERSION: u32 = 1;
const SECTIONS: &str = "sections";
const PATROLS: &str = "patrols";
const METADATA: &str = "metadata";
const BY_USER: &str = "by_user";

/// `indexed_db_futures` surfaces failures as either a `DomException`/`JsValue`
/// or its own `Error` enum, neither of which implements `std::fmt::Display`
/// uniformly; `{:?}` always works and is enough to diagnose a storage bug.
fn js_err(err: impl std::fmt::Debug) -> StoreError {
    StoreError::Backend(format!("{err:?}"))
}

fn section_key(user_id: &str, section_id: &str) -> Array {
    let key = Array::new();
    key.push(&JsValue::from_str(user_id));
    key.push(&JsValue::from_str(section_id));
    key
}

fn patrol_key(user_id: &str, section_id: &str, patrol_id: &str) -> Array {
    let key = section_key(user_id, section_id);
    key.push(&JsValue::from_str(patrol_id));
    key
}

fn to_js<T: serde::Serialize>(value: &T) -> Result<JsValue, StoreError> {
    serde_wasm_bindgen::to_value(value).map_err(js_err)
}

fn from_js<T: serde::de::DeserializeOwned>(value: JsValue) -> Result<T, StoreError> {
    serde_wasm_bindgen::from_value(value).map_err(js_err)
}

/// A real IndexedDB-backed `Storage`. Opens (and, on first use, migrates)
/// the database once; hold one instance per tab.
pub struct IndexedDbStorage {
    db: IdbDatabase,
}

impl IndexedDbStorage {
    pub async fn open() -> Result<Self, StoreError> {
        let mut request = IdbDatabase::open_u32(DB_NAME, DB_VERSION).map_err(js_err)?;
        request.set_on_upgrade_needed(Some(|evt: &IdbVersionChangeEvent| {
            let db = evt.db();
            if !db.object_store_names().any(|n| n == SECTIONS) {
                let store = db.create_object_store(SECTIONS)?;
                store.create_index(BY_USER, &IdbKeyPath::str("user_id"))?;
            }
            if !db.object_store_names().any(|n| n == PATROLS) {
                let store = db.create_object_store(PATROLS)?;
                store.create_index(BY_USER, &IdbKeyPath::str("user_id"))?;
            }
            if !db.object_store_names().any(|n| n == METADATA) {
                db.create_object_store(METADATA)?;
            }
            Ok(())
        }));
        let db = request.into_future().await.map_err(js_err)?;
        Ok(Self { db })
    }

    fn transaction(
        &self,
        stores: &[&str],
        mode: IdbTransactionMode,
    ) -> Result<IdbTransaction<'_>, StoreError> {
        self.db.transaction_on_multi_with_mode(stores, mode).map_err(js_err)
    }

    async fn read_section(
        &self,
        user_id: &str,
        section_id: &str,
    ) -> Result<Option<SectionRecord>, StoreError> {
        let tx = self.transaction(&[SECTIONS], IdbTransactionMode::Readonly)?;
        let store = tx.object_store(SECTIONS).map_err(js_err)?;
        let key = section_key(user_id, section_id);
        let found = store.get(&key).map_err(js_err)?.await.map_err(js_err)?;
        found.map(from_js).transpose()
    }

    async fn patrols_in_section(
        &self,
        user_id: &str,
        section_id: &str,
    ) -> Result<Vec<PatrolRow>, StoreError> {
        let tx = self.transaction(&[PATROLS], IdbTransactionMode::Readonly)?;
        let store = tx.object_store(PATROLS).map_err(js_err)?;
        let index = store.index(BY_USER).map_err(js_err)?;
        let range = IdbKeyRange::only(&JsValue::from_str(user_id)).map_err(js_err)?;
        let all: Vec<JsValue> = index
            .get_all_with_key(&range)
            .map_err(js_err)?
            .await
            .map_err(js_err)?
            .into();
        let mut rows = all
            .into_iter()
            .map(from_js::<PatrolRow>)
            .collect::<Result<Vec<_>, _>>()?;
        rows.retain(|row| row.section_id == section_id);
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }
}

#[async_trait(?Send)]
impl Storage for IndexedDbStorage {
    async fn get_scores_for_section(
        &self,
        user_id: &str,
        section_id: &str,
    ) -> Result<Option<SectionScores>, StoreError> {
        let Some(section) = self.read_section(user_id, section_id).await? else {
            return Ok(None);
        };
        let patrols = self.patrols_in_section(user_id, section_id).await?;
        Ok(Some(SectionScores { section, patrols }))
    }

    async fn add_pending_points(
        &self,
        user_id: &str,
        section_id: &str,
        patrol_id: &str,
        delta: i64,
    ) -> Result<(), StoreError> {
        let tx = self.transaction(&[PATROLS, SECTIONS], IdbTransactionMode::Readwrite)?;
        let patrols = tx.object_store(PATROLS).map_err(js_err)?;
        let key = patrol_key(user_id, section_id, patrol_id);
        let existing = patrols.get(&key).map_err(js_err)?.await.map_err(js_err)?;
        let mut row: PatrolRow = existing
            .map(from_js)
            .transpose()?
            .ok_or_else(|| StoreError::PatrolNotFound {
                section_id: section_id.to_string(),
                patrol_id: patrol_id.to_string(),
            })?;
        row.pending_delta += delta;
        patrols.put_key_val(&key, &to_js(&row)?).map_err(js_err)?;

        let sections = tx.object_store(SECTIONS).map_err(js_err)?;
        let skey = section_key(user_id, section_id);
        let mut section: SectionRecord = sections
            .get(&skey)
            .map_err(js_err)?
            .await
            .map_err(js_err)?
            .map(from_js)
            .transpose()?
            .ok_or_else(|| StoreError::SectionNotFound {
                user_id: user_id.to_string(),
                section_id: section_id.to_string(),
            })?;
        section.ui_revision += 1;
        sections.put_key_val(&skey, &to_js(&section)?).map_err(js_err)?;

        tx.await.into_result().map_err(js_err)
    }

    async fn set_canonical_patrol_list(
        &self,
        user_id: &str,
        section_id: &str,
        patrols: Vec<CanonicalPatrol>,
    ) -> Result<(), StoreError> {
        let existing = self.patrols_in_section(user_id, section_id).await?;
        let tx = self.transaction(&[PATROLS, SECTIONS], IdbTransactionMode::Readwrite)?;
        let store = tx.object_store(PATROLS).map_err(js_err)?;

        let listed_ids: std::collections::HashSet<&str> =
            patrols.iter().map(|p| p.id.as_str()).collect();
        for row in &existing {
            if !listed_ids.contains(row.patrol_id.as_str()) {
                store
                    .delete(&patrol_key(user_id, section_id, &row.patrol_id))
                    .map_err(js_err)?;
            }
        }
        let mut by_id: std::collections::HashMap<String, PatrolRow> = existing
            .into_iter()
            .map(|row| (row.patrol_id.clone(), row))
            .collect();

        for canonical in patrols {
            let mut row = by_id.remove(&canonical.id).unwrap_or_else(|| {
                PatrolRow::new(section_id, canonical.id.clone(), canonical.name.clone(), canonical.score)
            });
            row.name = canonical.name;
            row.committed_score = canonical.score;
            let key = patrol_key(user_id, section_id, &canonical.id);
            store.put_key_val(&key, &to_js(&row)?).map_err(js_err)?;
        }

        let sections = tx.object_store(SECTIONS).map_err(js_err)?;
        let skey = section_key(user_id, section_id);
        let mut section: SectionRecord = sections
            .get(&skey)
            .map_err(js_err)?
            .await
            .map_err(js_err)?
            .map(from_js)
            .transpose()?
            .unwrap_or_else(|| SectionRecord::new(user_id, section_id));
        section.last_refresh = Some(Utc::now());
        section.error = None;
        section.ui_revision += 1;
        sections.put_key_val(&skey, &to_js(&section)?).map_err(js_err)?;

        tx.await.into_result().map_err(js_err)
    }

    async fn acquire_pending_for_sync(
        &self,
        user_id: &str,
        section_id: &str,
        lock_duration: Duration,
    ) -> Result<PendingSyncBatch, StoreError> {
        let now = Utc::now();
        let lock_id = Uuid::new_v4();
        let deadline = now + lock_duration;

        let rows = self.patrols_in_section(user_id, section_id).await?;
        let tx = self.transaction(&[PATROLS], IdbTransactionMode::Readwrite)?;
        let store = tx.object_store(PATROLS).map_err(js_err)?;

        let mut entries = Vec::new();
        for mut row in rows {
            if !row.eligible_for_sync(now) {
                continue;
            }
            row.lock_id = Some(lock_id);
            row.lock_timeout = Some(deadline);
            let key = patrol_key(user_id, section_id, &row.patrol_id);
            store.put_key_val(&key, &to_js(&row)?).map_err(js_err)?;
            entries.push(SyncBatchEntry {
                patrol_id: row.patrol_id,
                pending_delta: row.pending_delta,
            });
        }
        tx.await.into_result().map_err(js_err)?;
        Ok(PendingSyncBatch { lock_id, entries })
    }

    async fn release_pending_for_sync(
        &self,
        user_id: &str,
        section_id: &str,
        lock_id: Uuid,
        results: Vec<PatrolSyncResult>,
    ) -> Result<(), StoreError> {
        let tx = self.transaction(&[PATROLS], IdbTransactionMode::Readwrite)?;
        let store = tx.object_store(PATROLS).map_err(js_err)?;
        for result in results {
            let key = patrol_key(user_id, section_id, &result.patrol_id);
            let Some(existing) = store.get(&key).map_err(js_err)?.await.map_err(js_err)? else {
                continue;
            };
            let mut row: PatrolRow = from_js(existing)?;
            if row.lock_id != Some(lock_id) {
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
            store.put_key_val(&key, &to_js(&row)?).map_err(js_err)?;
        }
        tx.await.into_result().map_err(js_err)
    }

    async fn acquire_section_sync_lock(
        &self,
        user_id: &str,
        section_id: &str,
        lock_duration: Duration,
    ) -> Result<Option<Uuid>, StoreError> {
        let tx = self.transaction(&[SECTIONS], IdbTransactionMode::Readwrite)?;
        let store = tx.object_store(SECTIONS).map_err(js_err)?;
        let key = section_key(user_id, section_id);
        let now = Utc::now();
        let mut section: SectionRecord = store
            .get(&key)
            .map_err(js_err)?
            .await
            .map_err(js_err)?
            .map(from_js)
            .transpose()?
            .unwrap_or_else(|| SectionRecord::new(user_id, section_id));

        if let Some(timeout) = section.sync_lock_timeout {
            if timeout > now {
                return Ok(None);
            }
        }

        let lock_id = Uuid::new_v4();
        section.sync_lock_id = Some(lock_id);
        section.sync_lock_timeout = Some(now + lock_duration);
        store.put_key_val(&key, &to_js(&section)?).map_err(js_err)?;
        tx.await.into_result().map_err(js_err)?;
        Ok(Some(lock_id))
    }

    async fn release_section_sync_lock(
        &self,
        user_id: &str,
        section_id: &str,
        lock_id: Uuid,
    ) -> Result<(), StoreError> {
        let tx = self.transaction(&[SECTIONS], IdbTransactionMode::Readwrite)?;
        let store = tx.object_store(SECTIONS).map_err(js_err)?;
        let key = section_key(user_id, section_id);
        let Some(existing) = store.get(&key).map_err(js_err)?.await.map_err(js_err)? else {
            return Ok(());
        };
        let mut section: SectionRecord = from_js(existing)?;
        if section.sync_lock_id != Some(lock_id) {
            return Err(StoreError::LockMismatch {
                section_id: section_id.to_string(),
                lock_id: lock_id.to_string(),
            });
        }
        section.sync_lock_id = None;
        section.sync_lock_timeout = None;
        store.put_key_val(&key, &to_js(&section)?).map_err(js_err)?;
        tx.await.into_result().map_err(js_err)
    }

    async fn get_next_sync_time(
        &self,
        user_id: &str,
        section_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let rows = self.patrols_in_section(user_id, section_id).await?;
        let now = Utc::now();
        let instants = rows
            .into_iter()
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
        let tx = self.transaction(&[SECTIONS], IdbTransactionMode::Readwrite)?;
        let store = tx.object_store(SECTIONS).map_err(js_err)?;
        let key = section_key(user_id, section_id);
        let mut section: SectionRecord = store
            .get(&key)
            .map_err(js_err)?
            .await
            .map_err(js_err)?
            .map(from_js)
            .transpose()?
            .unwrap_or_else(|| SectionRecord::new(user_id, section_id));
        section.last_sync_attempt = Some(Utc::now());
        section.next_retry_time = next;
        store.put_key_val(&key, &to_js(&section)?).map_err(js_err)?;
        tx.await.into_result().map_err(js_err)
    }

    async fn mark_all_pending_as_failed(
        &self,
        user_id: &str,
        section_id: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        let rows = self.patrols_in_section(user_id, section_id).await?;
        let tx = self.transaction(&[PATROLS], IdbTransactionMode::Readwrite)?;
        let store = tx.object_store(PATROLS).map_err(js_err)?;
        let deadline = Utc::now() + Duration::minutes(5);
        for mut row in rows {
            if row.pending_delta == 0 {
                continue;
            }
            row.retry_after = RetryPolicy::After(deadline);
            row.error_message = Some(message.to_string());
            let key = patrol_key(user_id, section_id, &row.patrol_id);
            store.put_key_val(&key, &to_js(&row)?).map_err(js_err)?;
        }
        tx.await.into_result().map_err(js_err)
    }

    async fn clear_permanent_errors(&self, user_id: &str, section_id: &str) -> Result<(), StoreError> {
        let rows = self.patrols_in_section(user_id, section_id).await?;
        let tx = self.transaction(&[PATROLS], IdbTransactionMode::Readwrite)?;
        let store = tx.object_store(PATROLS).map_err(js_err)?;
        for mut row in rows {
            if row.retry_after != RetryPolicy::Permanent {
                continue;
            }
            row.retry_after = RetryPolicy::Ready;
            let key = patrol_key(user_id, section_id, &row.patrol_id);
            store.put_key_val(&key, &to_js(&row)?).map_err(js_err)?;
        }
        tx.await.into_result().map_err(js_err)
    }

    async fn delete_user_data(&self, user_id: &str) -> Result<(), StoreError> {
        let tx = self.transaction(&[SECTIONS, PATROLS, METADATA], IdbTransactionMode::Readwrite)?;
        for name in [SECTIONS, PATROLS] {
            let store = tx.object_store(name).map_err(js_err)?;
            let index = store.index(BY_USER).map_err(js_err)?;
            let range = IdbKeyRange::only(&JsValue::from_str(user_id)).map_err(js_err)?;
            let keys: Vec<JsValue> = index
                .get_all_keys_with_key(&range)
                .map_err(js_err)?
                .await
                .map_err(js_err)?
                .into();
            for key in keys {
                store.delete(&key).map_err(js_err)?;
            }
        }
        tx.object_store(METADATA)
            .map_err(js_err)?
            .delete(&JsValue::from_str(user_id))
            .map_err(js_err)?;
        tx.await.into_result().map_err(js_err)
    }

    async fn get_user_metadata(&self, user_id: &str) -> Result<Option<UserMetadata>, StoreError> {
        let tx = self.transaction(&[METADATA], IdbTransactionMode::Readonly)?;
        let store = tx.object_store(METADATA).map_err(js_err)?;
        let found = store
            .get(&JsValue::from_str(user_id))
            .map_err(js_err)?
            .await
            .map_err(js_err)?;
        found.map(from_js).transpose()
    }

    async fn upsert_user_metadata(&self, metadata: UserMetadata) -> Result<(), StoreError> {
        let tx = self.transaction(&[METADATA], IdbTransactionMode::Readwrite)?;
        let store = tx.object_store(METADATA).map_err(js_err)?;
        let key = JsValue::from_str(&metadata.user_id);
        store.put_key_val(&key, &to_js(&metadata)?).map_err(js_err)?;
        tx.await.into_result().map_err(js_err)
    }
}
