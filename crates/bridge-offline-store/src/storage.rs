//! Component J: the `Storage` trait and the backend-agnostic scheduling
//! logic built on top of it.
//!
//! Grounded on the `Cache` trait (`cache/mod.rs`): an `async_trait` with one
//! implementation per backend, the trait carrying only I/O, with any pure
//! algorithm factored out as a free function so it is identical across
//! backends and testable without either of them.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{
    CanonicalPatrol, PatrolSyncResult, PendingSyncBatch, SectionScores, UserMetadata,
};

/// A 30-second window used to coalesce nearby retry instants into a single
/// scheduled sync pass rather than firing one pass per patrol.
pub const BATCHING_WINDOW: Duration = Duration::seconds(30);

#[async_trait(?Send)]
pub trait Storage {
    async fn get_scores_for_section(
        &self,
        user_id: &str,
        section_id: &str,
    ) -> Result<Option<SectionScores>, StoreError>;

    /// Adds `delta` to the named patrol's queued change. The row MUST
    /// already exist (created by a prior `set_canonical_patrol_list` call).
    async fn add_pending_points(
        &self,
        user_id: &str,
        section_id: &str,
        patrol_id: &str,
        delta: i64,
    ) -> Result<(), StoreError>;

    /// Reconciles the section's rows against an authoritative upstream list:
    /// upserts `committed_score`/`name` for listed patrols (preserving
    /// `pending_delta`, locks, and retry state), deletes rows absent from
    /// the list, and bumps `ui_revision`.
    async fn set_canonical_patrol_list(
        &self,
        user_id: &str,
        section_id: &str,
        patrols: Vec<CanonicalPatrol>,
    ) -> Result<(), StoreError>;

    /// Locks every row in the section eligible for sync right now (nonzero
    /// pending delta, unlocked, retry policy satisfied) under one fresh
    /// lock id and returns them.
    async fn acquire_pending_for_sync(
        &self,
        user_id: &str,
        section_id: &str,
        lock_duration: Duration,
    ) -> Result<PendingSyncBatch, StoreError>;

    /// Applies sync outcomes and releases the lock. Only rows still
    /// stamped with `lock_id` are touched — a row whose lock already
    /// expired and was re-acquired by someone else is left alone.
    async fn release_pending_for_sync(
        &self,
        user_id: &str,
        section_id: &str,
        lock_id: Uuid,
        results: Vec<PatrolSyncResult>,
    ) -> Result<(), StoreError>;

    /// Cross-tab gate on running a sync pass for a section at all. Returns
    /// `None` if another holder's lock has not yet expired.
    async fn acquire_section_sync_lock(
        &self,
        user_id: &str,
        section_id: &str,
        lock_duration: Duration,
    ) -> Result<Option<Uuid>, StoreError>;

    async fn release_section_sync_lock(
        &self,
        user_id: &str,
        section_id: &str,
        lock_id: Uuid,
    ) -> Result<(), StoreError>;

    /// The next instant a sync pass should run for this section, computed
    /// from every row's `retry_after` via [`next_sync_time`]. `None` when
    /// nothing is scheduled.
    async fn get_next_sync_time(
        &self,
        user_id: &str,
        section_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Records `last_sync_attempt = now` and refreshes `next_retry_time`.
    async fn update_section_sync_timing(
        &self,
        user_id: &str,
        section_id: &str,
    ) -> Result<(), StoreError>;

    /// Sets a five-minute retry backoff and `message` on every row with a
    /// nonzero pending delta; used when a whole sync pass fails
    /// catastrophically (e.g. the network is down).
    async fn mark_all_pending_as_failed(
        &self,
        user_id: &str,
        section_id: &str,
        message: &str,
    ) -> Result<(), StoreError>;

    /// Resets every permanently-failed row back to `Ready`, for an explicit
    /// "force sync" UI action.
    async fn clear_permanent_errors(&self, user_id: &str, section_id: &str) -> Result<(), StoreError>;

    /// Wipes a user's sections and patrols. Does not touch other users.
    async fn delete_user_data(&self, user_id: &str) -> Result<(), StoreError>;

    async fn get_user_metadata(&self, user_id: &str) -> Result<Option<UserMetadata>, StoreError>;

    async fn upsert_user_metadata(&self, metadata: UserMetadata) -> Result<(), StoreError>;
}

/// The batching-window algorithm described in SPEC_FULL.md §4.J: sort the
/// positive retry instants, start a cluster at the soonest one, keep
/// absorbing subsequent instants while each one is within
/// [`BATCHING_WINDOW`] of the cluster's current end, and stop at the first
/// gap wider than that. The cluster's end is the scheduled pass time, since
/// every member must itself be due by then. Never returns a time in the past.
pub fn next_sync_time(mut instants: Vec<DateTime<Utc>>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    instants.sort();
    let mut cursor = *instants.first()?;
    for &instant in instants.iter().skip(1) {
        if instant - cursor <= BATCHING_WINDOW {
            cursor = instant;
        } else {
            break;
        }
    }
    Some(cursor.max(now))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_next_sync_time_empty_is_none() {
        assert_eq!(next_sync_time(vec![], at(1000)), None);
    }

    #[test]
    fn test_next_sync_time_single_instant() {
        assert_eq!(next_sync_time(vec![at(1100)], at(1000)), Some(at(1100)));
    }

    #[test]
    fn test_next_sync_time_absorbs_cluster_within_window() {
        // 1100, 1110, 1125 are all within 30s chained hops of each other.
        let instants = vec![at(1125), at(1100), at(1110)];
        assert_eq!(next_sync_time(instants, at(1000)), Some(at(1125)));
    }

    #[test]
    fn test_next_sync_time_stops_at_gap_wider_than_window() {
        // 1100 and 1110 cluster; 1200 is 90s past 1110, outside the window.
        let instants = vec![at(1100), at(1110), at(1200)];
        assert_eq!(next_sync_time(instants, at(1000)), Some(at(1110)));
    }

    #[test]
    fn test_next_sync_time_never_returns_past() {
        assert_eq!(next_sync_time(vec![at(500)], at(1000)), Some(at(1000)));
    }
}
