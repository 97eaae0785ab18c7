//! Row shapes for the browser-side offline score store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `retry_after`'s three meanings, kept as a sum type rather than the raw
/// sentinel integers (`0`/`-1`) a JS-facing API would use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// Eligible for the next sync pass right now.
    Ready,
    /// Not eligible until this instant.
    After(DateTime<Utc>),
    /// Will never be retried automatically; needs `clearPermanentErrors`.
    Permanent,
}

impl RetryPolicy {
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self {
            RetryPolicy::Ready => true,
            RetryPolicy::After(at) => *at <= now,
            RetryPolicy::Permanent => false,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Ready
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatrolRow {
    pub section_id: String,
    pub patrol_id: String,
    pub name: String,
    /// Last server-confirmed score.
    pub committed_score: i64,
    /// Locally-queued, not-yet-synced delta on top of `committed_score`.
    pub pending_delta: i64,
    pub lock_id: Option<Uuid>,
    pub lock_timeout: Option<DateTime<Utc>>,
    pub retry_after: RetryPolicy,
    pub error_message: Option<String>,
}

impl PatrolRow {
    pub fn new(section_id: impl Into<String>, patrol_id: impl Into<String>, name: impl Into<String>, committed_score: i64) -> Self {
        Self {
            section_id: section_id.into(),
            patrol_id: patrol_id.into(),
            name: name.into(),
            committed_score,
            pending_delta: 0,
            lock_id: None,
            lock_timeout: None,
            retry_after: RetryPolicy::Ready,
            error_message: None,
        }
    }

    /// Score the UI should display: the last confirmed value plus whatever
    /// is still queued locally.
    pub fn displayed_score(&self) -> i64 {
        self.committed_score + self.pending_delta
    }

    fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lock_timeout.map(|t| t > now).unwrap_or(false)
    }

    /// Eligible for `acquirePendingForSync`: has something to send, is not
    /// currently held by another in-flight sync, and its retry policy
    /// allows it right now.
    pub fn eligible_for_sync(&self, now: DateTime<Utc>) -> bool {
        self.pending_delta != 0 && !self.is_locked(now) && self.retry_after.is_eligible(now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionRecord {
    pub user_id: String,
    pub section_id: String,
    pub last_refresh: Option<DateTime<Utc>>,
    pub ui_revision: u64,
    pub error: Option<String>,
    pub sync_lock_id: Option<Uuid>,
    pub sync_lock_timeout: Option<DateTime<Utc>>,
    pub last_sync_attempt: Option<DateTime<Utc>>,
    pub next_retry_time: Option<DateTime<Utc>>,
}

impl SectionRecord {
    pub fn new(user_id: impl Into<String>, section_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            section_id: section_id.into(),
            last_refresh: None,
            ui_revision: 0,
            error: None,
            sync_lock_id: None,
            sync_lock_timeout: None,
            last_sync_attempt: None,
            next_retry_time: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMetadata {
    pub user_id: String,
    pub sections_list_revision: u64,
    /// Opaque auth-context blob (e.g. the selected section, display name);
    /// this store does not interpret it, only persists it per user.
    pub auth_context: Option<String>,
    pub last_profile_error: Option<String>,
}

impl UserMetadata {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            sections_list_revision: 0,
            auth_context: None,
            last_profile_error: None,
        }
    }
}

/// One entry from an upstream canonical-list refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalPatrol {
    pub id: String,
    pub name: String,
    pub score: i64,
}

/// A `(section, patrols)` snapshot for `getScoresForSection`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionScores {
    pub section: SectionRecord,
    pub patrols: Vec<PatrolRow>,
}

/// One locked row handed back by `acquirePendingForSync`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncBatchEntry {
    pub patrol_id: String,
    pub pending_delta: i64,
}

/// The result of `acquirePendingForSync`: empty `entries` means nothing was
/// eligible, but the lock id is still meaningful to release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSyncBatch {
    pub lock_id: Uuid,
    pub entries: Vec<SyncBatchEntry>,
}

/// What happened to one patrol's queued delta after a sync pass attempted
/// to apply it upstream; reported back through `releasePendingForSync`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PatrolSyncOutcome {
    Success { new_committed_score: i64 },
    TemporaryFailure { message: String },
    PermanentFailure { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatrolSyncResult {
    pub patrol_id: String,
    pub outcome: PatrolSyncOutcome,
}
