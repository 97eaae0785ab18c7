//! Client-side offline-first score store for the admin UI (Component J).
//!
//! Keeps an optimistic, per-user local copy of section/patrol scores so the
//! UI can apply score changes immediately and replay them against
//! `bridge-server`'s `/api/admin/sections/{id}/scores` surface once a sync
//! pass runs. The `Storage` trait in [`storage`] carries all I/O; the
//! locking, retry, and batching-window rules are plain functions over it so
//! they are identical, and testable, on every backend.

pub mod error;
pub mod memory;
pub mod model;
pub mod storage;

#[cfg(target_arch = "wasm32")]
pub mod indexeddb;

pub use error::StoreError;
pub use memory::InMemoryStorage;
pub use model::{
    CanonicalPatrol, PatrolRow, PatrolSyncOutcome, PatrolSyncResult, PendingSyncBatch,
    RetryPolicy, SectionRecord, SectionScores, SyncBatchEntry, UserMetadata,
};
pub use storage::{next_sync_time, Storage, BATCHING_WINDOW};

#[cfg(target_arch = "wasm32")]
pub use indexeddb::IndexedDbStorage;
