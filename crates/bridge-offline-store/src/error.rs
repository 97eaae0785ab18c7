use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no section record for user {user_id} section {section_id}")]
    SectionNotFound { user_id: String, section_id: String },

    #[error("no patrol row for section {section_id} patrol {patrol_id}")]
    PatrolNotFound { section_id: String, patrol_id: String },

    #[error("sync lock {lock_id} does not hold section {section_id}")]
    LockMismatch { section_id: String, lock_id: String },

    #[error("backend error: {0}")]
    Backend(String),
}
