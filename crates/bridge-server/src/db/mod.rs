//! Persistent store (Component B): one repository module per table, each
//! owning its own `CREATE TABLE IF NOT EXISTS` bootstrap, following the
//! free-function-over-`&DbPool` style used throughout this codebase rather
//! than struct-based repositories.

pub mod allowed_client;
pub mod auth_session;
pub mod device_code;
pub mod pool;
pub mod score_audit;
pub mod section_settings;
pub mod user_credential;
pub mod web_session;

pub use pool::DbPool;
