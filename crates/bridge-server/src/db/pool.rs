//! SQLite connection pool with WAL mode, plus schema bootstrap.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

/// Type alias for the SQLite connection pool.
pub type DbPool = Pool<Sqlite>;

/// Create a new connection pool with WAL mode enabled, and run every
/// repository's `CREATE TABLE IF NOT EXISTS` bootstrap against it.
///
/// `database_url` is either a filesystem path or `:memory:`; in-memory
/// databases are given a single held connection so the schema survives
/// across pool checkouts.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    let db_url = if database_url == ":memory:" {
        "sqlite::memory:".to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let connect_options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_secs(30))
        .pragma("wal_autocheckpoint", "1000")
        .pragma("mmap_size", "67108864");

    let max_connections = if database_url == ":memory:" { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .acquire_timeout(std::time::Duration::from_secs(10))
        .connect_with(connect_options)
        .await?;

    bootstrap_schema(&pool).await?;

    Ok(pool)
}

async fn bootstrap_schema(pool: &DbPool) -> Result<(), sqlx::Error> {
    crate::db::allowed_client::initialize(pool).await?;
    crate::db::device_code::initialize(pool).await?;
    crate::db::auth_session::initialize(pool).await?;
    crate::db::web_session::initialize(pool).await?;
    crate::db::user_credential::initialize(pool).await?;
    crate::db::score_audit::initialize(pool).await?;
    crate::db::section_settings::initialize(pool).await?;
    crate::cache::sqlite::initialize(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_pool_with_wal() {
        let pool = create_pool(":memory:").await.unwrap();

        let mode: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(mode.0.to_lowercase(), "memory");

        let fk: (i64,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(fk.0, 1);
    }

    #[tokio::test]
    async fn test_schema_bootstrap_runs() {
        let pool = create_pool(":memory:").await.unwrap();
        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table'")
                .fetch_all(&pool)
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        assert!(names.contains(&"device_codes"));
        assert!(names.contains(&"user_credentials"));
        assert!(names.contains(&"cache_entries"));
    }
}
