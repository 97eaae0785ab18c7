//! SQLite-backed `Cache` implementation, used in production so cache state
//! (notably rate-limit counters and block flags) survives a process restart.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::Cache;
use crate::db::pool::DbPool;
use crate::error::AppError;

/// Create the `cache_entries` table if absent, following the teacher's
/// per-repository bootstrap-on-open convention.
pub async fn initialize(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cache_entries (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            expires_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_cache_entries_expires_at ON cache_entries(expires_at)")
        .execute(pool)
        .await?;

    Ok(())
}

pub struct SqliteCache {
    pool: DbPool,
}

impl SqliteCache {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Cache for SqliteCache {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT value, expires_at FROM cache_entries WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((value, expires_at)) => {
                let expires_at: DateTime<Utc> = expires_at.parse().map_err(|_| {
                    AppError::internal("corrupt cache_entries.expires_at timestamp")
                })?;
                if expires_at > Utc::now() {
                    Ok(Some(value))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError> {
        let expires_at = (Utc::now() + ttl).to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, count, expires_at)
            VALUES (?, ?, 0, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn increment_with_expiry(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<(i64, DateTime<Utc>), AppError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let existing: Option<(i64, String)> =
            sqlx::query_as("SELECT count, expires_at FROM cache_entries WHERE key = ?")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;

        let (count, expires_at) = match existing {
            Some((count, expires_at_str)) => {
                let expires_at: DateTime<Utc> = expires_at_str
                    .parse()
                    .map_err(|_| AppError::internal("corrupt cache_entries.expires_at timestamp"))?;
                if expires_at > now {
                    (count + 1, expires_at)
                } else {
                    (1, now + window)
                }
            }
            None => (1, now + window),
        };

        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, count, expires_at)
            VALUES (?, '', ?, ?)
            ON CONFLICT(key) DO UPDATE SET count = excluded.count, expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(count)
        .bind(expires_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((count, expires_at))
    }

    async fn sweep_expired(&self) -> Result<u64, AppError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
