use chrono::{DateTime, Utc};

use crate::db::pool::DbPool;
use crate::error::AppError;
use crate::models::AuthorizationSession;

pub async fn initialize(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS auth_sessions (
            session_id TEXT PRIMARY KEY,
            device_code TEXT NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn create(
    pool: &DbPool,
    session_id: &str,
    device_code: &str,
    expires_at: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO auth_sessions (session_id, device_code, created_at, expires_at) VALUES (?, ?, ?, ?)",
    )
    .bind(session_id)
    .bind(device_code)
    .bind(Utc::now().to_rfc3339())
    .bind(expires_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn find(pool: &DbPool, session_id: &str) -> Result<Option<AuthorizationSession>, AppError> {
    let row = sqlx::query_as::<_, AuthorizationSession>(
        "SELECT * FROM auth_sessions WHERE session_id = ?",
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn delete(pool: &DbPool, session_id: &str) -> Result<(), AppError> {
    sqlx::query("DELETE FROM auth_sessions WHERE session_id = ?")
        .bind(session_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_expired(pool: &DbPool) -> Result<u64, AppError> {
    let result = sqlx::query("DELETE FROM auth_sessions WHERE expires_at <= ?")
        .bind(Utc::now().to_rfc3339())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::create_pool;

    #[tokio::test]
    async fn test_create_find_delete() {
        let pool = create_pool(":memory:").await.unwrap();
        create(&pool, "s1", "dc1", Utc::now() + chrono::Duration::minutes(15))
            .await
            .unwrap();
        assert!(find(&pool, "s1").await.unwrap().is_some());
        delete(&pool, "s1").await.unwrap();
        assert!(find(&pool, "s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_expired() {
        let pool = create_pool(":memory:").await.unwrap();
        create(&pool, "s1", "dc1", Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();
        create(&pool, "s2", "dc2", Utc::now() + chrono::Duration::minutes(15))
            .await
            .unwrap();
        let deleted = delete_expired(&pool).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(find(&pool, "s2").await.unwrap().is_some());
    }
}
