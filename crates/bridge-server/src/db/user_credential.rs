use chrono::{DateTime, Utc};

use crate::db::pool::DbPool;
use crate::error::AppError;
use crate::models::UserCredential;

pub async fn initialize(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_credentials (
            osm_user_id TEXT PRIMARY KEY,
            access_token TEXT NOT NULL,
            refresh_token TEXT NOT NULL,
            token_expires_at TEXT NOT NULL,
            auth_revoked INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn upsert(
    pool: &DbPool,
    osm_user_id: &str,
    access_token: &str,
    refresh_token: &str,
    token_expires_at: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO user_credentials (osm_user_id, access_token, refresh_token, token_expires_at, auth_revoked, updated_at)
        VALUES (?, ?, ?, ?, 0, ?)
        ON CONFLICT(osm_user_id) DO UPDATE SET
            access_token = excluded.access_token,
            refresh_token = excluded.refresh_token,
            token_expires_at = excluded.token_expires_at,
            auth_revoked = 0,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(osm_user_id)
    .bind(access_token)
    .bind(refresh_token)
    .bind(token_expires_at.to_rfc3339())
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn find(pool: &DbPool, osm_user_id: &str) -> Result<Option<UserCredential>, AppError> {
    let row = sqlx::query_as::<_, UserCredential>(
        "SELECT * FROM user_credentials WHERE osm_user_id = ?",
    )
    .bind(osm_user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn mark_revoked(pool: &DbPool, osm_user_id: &str) -> Result<(), AppError> {
    sqlx::query("UPDATE user_credentials SET auth_revoked = 1 WHERE osm_user_id = ?")
        .bind(osm_user_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// List credentials not currently flagged revoked, for the background refresh sweep.
pub async fn list_active(pool: &DbPool) -> Result<Vec<UserCredential>, AppError> {
    let rows = sqlx::query_as::<_, UserCredential>(
        "SELECT * FROM user_credentials WHERE auth_revoked = 0",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::create_pool;

    #[tokio::test]
    async fn test_upsert_and_revoke() {
        let pool = create_pool(":memory:").await.unwrap();
        upsert(&pool, "user-1", "access", "refresh", Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        let cred = find(&pool, "user-1").await.unwrap().unwrap();
        assert!(!cred.auth_revoked);

        mark_revoked(&pool, "user-1").await.unwrap();
        let cred = find(&pool, "user-1").await.unwrap().unwrap();
        assert!(cred.auth_revoked);
        assert!(list_active(&pool).await.unwrap().is_empty());

        upsert(&pool, "user-1", "access2", "refresh2", Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        let cred = find(&pool, "user-1").await.unwrap().unwrap();
        assert!(!cred.auth_revoked, "re-login clears auth_revoked");
    }
}
