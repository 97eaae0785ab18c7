use chrono::Utc;

use crate::db::pool::DbPool;
use crate::error::AppError;
use crate::models::AllowedClient;

pub async fn initialize(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS allowed_clients (
            client_id TEXT PRIMARY KEY,
            comment TEXT,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn find(pool: &DbPool, client_id: &str) -> Result<Option<AllowedClient>, AppError> {
    let row = sqlx::query_as::<_, AllowedClient>(
        "SELECT client_id, comment, enabled, created_at FROM allowed_clients WHERE client_id = ?",
    )
    .bind(client_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn is_allowed(pool: &DbPool, client_id: &str) -> Result<bool, AppError> {
    Ok(find(pool, client_id).await?.map(|c| c.enabled).unwrap_or(false))
}

pub async fn upsert(
    pool: &DbPool,
    client_id: &str,
    comment: Option<&str>,
    enabled: bool,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO allowed_clients (client_id, comment, enabled, created_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(client_id) DO UPDATE SET comment = excluded.comment, enabled = excluded.enabled
        "#,
    )
    .bind(client_id)
    .bind(comment)
    .bind(enabled)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list(pool: &DbPool) -> Result<Vec<AllowedClient>, AppError> {
    let rows = sqlx::query_as::<_, AllowedClient>(
        "SELECT client_id, comment, enabled, created_at FROM allowed_clients ORDER BY client_id",
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
    async fn test_upsert_and_is_allowed() {
        let pool = create_pool(":memory:").await.unwrap();
        assert!(!is_allowed(&pool, "client-a").await.unwrap());
        upsert(&pool, "client-a", Some("test"), true).await.unwrap();
        assert!(is_allowed(&pool, "client-a").await.unwrap());
        upsert(&pool, "client-a", Some("test"), false).await.unwrap();
        assert!(!is_allowed(&pool, "client-a").await.unwrap());
    }
}
