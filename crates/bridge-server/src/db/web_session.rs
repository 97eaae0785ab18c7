use chrono::{DateTime, Utc};

use crate::db::pool::DbPool;
use crate::error::AppError;
use crate::models::WebSession;

pub async fn initialize(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS web_sessions (
            session_id TEXT PRIMARY KEY,
            osm_user_id TEXT NOT NULL,
            access_token TEXT NOT NULL,
            refresh_token TEXT NOT NULL,
            token_expires_at TEXT NOT NULL,
            csrf_token TEXT NOT NULL,
            selected_section_id TEXT,
            last_activity TEXT NOT NULL,
            expires_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn create(
    pool: &DbPool,
    session_id: &str,
    osm_user_id: &str,
    access_token: &str,
    refresh_token: &str,
    token_expires_at: DateTime<Utc>,
    csrf_token: &str,
    expires_at: DateTime<Utc>,
) -> Result<(), AppError> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        INSERT INTO web_sessions
            (session_id, osm_user_id, access_token, refresh_token, token_expires_at,
             csrf_token, selected_section_id, last_activity, expires_at)
        VALUES (?, ?, ?, ?, ?, ?, NULL, ?, ?)
        "#,
    )
    .bind(session_id)
    .bind(osm_user_id)
    .bind(access_token)
    .bind(refresh_token)
    .bind(token_expires_at.to_rfc3339())
    .bind(csrf_token)
    .bind(&now)
    .bind(expires_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn find(pool: &DbPool, session_id: &str) -> Result<Option<WebSession>, AppError> {
    let row = sqlx::query_as::<_, WebSession>("SELECT * FROM web_sessions WHERE session_id = ?")
        .bind(session_id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn update_tokens(
    pool: &DbPool,
    session_id: &str,
    access_token: &str,
    refresh_token: &str,
    token_expires_at: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE web_sessions SET access_token = ?, refresh_token = ?, token_expires_at = ? WHERE session_id = ?",
    )
    .bind(access_token)
    .bind(refresh_token)
    .bind(token_expires_at.to_rfc3339())
    .bind(session_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_selected_section(
    pool: &DbPool,
    session_id: &str,
    section_id: &str,
) -> Result<(), AppError> {
    sqlx::query("UPDATE web_sessions SET selected_section_id = ? WHERE session_id = ?")
        .bind(section_id)
        .bind(session_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn touch(pool: &DbPool, session_id: &str) -> Result<(), AppError> {
    sqlx::query("UPDATE web_sessions SET last_activity = ? WHERE session_id = ?")
        .bind(Utc::now().to_rfc3339())
        .bind(session_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete(pool: &DbPool, session_id: &str) -> Result<(), AppError> {
    sqlx::query("DELETE FROM web_sessions WHERE session_id = ?")
        .bind(session_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_expired(pool: &DbPool) -> Result<u64, AppError> {
    let result = sqlx::query("DELETE FROM web_sessions WHERE expires_at <= ?")
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
    async fn test_create_find_update() {
        let pool = create_pool(":memory:").await.unwrap();
        create(
            &pool,
            "s1",
            "user-1",
            "access",
            "refresh",
            Utc::now() + chrono::Duration::hours(1),
            "csrf-1",
            Utc::now() + chrono::Duration::days(7),
        )
        .await
        .unwrap();

        let session = find(&pool, "s1").await.unwrap().unwrap();
        assert_eq!(session.osm_user_id, "user-1");
        assert!(session.selected_section_id.is_none());

        set_selected_section(&pool, "s1", "section-9").await.unwrap();
        let session = find(&pool, "s1").await.unwrap().unwrap();
        assert_eq!(session.selected_section_id.as_deref(), Some("section-9"));
    }
}
