use chrono::{DateTime, Utc};

use crate::db::pool::DbPool;
use crate::error::AppError;
use crate::models::DeviceCode;

pub async fn initialize(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS device_codes (
            device_code TEXT PRIMARY KEY,
            user_code TEXT NOT NULL UNIQUE,
            client_id TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            origin_ip TEXT,
            origin_country TEXT,
            section_id TEXT,
            osm_user_id TEXT,
            access_token TEXT,
            refresh_token TEXT,
            token_expires_at TEXT,
            device_access_token TEXT UNIQUE,
            last_used_at TEXT,
            term_id TEXT,
            term_end_date TEXT,
            term_checked_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_device_codes_user_code ON device_codes(user_code)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_device_codes_access_token ON device_codes(device_access_token)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_device_codes_expires_at ON device_codes(expires_at)")
        .execute(pool)
        .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn create(
    pool: &DbPool,
    device_code: &str,
    user_code: &str,
    client_id: &str,
    expires_at: DateTime<Utc>,
    origin_ip: Option<&str>,
    origin_country: Option<&str>,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO device_codes
            (device_code, user_code, client_id, status, created_at, expires_at, origin_ip, origin_country)
        VALUES (?, ?, ?, 'pending', ?, ?, ?, ?)
        "#,
    )
    .bind(device_code)
    .bind(user_code)
    .bind(client_id)
    .bind(Utc::now().to_rfc3339())
    .bind(expires_at.to_rfc3339())
    .bind(origin_ip)
    .bind(origin_country)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn find_by_device_code(
    pool: &DbPool,
    device_code: &str,
) -> Result<Option<DeviceCode>, AppError> {
    let row = sqlx::query_as::<_, DeviceCode>(
        "SELECT * FROM device_codes WHERE device_code = ?",
    )
    .bind(device_code)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn find_by_user_code(
    pool: &DbPool,
    user_code: &str,
) -> Result<Option<DeviceCode>, AppError> {
    let row = sqlx::query_as::<_, DeviceCode>(
        "SELECT * FROM device_codes WHERE user_code = ? COLLATE NOCASE",
    )
    .bind(user_code)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn find_by_device_access_token(
    pool: &DbPool,
    token: &str,
) -> Result<Option<DeviceCode>, AppError> {
    let row = sqlx::query_as::<_, DeviceCode>(
        "SELECT * FROM device_codes WHERE device_access_token = ?",
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn deny(pool: &DbPool, device_code: &str) -> Result<(), AppError> {
    sqlx::query("UPDATE device_codes SET status = 'denied' WHERE device_code = ?")
        .bind(device_code)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_expired(pool: &DbPool, device_code: &str) -> Result<(), AppError> {
    sqlx::query("UPDATE device_codes SET status = 'expired' WHERE device_code = ?")
        .bind(device_code)
        .execute(pool)
        .await?;
    Ok(())
}

/// Transition pending -> awaiting_section after the upstream OAuth exchange.
pub async fn set_awaiting_section(
    pool: &DbPool,
    device_code: &str,
    osm_user_id: &str,
    access_token: &str,
    refresh_token: &str,
    token_expires_at: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE device_codes
        SET status = 'awaiting_section', osm_user_id = ?, access_token = ?,
            refresh_token = ?, token_expires_at = ?
        WHERE device_code = ?
        "#,
    )
    .bind(osm_user_id)
    .bind(access_token)
    .bind(refresh_token)
    .bind(token_expires_at.to_rfc3339())
    .bind(device_code)
    .execute(pool)
    .await?;
    Ok(())
}

/// Transition awaiting_section -> authorized once a section has been chosen.
pub async fn authorize(
    pool: &DbPool,
    device_code: &str,
    section_id: &str,
    device_access_token: &str,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE device_codes
        SET status = 'authorized', section_id = ?, device_access_token = ?
        WHERE device_code = ?
        "#,
    )
    .bind(section_id)
    .bind(device_access_token)
    .bind(device_code)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn update_tokens(
    pool: &DbPool,
    device_code: &str,
    access_token: &str,
    refresh_token: &str,
    token_expires_at: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE device_codes
        SET access_token = ?, refresh_token = ?, token_expires_at = ?
        WHERE device_code = ?
        "#,
    )
    .bind(access_token)
    .bind(refresh_token)
    .bind(token_expires_at.to_rfc3339())
    .bind(device_code)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn update_term_cache(
    pool: &DbPool,
    device_code: &str,
    term_id: &str,
    term_end_date: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE device_codes
        SET term_id = ?, term_end_date = ?, term_checked_at = ?
        WHERE device_code = ?
        "#,
    )
    .bind(term_id)
    .bind(term_end_date.to_rfc3339())
    .bind(Utc::now().to_rfc3339())
    .bind(device_code)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn touch_last_used(pool: &DbPool, device_code: &str) -> Result<(), AppError> {
    sqlx::query("UPDATE device_codes SET last_used_at = ? WHERE device_code = ?")
        .bind(Utc::now().to_rfc3339())
        .bind(device_code)
        .execute(pool)
        .await?;
    Ok(())
}

/// Reap device codes past expiry that never reached a terminal state.
/// Returns the number of rows transitioned to `expired`.
pub async fn expire_stale(pool: &DbPool) -> Result<u64, AppError> {
    let result = sqlx::query(
        r#"
        UPDATE device_codes SET status = 'expired'
        WHERE expires_at <= ? AND status IN ('pending', 'awaiting_section')
        "#,
    )
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Permanently delete device codes that reached a terminal state more than
/// `older_than` ago, bounding table growth.
pub async fn delete_terminal_older_than(
    pool: &DbPool,
    older_than: chrono::Duration,
) -> Result<u64, AppError> {
    let cutoff = (Utc::now() - older_than).to_rfc3339();
    let result = sqlx::query(
        r#"
        DELETE FROM device_codes
        WHERE status IN ('denied', 'expired') AND expires_at <= ?
        "#,
    )
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::create_pool;

    #[tokio::test]
    async fn test_create_and_find() {
        let pool = create_pool(":memory:").await.unwrap();
        create(
            &pool,
            "dc1",
            "ABCD-EFGH",
            "client-a",
            Utc::now() + chrono::Duration::seconds(600),
            Some("1.2.3.4"),
            Some("GB"),
        )
        .await
        .unwrap();

        let found = find_by_device_code(&pool, "dc1").await.unwrap().unwrap();
        assert_eq!(found.user_code, "ABCD-EFGH");
        assert_eq!(found.status(), crate::models::DeviceCodeStatus::Pending);

        let by_user_code = find_by_user_code(&pool, "abcd-efgh").await.unwrap().unwrap();
        assert_eq!(by_user_code.device_code, "dc1");
    }

    #[tokio::test]
    async fn test_full_transition_sequence() {
        let pool = create_pool(":memory:").await.unwrap();
        create(
            &pool,
            "dc1",
            "ABCD-EFGH",
            "client-a",
            Utc::now() + chrono::Duration::seconds(600),
            None,
            None,
        )
        .await
        .unwrap();

        set_awaiting_section(
            &pool,
            "dc1",
            "user-1",
            "access-tok",
            "refresh-tok",
            Utc::now() + chrono::Duration::hours(1),
        )
        .await
        .unwrap();
        let dc = find_by_device_code(&pool, "dc1").await.unwrap().unwrap();
        assert_eq!(dc.status(), crate::models::DeviceCodeStatus::AwaitingSection);
        assert_eq!(dc.osm_user_id.as_deref(), Some("user-1"));

        authorize(&pool, "dc1", "section-1", "device-access-tok").await.unwrap();
        let dc = find_by_device_code(&pool, "dc1").await.unwrap().unwrap();
        assert_eq!(dc.status(), crate::models::DeviceCodeStatus::Authorized);
        assert_eq!(dc.device_access_token.as_deref(), Some("device-access-tok"));

        let by_token = find_by_device_access_token(&pool, "device-access-tok")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_token.device_code, "dc1");
    }

    #[tokio::test]
    async fn test_expire_stale() {
        let pool = create_pool(":memory:").await.unwrap();
        create(
            &pool,
            "dc1",
            "ABCD-EFGH",
            "client-a",
            Utc::now() - chrono::Duration::seconds(1),
            None,
            None,
        )
        .await
        .unwrap();
        let expired = expire_stale(&pool).await.unwrap();
        assert_eq!(expired, 1);
        let dc = find_by_device_code(&pool, "dc1").await.unwrap().unwrap();
        assert_eq!(dc.status(), crate::models::DeviceCodeStatus::Expired);
    }
}
