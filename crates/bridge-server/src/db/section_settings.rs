use chrono::{DateTime, Utc};

use crate::db::pool::DbPool;
use crate::error::AppError;
use crate::models::SectionSettings;

pub async fn initialize(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS section_settings (
            section_id TEXT PRIMARY KEY,
            section_name TEXT NOT NULL,
            group_name TEXT,
            term_id TEXT,
            term_end_date TEXT,
            term_checked_at TEXT,
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
    section_id: &str,
    section_name: &str,
    group_name: Option<&str>,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO section_settings (section_id, section_name, group_name, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(section_id) DO UPDATE SET
            section_name = excluded.section_name,
            group_name = excluded.group_name,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(section_id)
    .bind(section_name)
    .bind(group_name)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn update_term_cache(
    pool: &DbPool,
    section_id: &str,
    term_id: &str,
    term_end_date: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE section_settings
        SET term_id = ?, term_end_date = ?, term_checked_at = ?
        WHERE section_id = ?
        "#,
    )
    .bind(term_id)
    .bind(term_end_date.to_rfc3339())
    .bind(Utc::now().to_rfc3339())
    .bind(section_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn find(pool: &DbPool, section_id: &str) -> Result<Option<SectionSettings>, AppError> {
    let row = sqlx::query_as::<_, SectionSettings>(
        "SELECT * FROM section_settings WHERE section_id = ?",
    )
    .bind(section_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::create_pool;

    #[tokio::test]
    async fn test_upsert_and_find() {
        let pool = create_pool(":memory:").await.unwrap();
        upsert(&pool, "section-1", "1st Example Troop", Some("1st Example Group"))
            .await
            .unwrap();
        let settings = find(&pool, "section-1").await.unwrap().unwrap();
        assert_eq!(settings.section_name, "1st Example Troop");
        assert!(settings.term_id.is_none());
    }
}
