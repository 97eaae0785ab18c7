use chrono::Utc;

use crate::db::pool::DbPool;
use crate::error::AppError;
use crate::models::ScoreAuditRow;

pub async fn initialize(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS score_audit (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            osm_user_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            patrol_id TEXT NOT NULL,
            patrol_name TEXT NOT NULL,
            previous_score INTEGER NOT NULL,
            new_score INTEGER NOT NULL,
            points_added INTEGER NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_score_audit_section ON score_audit(section_id)")
        .execute(pool)
        .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn record(
    pool: &DbPool,
    osm_user_id: &str,
    section_id: &str,
    patrol_id: &str,
    patrol_name: &str,
    previous_score: i64,
    new_score: i64,
    points_added: i64,
) -> Result<i64, AppError> {
    let result = sqlx::query(
        r#"
        INSERT INTO score_audit
            (osm_user_id, section_id, patrol_id, patrol_name, previous_score, new_score, points_added, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(osm_user_id)
    .bind(section_id)
    .bind(patrol_id)
    .bind(patrol_name)
    .bind(previous_score)
    .bind(new_score)
    .bind(points_added)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn list_for_section(
    pool: &DbPool,
    section_id: &str,
    limit: i64,
) -> Result<Vec<ScoreAuditRow>, AppError> {
    let rows = sqlx::query_as::<_, ScoreAuditRow>(
        "SELECT * FROM score_audit WHERE section_id = ? ORDER BY id DESC LIMIT ?",
    )
    .bind(section_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::create_pool;

    #[tokio::test]
    async fn test_record_and_list() {
        let pool = create_pool(":memory:").await.unwrap();
        record(&pool, "user-1", "section-1", "patrol-1", "Eagles", 100, 105, 5)
            .await
            .unwrap();
        let rows = list_for_section(&pool, "section-1", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].points_added, 5);
    }
}
