//! Immutable audit trail of patrol-point changes applied through the
//! score-update service (Component I).

use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct ScoreAuditRow {
    pub id: i64,
    pub osm_user_id: String,
    pub section_id: String,
    pub patrol_id: String,
    pub patrol_name: String,
    pub previous_score: i64,
    pub new_score: i64,
    pub points_added: i64,
    pub created_at: DateTime<Utc>,
}
