//! Allow-listed device `client_id`s permitted to request device codes.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct AllowedClient {
    pub client_id: String,
    pub comment: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}
