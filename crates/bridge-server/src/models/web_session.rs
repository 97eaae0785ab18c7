//! Long-lived admin-UI session, established by the web OAuth flow.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct WebSession {
    pub session_id: String,
    pub osm_user_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_expires_at: DateTime<Utc>,
    pub csrf_token: String,
    pub selected_section_id: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl WebSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn token_needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.token_expires_at - now < chrono::Duration::minutes(5)
    }
}
