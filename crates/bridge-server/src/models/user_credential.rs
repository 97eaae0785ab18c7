//! Per-user persistent upstream credential, used by background work that must
//! outlive any single web session (cache refresh sweeps, retried score updates).

use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct UserCredential {
    pub osm_user_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_expires_at: DateTime<Utc>,
    pub auth_revoked: bool,
    pub updated_at: DateTime<Utc>,
}

impl UserCredential {
    pub fn token_needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.token_expires_at - now < chrono::Duration::minutes(5)
    }
}
