//! The RFC 8628 device-authorization record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Status of a device code's authorization attempt.
///
/// Transition graph: `Pending -> {AwaitingSection | Denied | Expired}`,
/// `AwaitingSection -> {Authorized | Denied | Expired}`; `Authorized`,
/// `Denied` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCodeStatus {
    Pending,
    AwaitingSection,
    Authorized,
    Denied,
    Expired,
}

impl From<&str> for DeviceCodeStatus {
    fn from(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "awaiting_section" => Self::AwaitingSection,
            "authorized" => Self::Authorized,
            "denied" => Self::Denied,
            "expired" => Self::Expired,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for DeviceCodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::AwaitingSection => write!(f, "awaiting_section"),
            Self::Authorized => write!(f, "authorized"),
            Self::Denied => write!(f, "denied"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// A device's authorization attempt, from `/device/authorize` through to an
/// issued `device_access_token`.
#[derive(Debug, Clone, FromRow)]
pub struct DeviceCode {
    pub device_code: String,
    pub user_code: String,
    pub client_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub origin_ip: Option<String>,
    pub origin_country: Option<String>,
    pub section_id: Option<String>,
    pub osm_user_id: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub device_access_token: Option<String>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub term_id: Option<String>,
    pub term_end_date: Option<DateTime<Utc>>,
    pub term_checked_at: Option<DateTime<Utc>>,
}

impl DeviceCode {
    pub fn status(&self) -> DeviceCodeStatus {
        DeviceCodeStatus::from(self.status.as_str())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether cached term state needs to be refreshed per the freshness
    /// policy: missing, stale (>24h old), or the term is about to end (<24h away).
    pub fn term_needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match (self.term_id.as_ref(), self.term_checked_at, self.term_end_date) {
            (None, _, _) => true,
            (Some(_), None, _) => true,
            (Some(_), Some(checked_at), _) if now - checked_at > chrono::Duration::hours(24) => true,
            (Some(_), Some(_), Some(end_date)) if end_date - now < chrono::Duration::hours(24) => true,
            _ => false,
        }
    }
}

/// Wire representation returned to browsers/devices; never carries upstream tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuthorizationResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub verification_uri_short: String,
    pub expires_in: i64,
    pub interval: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(status: &str) -> DeviceCode {
        DeviceCode {
            device_code: "dc".into(),
            user_code: "ABCD-EFGH".into(),
            client_id: "client".into(),
            status: status.into(),
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(600),
            origin_ip: None,
            origin_country: None,
            section_id: None,
            osm_user_id: None,
            access_token: None,
            refresh_token: None,
            token_expires_at: None,
            device_access_token: None,
            last_used_at: None,
            term_id: None,
            term_end_date: None,
            term_checked_at: None,
        }
    }

    #[test]
    fn test_status_round_trip() {
        assert_eq!(sample("awaiting_section").status(), DeviceCodeStatus::AwaitingSection);
        assert_eq!(DeviceCodeStatus::Authorized.to_string(), "authorized");
    }

    #[test]
    fn test_term_needs_refresh_when_absent() {
        assert!(sample("authorized").term_needs_refresh(Utc::now()));
    }

    #[test]
    fn test_term_needs_refresh_when_near_end() {
        let mut dc = sample("authorized");
        dc.term_id = Some("t1".into());
        dc.term_checked_at = Some(Utc::now());
        dc.term_end_date = Some(Utc::now() + chrono::Duration::hours(1));
        assert!(dc.term_needs_refresh(Utc::now()));
    }

    #[test]
    fn test_term_fresh_enough() {
        let mut dc = sample("authorized");
        dc.term_id = Some("t1".into());
        dc.term_checked_at = Some(Utc::now());
        dc.term_end_date = Some(Utc::now() + chrono::Duration::days(10));
        assert!(!dc.term_needs_refresh(Utc::now()));
    }

    #[test]
    fn test_is_expired() {
        let mut dc = sample("pending");
        dc.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(dc.is_expired(Utc::now()));
    }
}
