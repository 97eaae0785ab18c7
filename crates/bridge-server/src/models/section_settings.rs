//! Per-section operator configuration, cached alongside term-discovery state
//! for background (non-device) refresh paths.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct SectionSettings {
    pub section_id: String,
    pub section_name: String,
    pub group_name: Option<String>,
    pub term_id: Option<String>,
    pub term_end_date: Option<DateTime<Utc>>,
    pub term_checked_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SectionSettings {
    /// Same freshness policy as `DeviceCode::term_needs_refresh` (§4.D):
    /// refresh when absent, never checked, checked >24h ago, or within 24h
    /// of the cached term's end date.
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

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SectionSettings {
        SectionSettings {
            section_id: "section-1".into(),
            section_name: "1st Example Troop".into(),
            group_name: None,
            term_id: None,
            term_end_date: None,
            term_checked_at: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_needs_refresh_when_absent() {
        assert!(sample().term_needs_refresh(Utc::now()));
    }

    #[test]
    fn test_fresh_enough() {
        let mut s = sample();
        s.term_id = Some("t1".into());
        s.term_checked_at = Some(Utc::now());
        s.term_end_date = Some(Utc::now() + chrono::Duration::days(10));
        assert!(!s.term_needs_refresh(Utc::now()));
    }
}
