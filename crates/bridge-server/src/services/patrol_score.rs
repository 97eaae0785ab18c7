//! Component H: the patrol-score read path.
//!
//! Grounded on the companion server's `companion_api` handler shape
//! (`State`/`Query` extractors, centralized error mapping) combined with
//! `gitlab_client`'s fetch-then-cache loop, generalised to the
//! block-check -> cache-probe -> term-check -> fetch -> TTL-store pipeline
//! SPEC_FULL.md §4.H specifies.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::Cache;
use crate::db::pool::DbPool;
use crate::db::{device_code, section_settings, user_credential};
use crate::error::AppError;
use crate::models::{DeviceCodeStatus, Principal};
use crate::services::block_guard::ensure_not_blocked;
use crate::services::token_refresh;
use crate::services::upstream_client::{Patrol, UpstreamClient};

pub struct PatrolScoreService {
    pool: DbPool,
    cache: Arc<dyn Cache>,
    upstream: Arc<UpstreamClient>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatrolScoresResponse {
    pub patrols: Vec<Patrol>,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip)]
    pub from_cache: bool,
}

impl PatrolScoreService {
    pub fn new(pool: DbPool, cache: Arc<dyn Cache>, upstream: Arc<UpstreamClient>) -> Self {
        Self { pool, cache, upstream }
    }

    /// Serve the patrol list for a device, honoring cache, block gates and
    /// the adaptive TTL. `device_code_value` is the device's own opaque
    /// `device_code` (not the issued `device_access_token`), resolved by the
    /// caller via `device_code::find_by_device_access_token` first.
    pub async fn get_scores_for_device(
        &self,
        device_code_value: &str,
    ) -> Result<PatrolScoresResponse, AppError> {
        let mut record = device_code::find_by_device_code(&self.pool, device_code_value)
            .await?
            .ok_or_else(|| AppError::not_found("device code"))?;

        if record.status() != DeviceCodeStatus::Authorized {
            return Err(AppError::authentication("device is not authorized"));
        }
        let section_id = record
            .section_id
            .clone()
            .ok_or_else(|| AppError::invalid_input("section_not_configured"))?;
        let osm_user_id = record
            .osm_user_id
            .clone()
            .ok_or_else(|| AppError::internal("authorized device code missing osm_user_id"))?;

        ensure_not_blocked(self.cache.as_ref(), &osm_user_id).await?;

        let cache_key = format!("patrol_scores:{device_code_value}");
        if let Some(raw) = self.cache.get(&cache_key).await? {
            let mut cached: PatrolScoresResponse = serde_json::from_str(&raw)?;
            cached.from_cache = true;
            return Ok(cached);
        }

        let principal = Principal::from_device_code(&record)
            .ok_or_else(|| AppError::internal("authorized device code missing upstream credential fields"))?;
        let access_token = self.ensure_fresh_token(&principal).await?;

        let now = Utc::now();
        if record.term_needs_refresh(now) {
            let term = self
                .upstream
                .fetch_active_term_for_section(&access_token, &osm_user_id, &section_id)
                .await?;
            let term_end_date = term
                .enddate
                .and_hms_opt(23, 59, 59)
                .expect("valid time components")
                .and_utc();
            device_code::update_term_cache(&self.pool, device_code_value, &term.term_id, term_end_date).await?;
            record.term_id = Some(term.term_id);
        }
        let term_id = record
            .term_id
            .clone()
            .ok_or_else(|| AppError::internal("term discovery did not populate term_id"))?;

        let patrols = self
            .upstream
            .fetch_patrol_scores(&access_token, &osm_user_id, &section_id, &term_id)
            .await?;

        let ttl = adaptive_ttl(self.remaining_quota(&osm_user_id).await?);
        let response = PatrolScoresResponse {
            patrols,
            cached_at: now,
            expires_at: now + ttl,
            from_cache: false,
        };
        self.cache
            .set_with_ttl(&cache_key, &serde_json::to_string(&response)?, ttl)
            .await?;
        Ok(response)
    }

    /// Serve the patrol list for the admin UI. Unlike the device path, term
    /// discovery state is cached on `SectionSettings` rather than a
    /// DeviceCode, since the admin caller is not bound to one device.
    pub async fn get_scores_for_section(
        &self,
        principal: &Principal,
        section_id: &str,
    ) -> Result<PatrolScoresResponse, AppError> {
        ensure_not_blocked(self.cache.as_ref(), principal.osm_user_id()).await?;

        let cache_key = format!("patrol_scores:section:{section_id}");
        if let Some(raw) = self.cache.get(&cache_key).await? {
            let mut cached: PatrolScoresResponse = serde_json::from_str(&raw)?;
            cached.from_cache = true;
            return Ok(cached);
        }

        let mut settings = section_settings::find(&self.pool, section_id)
            .await?
            .ok_or_else(|| AppError::SectionNotFound {
                section_id: section_id.to_string(),
            })?;

        let access_token = self.ensure_fresh_token(principal).await?;

        let now = Utc::now();
        if settings.term_needs_refresh(now) {
            let term = self
                .upstream
                .fetch_active_term_for_section(&access_token, principal.osm_user_id(), section_id)
                .await?;
            let term_end_date = term
                .enddate
                .and_hms_opt(23, 59, 59)
                .expect("valid time components")
                .and_utc();
            section_settings::update_term_cache(&self.pool, section_id, &term.term_id, term_end_date).await?;
            settings.term_id = Some(term.term_id);
        }
        let term_id = settings
            .term_id
            .clone()
            .ok_or_else(|| AppError::internal("term discovery did not populate term_id"))?;

        let patrols = self
            .upstream
            .fetch_patrol_scores(&access_token, principal.osm_user_id(), section_id, &term_id)
            .await?;

        let ttl = adaptive_ttl(self.remaining_quota(principal.osm_user_id()).await?);
        let response = PatrolScoresResponse {
            patrols,
            cached_at: now,
            expires_at: now + ttl,
            from_cache: false,
        };
        self.cache
            .set_with_ttl(&cache_key, &serde_json::to_string(&response)?, ttl)
            .await?;
        Ok(response)
    }

    /// Refresh `principal`'s upstream access token if it is within the
    /// 5-minute threshold. A device principal persists the refreshed tokens
    /// to both its DeviceCode row and the shared `UserCredential`; a user
    /// principal (admin UI) persists only to `UserCredential`, since a web
    /// session's own copy is refreshed by the caller that owns the cookie.
    async fn ensure_fresh_token(&self, principal: &Principal) -> Result<String, AppError> {
        if !principal.needs_refresh(Utc::now()) {
            return Ok(principal.access_token().to_string());
        }
        let osm_user_id = principal.osm_user_id().to_string();
        let device_code_value = match principal {
            Principal::Device { device_code, .. } => Some(device_code.clone()),
            Principal::User { .. } => None,
        };
        let pool = self.pool.clone();
        let pool_revoke = self.pool.clone();
        let osm_user_id_revoke = osm_user_id.clone();
        token_refresh::refresh_token(
            &self.upstream,
            principal.refresh_token(),
            move |access, refresh, expiry| {
                let pool = pool.clone();
                let device_code_value = device_code_value.clone();
                let osm_user_id = osm_user_id.clone();
                async move {
                    if let Some(device_code_value) = device_code_value {
                        device_code::update_tokens(&pool, &device_code_value, &access, &refresh, expiry).await?;
                    }
                    user_credential::upsert(&pool, &osm_user_id, &access, &refresh, expiry).await?;
                    Ok(())
                }
            },
            move || {
                let pool = pool_revoke.clone();
                let osm_user_id = osm_user_id_revoke.clone();
                async move {
                    user_credential::mark_revoked(&pool, &osm_user_id).await?;
                    Ok(())
                }
            },
        )
        .await
    }

    async fn remaining_quota(&self, osm_user_id: &str) -> Result<Option<i64>, AppError> {
        let raw = self.cache.get(&format!("rate_limit:{osm_user_id}")).await?;
        Ok(raw.and_then(|v| serde_json::from_str::<(i64, i64, String)>(&v).ok()).map(|(_, remaining, _)| remaining))
    }
}

/// Adaptive TTL bands from SPEC_FULL.md §4.H, monotone in `remaining`.
/// Unknown quota (no rate-limit header observed yet) defaults to the most
/// generous band: there is no evidence of scarcity yet.
fn adaptive_ttl(remaining: Option<i64>) -> chrono::Duration {
    match remaining {
        Some(r) if r < 20 => chrono::Duration::minutes(30),
        Some(r) if r < 100 => chrono::Duration::minutes(15),
        Some(r) if r < 200 => chrono::Duration::minutes(10),
        _ => chrono::Duration::minutes(5),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adaptive_ttl_bands() {
        assert_eq!(adaptive_ttl(Some(5)), chrono::Duration::minutes(30));
        assert_eq!(adaptive_ttl(Some(19)), chrono::Duration::minutes(30));
        assert_eq!(adaptive_ttl(Some(20)), chrono::Duration::minutes(15));
        assert_eq!(adaptive_ttl(Some(99)), chrono::Duration::minutes(15));
        assert_eq!(adaptive_ttl(Some(100)), chrono::Duration::minutes(10));
        assert_eq!(adaptive_ttl(Some(199)), chrono::Duration::minutes(10));
        assert_eq!(adaptive_ttl(Some(200)), chrono::Duration::minutes(5));
        assert_eq!(adaptive_ttl(None), chrono::Duration::minutes(5));
    }

    #[test]
    fn test_ttl_monotone_in_remaining() {
        let samples = [5, 19, 20, 99, 100, 199, 200, 1000];
        let ttls: Vec<_> = samples.iter().map(|r| adaptive_ttl(Some(*r))).collect();
        for window in ttls.windows(2) {
            assert!(window[0] >= window[1], "TTL must be non-increasing in remaining quota");
        }
    }
}
