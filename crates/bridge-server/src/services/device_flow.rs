//! Component F: the RFC 8628 device-authorization state machine.
//!
//! The state machine itself is grounded on `other_examples`'
//! rustaxum device-authorization service (create/poll/authorize/revoke,
//! single-use codes), adapted from Diesel to sqlx and from that example's
//! simpler boolean `user_authorized`/`revoked` pair to this spec's five-state
//! enum with an explicit `awaiting_section` state the example doesn't need.

use std::sync::Arc;

use chrono::Utc;
use rand::RngCore;

use crate::cache::Cache;
use crate::config::Config;
use crate::db::pool::DbPool;
use crate::db::{allowed_client, auth_session, device_code, section_settings, user_credential};
use crate::error::{AppError, DeviceFlowError};
use crate::models::device_code::DeviceAuthorizationResponse;
use crate::services::rate_limiter::RateLimiter;
use crate::services::upstream_client::{SectionInfo, UpstreamClient};
use crate::services::user_code;

pub struct DeviceFlowService {
    pool: DbPool,
    cache: Arc<dyn Cache>,
    rate_limiter: RateLimiter,
    upstream: Arc<UpstreamClient>,
    config: Arc<Config>,
}

/// Data rendered on the browser confirmation page. HTML templating of this
/// data is an external collaborator (see SPEC_FULL.md §1).
#[derive(Debug, Clone)]
pub struct ConfirmationPageData {
    pub session_id: String,
    pub user_code: String,
    pub device_ip: Option<String>,
    pub device_country: Option<String>,
    pub browser_country: Option<String>,
    pub country_mismatch: bool,
}

#[derive(Debug, Clone)]
pub struct SectionChoice {
    pub section_id: String,
    pub section_name: String,
    pub group_name: Option<String>,
}

pub enum TokenPollOutcome {
    Authorized { access_token: String, expires_in: i64 },
    Pending(DeviceFlowError),
}

fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, buf)
}

impl DeviceFlowService {
    pub fn new(
        pool: DbPool,
        cache: Arc<dyn Cache>,
        rate_limiter: RateLimiter,
        upstream: Arc<UpstreamClient>,
        config: Arc<Config>,
    ) -> Self {
        Self { pool, cache, rate_limiter, upstream, config }
    }

    pub async fn authorize(
        &self,
        client_id: &str,
        origin_ip: Option<&str>,
        origin_country: Option<&str>,
    ) -> Result<DeviceAuthorizationResponse, AppError> {
        if let Some(ip) = origin_ip {
            self.rate_limiter
                .enforce(
                    "device_authorize",
                    ip,
                    self.config.device_authorize_limit_per_min as i64,
                    chrono::Duration::minutes(1),
                )
                .await?;
        }

        if !allowed_client::is_allowed(&self.pool, client_id).await? {
            return Err(AppError::authentication("client is not registered"));
        }

        let device_code_value = random_token(32);
        let mut user_code_value = user_code::generate();
        // Extremely unlikely collision loop, bounded to avoid an infinite loop.
        for _ in 0..5 {
            if device_code::find_by_user_code(&self.pool, &user_code_value).await?.is_none() {
                break;
            }
            user_code_value = user_code::generate();
        }

        let expires_at = Utc::now() + chrono::Duration::from_std(self.config.device_code_ttl).unwrap();
        device_code::create(
            &self.pool,
            &device_code_value,
            &user_code_value,
            client_id,
            expires_at,
            origin_ip,
            origin_country,
        )
        .await?;

        let short = user_code::to_short_form(&user_code_value);
        Ok(DeviceAuthorizationResponse {
            device_code: device_code_value,
            user_code: user_code_value,
            verification_uri: format!("https://{}/device", self.config.external_domain),
            verification_uri_complete: format!(
                "https://{}/device?user_code={}",
                self.config.external_domain, short
            ),
            verification_uri_short: format!("https://{}/d/{}", self.config.external_domain, short),
            expires_in: self.config.device_code_ttl.as_secs() as i64,
            interval: self.config.device_poll_interval.as_secs() as i64,
        })
    }

    pub async fn poll_token(&self, device_code_value: &str) -> Result<TokenPollOutcome, AppError> {
        self.rate_limiter
            .enforce(
                "device_poll",
                device_code_value,
                1,
                chrono::Duration::from_std(self.config.device_poll_interval).unwrap(),
            )
            .await
            .map_err(|_| AppError::device_flow(DeviceFlowError::SlowDown))?;

        let record = device_code::find_by_device_code(&self.pool, device_code_value)
            .await?
            .ok_or_else(|| AppError::device_flow(DeviceFlowError::InvalidGrant))?;

        if record.is_expired(Utc::now()) && record.status() != crate::models::DeviceCodeStatus::Authorized {
            device_code::mark_expired(&self.pool, device_code_value).await?;
            return Ok(TokenPollOutcome::Pending(DeviceFlowError::ExpiredToken));
        }

        device_code::touch_last_used(&self.pool, device_code_value).await?;

        match record.status() {
            crate::models::DeviceCodeStatus::Pending | crate::models::DeviceCodeStatus::AwaitingSection => {
                Ok(TokenPollOutcome::Pending(DeviceFlowError::AuthorizationPending))
            }
            crate::models::DeviceCodeStatus::Denied => Ok(TokenPollOutcome::Pending(DeviceFlowError::AccessDenied)),
            crate::models::DeviceCodeStatus::Expired => Ok(TokenPollOutcome::Pending(DeviceFlowError::ExpiredToken)),
            crate::models::DeviceCodeStatus::Authorized => {
                let access_token = record
                    .device_access_token
                    .clone()
                    .ok_or_else(|| AppError::internal("authorized device code missing device_access_token"))?;
                let expires_in = record
                    .token_expires_at
                    .map(|exp| (exp - Utc::now()).num_seconds().max(0))
                    .unwrap_or(0);
                Ok(TokenPollOutcome::Authorized { access_token, expires_in })
            }
        }
    }

    pub async fn begin_verification(
        &self,
        raw_user_code: &str,
        browser_ip: &str,
        browser_country: Option<&str>,
    ) -> Result<ConfirmationPageData, AppError> {
        self.rate_limiter
            .enforce(
                "code_entry",
                browser_ip,
                self.config.code_entry_limit_per_10s as i64,
                chrono::Duration::seconds(10),
            )
            .await?;

        let normalized = user_code::normalize(raw_user_code)
            .ok_or_else(|| AppError::invalid_input_field("malformed user code", "user_code"))?;

        let record = device_code::find_by_user_code(&self.pool, &normalized)
            .await?
            .ok_or_else(|| AppError::not_found("device code"))?;

        if record.status() != crate::models::DeviceCodeStatus::Pending {
            return Err(AppError::invalid_input("device code is not awaiting confirmation"));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        auth_session::create(
            &self.pool,
            &session_id,
            &record.device_code,
            Utc::now() + chrono::Duration::minutes(15),
        )
        .await?;

        let country_mismatch = match (&record.origin_country, browser_country) {
            (Some(a), Some(b)) => a != b,
            _ => false,
        };

        Ok(ConfirmationPageData {
            session_id,
            user_code: normalized,
            device_ip: record.origin_ip,
            device_country: record.origin_country,
            browser_country: browser_country.map(|s| s.to_string()),
            country_mismatch,
        })
    }

    pub async fn confirm(&self, session_id: &str, user_code_claim: &str) -> Result<String, AppError> {
        let session = auth_session::find(&self.pool, session_id)
            .await?
            .ok_or_else(|| AppError::authentication("authorization session not found or expired"))?;
        if session.is_expired(Utc::now()) {
            return Err(AppError::authentication("authorization session expired"));
        }

        let record = device_code::find_by_device_code(&self.pool, &session.device_code)
            .await?
            .ok_or_else(|| AppError::not_found("device code"))?;

        let normalized = user_code::normalize(user_code_claim)
            .ok_or_else(|| AppError::invalid_input_field("malformed user code", "user_code"))?;
        if normalized != record.user_code {
            return Err(AppError::authentication("session does not match the submitted user code"));
        }

        let redirect_uri = format!("https://{}/oauth/callback", self.config.external_domain);
        let state = session_id.to_string();
        Ok(format!(
            "{}/oauth/authorize?response_type=code&client_id={}&redirect_uri={}&state={}&scope=section:patrol:write",
            self.config.upstream_base_url,
            urlencoding::encode(&self.config.upstream_client_id),
            urlencoding::encode(&redirect_uri),
            urlencoding::encode(&state),
        ))
    }

    pub async fn cancel(&self, raw_user_code: &str) -> Result<(), AppError> {
        let normalized = user_code::normalize(raw_user_code)
            .ok_or_else(|| AppError::invalid_input_field("malformed user code", "user_code"))?;
        let record = device_code::find_by_user_code(&self.pool, &normalized)
            .await?
            .ok_or_else(|| AppError::not_found("device code"))?;
        device_code::deny(&self.pool, &record.device_code).await?;
        Ok(())
    }

    /// Handle upstream's OAuth callback: exchange the code, fetch the
    /// profile, transition the device code to `awaiting_section`, and
    /// return the user's accessible sections for the selection form.
    pub async fn handle_oauth_callback(
        &self,
        code: &str,
        state: &str,
    ) -> Result<Vec<SectionChoice>, AppError> {
        let session = auth_session::find(&self.pool, state)
            .await?
            .ok_or_else(|| AppError::authentication("unknown or expired oauth state"))?;
        if session.is_expired(Utc::now()) {
            return Err(AppError::authentication("authorization session expired"));
        }

        let redirect_uri = format!("https://{}/oauth/callback", self.config.external_domain);
        let tokens = self.upstream.exchange_code(code, &redirect_uri).await?;
        let expires_at = Utc::now() + chrono::Duration::seconds(tokens.expires_in);

        let profile = self
            .upstream
            .fetch_profile(&tokens.access_token, "pending")
            .await?;
        if profile.sections.is_empty() {
            return Err(AppError::invalid_input("account has no accessible sections"));
        }

        device_code::set_awaiting_section(
            &self.pool,
            &session.device_code,
            &profile.user_id,
            &tokens.access_token,
            &tokens.refresh_token,
            expires_at,
        )
        .await?;

        Ok(profile
            .sections
            .into_iter()
            .map(section_choice)
            .collect())
    }

    /// Complete device authorization once the user has chosen a section.
    pub async fn select_section(
        &self,
        device_code_value: &str,
        section_id: &str,
        section_name: &str,
        group_name: Option<&str>,
    ) -> Result<(), AppError> {
        let record = device_code::find_by_device_code(&self.pool, device_code_value)
            .await?
            .ok_or_else(|| AppError::not_found("device code"))?;
        if record.status() != crate::models::DeviceCodeStatus::AwaitingSection {
            return Err(AppError::invalid_input("device code is not awaiting section selection"));
        }

        let device_access_token = random_token(64);
        device_code::authorize(&self.pool, device_code_value, section_id, &device_access_token).await?;

        let (osm_user_id, access_token, refresh_token, token_expires_at) = (
            record.osm_user_id.clone().ok_or_else(|| AppError::internal("missing osm_user_id"))?,
            record.access_token.clone().ok_or_else(|| AppError::internal("missing access_token"))?,
            record.refresh_token.clone().ok_or_else(|| AppError::internal("missing refresh_token"))?,
            record.token_expires_at.ok_or_else(|| AppError::internal("missing token_expires_at"))?,
        );
        user_credential::upsert(&self.pool, &osm_user_id, &access_token, &refresh_token, token_expires_at)
            .await?;
        section_settings::upsert(&self.pool, section_id, section_name, group_name).await?;

        Ok(())
    }

    pub async fn cleanup_expired(&self) -> Result<u64, AppError> {
        let expired = crate::db::device_code::expire_stale(&self.pool).await?;
        let sessions = auth_session::delete_expired(&self.pool).await?;
        let _ = self.cache.sweep_expired().await?;
        Ok(expired + sessions)
    }
}

fn section_choice(info: SectionInfo) -> SectionChoice {
    SectionChoice {
        section_id: info.section_id,
        section_name: info.section_name,
        group_name: info.group_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::db::pool::create_pool;
    use crate::services::upstream_client::UpstreamClientConfig;
    use std::time::Duration as StdDuration;

    async fn service() -> (DeviceFlowService, DbPool) {
        let pool = create_pool(":memory:").await.unwrap();
        allowed_client::upsert(&pool, "client-a", None, true).await.unwrap();
        let cache: Arc<dyn Cache> = Arc::new(InMemoryCache::new());
        let config = Arc::new(Config {
            upstream_client_id: "client".into(),
            upstream_client_secret: "secret".into(),
            upstream_base_url: "https://upstream.example".into(),
            session_secret: "a-secret-that-is-at-least-32-chars-long".into(),
            external_domain: "bridge.example".into(),
            database_url: ":memory:".into(),
            device_code_ttl: StdDuration::from_secs(600),
            device_poll_interval: StdDuration::from_secs(5),
            device_authorize_limit_per_min: 6,
            code_entry_limit_per_10s: 1,
            request_deadline: StdDuration::from_secs(10),
            log_level: "info".into(),
            log_json: false,
            port: 8080,
        });
        let upstream = Arc::new(
            UpstreamClient::new(
                UpstreamClientConfig {
                    base_url: config.upstream_base_url.clone(),
                    client_id: config.upstream_client_id.clone(),
                    client_secret: config.upstream_client_secret.clone(),
                },
                cache.clone(),
            )
            .unwrap(),
        );
        let rate_limiter = RateLimiter::new(cache.clone());
        (
            DeviceFlowService::new(pool.clone(), cache, rate_limiter, upstream, config),
            pool,
        )
    }

    #[tokio::test]
    async fn test_authorize_rejects_unknown_client() {
        let (svc, _pool) = service().await;
        let result = svc.authorize("unknown-client", None, None).await;
        assert!(matches!(result, Err(AppError::Authentication { .. })));
    }

    #[tokio::test]
    async fn test_authorize_then_poll_pending() {
        let (svc, _pool) = service().await;
        let response = svc.authorize("client-a", Some("1.2.3.4"), Some("GB")).await.unwrap();
        assert_eq!(response.user_code.len(), 9);

        let outcome = svc.poll_token(&response.device_code).await.unwrap();
        assert!(matches!(
            outcome,
            TokenPollOutcome::Pending(DeviceFlowError::AuthorizationPending)
        ));
    }

    #[tokio::test]
    async fn test_poll_too_soon_is_slow_down() {
        let (svc, _pool) = service().await;
        let response = svc.authorize("client-a", None, None).await.unwrap();
        svc.poll_token(&response.device_code).await.unwrap();
        let second = svc.poll_token(&response.device_code).await;
        assert!(matches!(second, Err(AppError::DeviceFlow { error: DeviceFlowError::SlowDown, .. })));
    }

    #[tokio::test]
    async fn test_confirm_requires_matching_user_code() {
        let (svc, _pool) = service().await;
        let auth = svc.authorize("client-a", None, None).await.unwrap();
        let page = svc.begin_verification(&auth.user_code, "9.9.9.9", None).await.unwrap();
        assert!(!page.country_mismatch);

        let result = svc.confirm(&page.session_id, "WRONG-CODE").await;
        assert!(result.is_err());

        let redirect = svc.confirm(&page.session_id, &auth.user_code).await.unwrap();
        assert!(redirect.contains("oauth/authorize"));
    }

    #[tokio::test]
    async fn test_country_mismatch_detected() {
        let (svc, _pool) = service().await;
        let auth = svc.authorize("client-a", Some("1.1.1.1"), Some("GB")).await.unwrap();
        let page = svc.begin_verification(&auth.user_code, "9.9.9.9", Some("FR")).await.unwrap();
        assert!(page.country_mismatch);
    }

    #[tokio::test]
    async fn test_cancel_denies_code() {
        let (svc, _pool) = service().await;
        let auth = svc.authorize("client-a", None, None).await.unwrap();
        svc.cancel(&auth.user_code).await.unwrap();
        let outcome = svc.poll_token(&auth.device_code).await.unwrap();
        assert!(matches!(outcome, TokenPollOutcome::Pending(DeviceFlowError::AccessDenied)));
    }
}
