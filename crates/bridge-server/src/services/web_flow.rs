//! Component G: RFC 6749 authorization-code flow for the admin UI.
//!
//! Grounded on the companion server's PIN-based session establishment
//! (`companion_auth::verify_pin_and_create_session`) and `commands/auth.rs`'s
//! validate-then-persist shape, generalised from a locally-verified PIN to an
//! upstream OAuth code exchange.

use std::sync::Arc;

use chrono::Utc;
use rand::RngCore;

use crate::cache::Cache;
use crate::config::Config;
use crate::db::pool::DbPool;
use crate::db::{user_credential, web_session};
use crate::error::AppError;
use crate::services::upstream_client::UpstreamClient;

pub struct WebFlowService {
    pool: DbPool,
    cache: Arc<dyn Cache>,
    upstream: Arc<UpstreamClient>,
    config: Arc<Config>,
}

pub struct LoginSession {
    pub session_id: String,
    pub csrf_token: String,
    pub osm_user_id: String,
}

fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, buf)
}

impl WebFlowService {
    pub fn new(pool: DbPool, cache: Arc<dyn Cache>, upstream: Arc<UpstreamClient>, config: Arc<Config>) -> Self {
        Self { pool, cache, upstream, config }
    }

    /// Begin login: mint a one-time `state` and return the upstream
    /// authorize URL the caller should redirect the browser to.
    pub async fn begin_login(&self) -> Result<String, AppError> {
        let state = random_token(24);
        self.cache
            .set_with_ttl(&format!("oauth_state:{state}"), "1", chrono::Duration::minutes(15))
            .await?;

        let redirect_uri = format!("https://{}/admin/callback", self.config.external_domain);
        Ok(format!(
            "{}/oauth/authorize?response_type=code&client_id={}&redirect_uri={}&state={}&scope=section:patrol:write",
            self.config.upstream_base_url,
            urlencoding::encode(&self.config.upstream_client_id),
            urlencoding::encode(&redirect_uri),
            urlencoding::encode(&state),
        ))
    }

    pub async fn complete_login(&self, code: &str, state: &str) -> Result<LoginSession, AppError> {
        let state_key = format!("oauth_state:{state}");
        if self.cache.get(&state_key).await?.is_none() {
            return Err(AppError::authentication("unknown or expired oauth state"));
        }
        self.cache.delete(&state_key).await?;

        let redirect_uri = format!("https://{}/admin/callback", self.config.external_domain);
        let tokens = self.upstream.exchange_code(code, &redirect_uri).await?;
        let expires_at = Utc::now() + chrono::Duration::seconds(tokens.expires_in);

        let profile = self.upstream.fetch_profile(&tokens.access_token, "pending").await?;

        user_credential::upsert(
            &self.pool,
            &profile.user_id,
            &tokens.access_token,
            &tokens.refresh_token,
            expires_at,
        )
        .await?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let csrf_token = random_token(24);
        web_session::create(
            &self.pool,
            &session_id,
            &profile.user_id,
            &tokens.access_token,
            &tokens.refresh_token,
            expires_at,
            &csrf_token,
            Utc::now() + chrono::Duration::days(7),
        )
        .await?;

        Ok(LoginSession {
            session_id,
            csrf_token,
            osm_user_id: profile.user_id,
        })
    }

    pub async fn logout(&self, session_id: &str) -> Result<(), AppError> {
        web_session::delete(&self.pool, session_id).await?;
        Ok(())
    }

    /// Resolve a session cookie to a live, non-expired session, touching its
    /// `last_activity` timestamp.
    pub async fn resolve_session(
        &self,
        session_id: &str,
    ) -> Result<crate::models::WebSession, AppError> {
        let session = web_session::find(&self.pool, session_id)
            .await?
            .ok_or_else(|| AppError::authentication("not logged in"))?;
        if session.is_expired(Utc::now()) {
            web_session::delete(&self.pool, session_id).await?;
            return Err(AppError::authentication("session expired"));
        }
        web_session::touch(&self.pool, session_id).await?;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::db::pool::create_pool;
    use crate::services::upstream_client::UpstreamClientConfig;
    use std::time::Duration as StdDuration;

    fn config() -> Arc<Config> {
        Arc::new(Config {
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
        })
    }

    #[tokio::test]
    async fn test_begin_login_produces_state_backed_url() {
        let pool = create_pool(":memory:").await.unwrap();
        let cache: Arc<dyn Cache> = Arc::new(InMemoryCache::new());
        let cfg = config();
        let upstream = Arc::new(
            UpstreamClient::new(
                UpstreamClientConfig {
                    base_url: cfg.upstream_base_url.clone(),
                    client_id: cfg.upstream_client_id.clone(),
                    client_secret: cfg.upstream_client_secret.clone(),
                },
                cache.clone(),
            )
            .unwrap(),
        );
        let svc = WebFlowService::new(pool, cache, upstream, cfg);
        let url = svc.begin_login().await.unwrap();
        assert!(url.contains("oauth/authorize"));
        assert!(url.contains("state="));
    }

    #[tokio::test]
    async fn test_resolve_unknown_session_fails() {
        let pool = create_pool(":memory:").await.unwrap();
        let cache: Arc<dyn Cache> = Arc::new(InMemoryCache::new());
        let cfg = config();
        let upstream = Arc::new(
            UpstreamClient::new(
                UpstreamClientConfig {
                    base_url: cfg.upstream_base_url.clone(),
                    client_id: cfg.upstream_client_id.clone(),
                    client_secret: cfg.upstream_client_secret.clone(),
                },
                cache.clone(),
            )
            .unwrap(),
        );
        let svc = WebFlowService::new(pool, cache, upstream, cfg);
        let result = svc.resolve_session("nonexistent").await;
        assert!(result.is_err());
    }
}
