//! Component E: the token-refresh coordinator.
//!
//! Wraps `UpstreamClient::refresh_token_request`, distinguishing a transient
//! failure from upstream's assertion that the refresh token itself has been
//! revoked, and drives the caller-supplied persistence/quiescence callbacks
//! for each outcome. Generalised from the companion server's single
//! `AuthenticationExpired` 401 branch into a three-way outcome with
//! callbacks, since this spec requires distinct DeviceCode/WebSession/
//! UserCredential persistence paths plus a revocation side-effect.

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::services::upstream_client::UpstreamClient;

/// Refresh `refresh_token` against upstream. On success, calls `on_success`
/// with the new tokens and expiry. On a revocation response
/// (`invalid_grant` / `invalid_token` / `access_denied`), calls `on_revoked`
/// and returns `AppError::TokenRevoked`. Any other failure is returned
/// without invoking either callback.
pub async fn refresh_token<FSuccess, FutSuccess, FRevoked, FutRevoked>(
    client: &UpstreamClient,
    refresh_token: &str,
    on_success: FSuccess,
    on_revoked: FRevoked,
) -> Result<String, AppError>
where
    FSuccess: FnOnce(String, String, DateTime<Utc>) -> FutSuccess,
    FutSuccess: Future<Output = Result<(), AppError>>,
    FRevoked: FnOnce() -> FutRevoked,
    FutRevoked: Future<Output = Result<(), AppError>>,
{
    match client.refresh_token_request(refresh_token).await {
        Ok(tokens) => {
            let expires_at = Utc::now() + chrono::Duration::seconds(tokens.expires_in);
            on_success(tokens.access_token.clone(), tokens.refresh_token, expires_at).await?;
            Ok(tokens.access_token)
        }
        Err(AppError::TokenRevoked { message }) => {
            on_revoked().await?;
            Err(AppError::TokenRevoked { message })
        }
        Err(other) => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::services::upstream_client::UpstreamClientConfig;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn client(base_url: String) -> UpstreamClient {
        UpstreamClient::new(
            UpstreamClientConfig {
                base_url,
                client_id: "client".into(),
                client_secret: "secret".into(),
            },
            Arc::new(InMemoryCache::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_revoked_invokes_on_revoked_not_on_success() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::path("/oauth/token"))
            .respond_with(
                wiremock::ResponseTemplate::new(400)
                    .set_body_json(serde_json::json!({"error": "invalid_grant"})),
            )
            .mount(&server)
            .await;

        let client = client(server.uri());
        let revoked_called = Arc::new(AtomicBool::new(false));
        let success_called = Arc::new(AtomicBool::new(false));

        let revoked_flag = revoked_called.clone();
        let success_flag = success_called.clone();
        let result = refresh_token(
            &client,
            "some-refresh-token",
            |_, _, _| {
                let flag = success_flag.clone();
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            },
            || {
                let flag = revoked_flag.clone();
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .await;

        assert!(matches!(result, Err(AppError::TokenRevoked { .. })));
        assert!(revoked_called.load(Ordering::SeqCst));
        assert!(!success_called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_success_invokes_on_success() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::path("/oauth/token"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-access",
                "refresh_token": "new-refresh",
                "expires_in": 3600,
                "token_type": "Bearer",
            })))
            .mount(&server)
            .await;

        let client = client(server.uri());
        let success_called = Arc::new(AtomicBool::new(false));
        let success_flag = success_called.clone();

        let token = refresh_token(
            &client,
            "some-refresh-token",
            |access, _refresh, _expiry| {
                let flag = success_flag.clone();
                async move {
                    assert_eq!(access, "new-access");
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            },
            || async { Ok(()) },
        )
        .await
        .unwrap();

        assert_eq!(token, "new-access");
        assert!(success_called.load(Ordering::SeqCst));
    }
}
