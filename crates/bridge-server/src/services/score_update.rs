//! Component I: the score-update (write) path applied by the admin UI.
//!
//! Grounded on the companion server's `sync_queue` (`enqueue_action`-style
//! payload shape, `now()` timestamps on the audit row) for the audit-insert
//! shape; its retryable-vs-terminal action split informs the
//! temporary/non-temporary error distinction required here. The per-patrol
//! mutex reuses Component C's single-slot rate-limit primitive rather than a
//! dedicated lock table (see DESIGN.md).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::Cache;
use crate::db::pool::DbPool;
use crate::db::{score_audit, user_credential};
use crate::error::AppError;
use crate::models::Principal;
use crate::services::block_guard::ensure_not_blocked;
use crate::services::rate_limiter::RateLimiter;
use crate::services::token_refresh;
use crate::services::upstream_client::UpstreamClient;

const LOCK_NAME: &str = "score_update";

fn lock_hold() -> chrono::Duration {
    chrono::Duration::seconds(5)
}

pub struct ScoreUpdateService {
    pool: DbPool,
    cache: Arc<dyn Cache>,
    rate_limiter: RateLimiter,
    upstream: Arc<UpstreamClient>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PointsUpdate {
    pub patrol_id: String,
    pub delta: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PointsUpdateResult {
    pub patrol_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_score: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_score: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub is_temporary_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<i64>,
}

impl ScoreUpdateService {
    pub fn new(pool: DbPool, cache: Arc<dyn Cache>, upstream: Arc<UpstreamClient>) -> Self {
        Self {
            pool,
            rate_limiter: RateLimiter::new(cache.clone()),
            cache,
            upstream,
        }
    }

    /// Apply a batch of patrol-point deltas in input order. Each entry
    /// succeeds or fails independently; the result vector mirrors the input
    /// order exactly.
    pub async fn apply_batch(
        &self,
        principal: &Principal,
        section_id: &str,
        term_id: &str,
        updates: &[PointsUpdate],
    ) -> Vec<PointsUpdateResult> {
        let mut results = Vec::with_capacity(updates.len());
        for update in updates {
            results.push(
                self.apply_one(principal, section_id, term_id, update)
                    .await,
            );
        }
        results
    }

    async fn apply_one(
        &self,
        principal: &Principal,
        section_id: &str,
        term_id: &str,
        update: &PointsUpdate,
    ) -> PointsUpdateResult {
        let lock_key = format!("{section_id}:{}", update.patrol_id);
        if !self
            .rate_limiter
            .try_acquire(LOCK_NAME, &lock_key, lock_hold())
            .await
        {
            return temporary_failure(&update.patrol_id, "another update is in progress for this patrol", 2);
        }

        let result = self
            .apply_locked(principal, section_id, term_id, update)
            .await;
        let _ = self.rate_limiter.release(LOCK_NAME, &lock_key).await;
        result
    }

    async fn apply_locked(
        &self,
        principal: &Principal,
        section_id: &str,
        term_id: &str,
        update: &PointsUpdate,
    ) -> PointsUpdateResult {
        if let Err(err) = ensure_not_blocked(self.cache.as_ref(), principal.osm_user_id()).await {
            return error_to_result(&update.patrol_id, err);
        }

        let access_token = match self.ensure_fresh_token(principal).await {
            Ok(token) => token,
            Err(err) => return error_to_result(&update.patrol_id, err),
        };

        let current = match self
            .upstream
            .fetch_patrol_scores(&access_token, principal.osm_user_id(), section_id, term_id)
            .await
        {
            Ok(patrols) => patrols,
            Err(err) => return error_to_result(&update.patrol_id, err),
        };

        let before = match current.iter().find(|p| p.id == update.patrol_id) {
            Some(p) => p.clone(),
            None => {
                return PointsUpdateResult {
                    patrol_id: update.patrol_id.clone(),
                    success: false,
                    previous_score: None,
                    new_score: None,
                    error: Some("patrol not found".to_string()),
                    is_temporary_error: false,
                    retry_after: None,
                }
            }
        };

        let updated = match self
            .upstream
            .update_patrol_points(
                &access_token,
                principal.osm_user_id(),
                section_id,
                term_id,
                &update.patrol_id,
                update.delta,
            )
            .await
        {
            Ok(patrols) => patrols,
            Err(err) => return error_to_result(&update.patrol_id, err),
        };

        let after = match updated.iter().find(|p| p.id == update.patrol_id) {
            Some(p) => p,
            // Open Question (b): absence is a generic internal error, never a
            // silently-stale report (see SPEC_FULL.md §9, DESIGN.md).
            None => {
                return error_to_result(
                    &update.patrol_id,
                    AppError::internal("updatePatrolPoints response did not include the addressed patrol"),
                )
            }
        };

        if let Err(err) = score_audit::record(
            &self.pool,
            principal.osm_user_id(),
            section_id,
            &update.patrol_id,
            &before.name,
            before.points,
            after.points,
            update.delta,
        )
        .await
        {
            return error_to_result(&update.patrol_id, err);
        }

        PointsUpdateResult {
            patrol_id: update.patrol_id.clone(),
            success: true,
            previous_score: Some(before.points),
            new_score: Some(after.points),
            error: None,
            is_temporary_error: false,
            retry_after: None,
        }
    }

    async fn ensure_fresh_token(&self, principal: &Principal) -> Result<String, AppError> {
        if !principal.needs_refresh(chrono::Utc::now()) {
            return Ok(principal.access_token().to_string());
        }
        let osm_user_id = principal.osm_user_id().to_string();
        let pool = self.pool.clone();
        let pool_revoke = self.pool.clone();
        let osm_user_id_revoke = osm_user_id.clone();
        token_refresh::refresh_token(
            &self.upstream,
            principal.refresh_token(),
            move |access, refresh, expiry| {
                let pool = pool.clone();
                let osm_user_id = osm_user_id.clone();
                async move {
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
}

fn temporary_failure(patrol_id: &str, message: &str, retry_after: i64) -> PointsUpdateResult {
    PointsUpdateResult {
        patrol_id: patrol_id.to_string(),
        success: false,
        previous_score: None,
        new_score: None,
        error: Some(message.to_string()),
        is_temporary_error: true,
        retry_after: Some(retry_after),
    }
}

fn error_to_result(patrol_id: &str, err: AppError) -> PointsUpdateResult {
    let is_temporary = err.is_temporary();
    let retry_after = match &err {
        AppError::UserBlocked { retry_after } | AppError::RateLimited { retry_after } => Some(*retry_after),
        AppError::ServiceBlocked => Some(60),
        _ => None,
    };
    PointsUpdateResult {
        patrol_id: patrol_id.to_string(),
        success: false,
        previous_score: None,
        new_score: None,
        error: Some(err.to_string()),
        is_temporary_error: is_temporary,
        retry_after,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::db::pool::create_pool;
    use crate::services::upstream_client::UpstreamClientConfig;
    use chrono::Utc;

    fn principal() -> Principal {
        Principal::User {
            osm_user_id: "user-1".into(),
            access_token: "access".into(),
            refresh_token: "refresh".into(),
            token_expires_at: Utc::now() + chrono::Duration::hours(1),
        }
    }

    async fn service_against(server: &wiremock::MockServer) -> ScoreUpdateService {
        let pool = create_pool(":memory:").await.unwrap();
        let cache: Arc<dyn Cache> = Arc::new(InMemoryCache::new());
        let upstream = Arc::new(
            UpstreamClient::new(
                UpstreamClientConfig {
                    base_url: server.uri(),
                    client_id: "client".into(),
                    client_secret: "secret".into(),
                },
                cache.clone(),
            )
            .unwrap(),
        );
        ScoreUpdateService::new(pool, cache, upstream)
    }

    #[tokio::test]
    async fn test_patrol_not_found_is_non_temporary() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let svc = service_against(&server).await;
        let results = svc
            .apply_batch(
                &principal(),
                "section-1",
                "term-1",
                &[PointsUpdate { patrol_id: "missing".into(), delta: 5 }],
            )
            .await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert!(!results[0].is_temporary_error);
        assert_eq!(results[0].error.as_deref(), Some("patrol not found"));
    }

    #[tokio::test]
    async fn test_successful_update_records_audit_and_delta() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "1": {"name": "Eagles", "points": "100", "members": [1]},
            })))
            .mount(&server)
            .await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "1": {"name": "Eagles", "points": "105", "members": [1]},
            })))
            .mount(&server)
            .await;

        let svc = service_against(&server).await;
        let pool = svc.pool.clone();
        let results = svc
            .apply_batch(
                &principal(),
                "section-1",
                "term-1",
                &[PointsUpdate { patrol_id: "1".into(), delta: 5 }],
            )
            .await;
        assert!(results[0].success);
        assert_eq!(results[0].previous_score, Some(100));
        assert_eq!(results[0].new_score, Some(105));

        let audit = score_audit::list_for_section(&pool, "section-1", 10).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].points_added, 5);
    }

    #[tokio::test]
    async fn test_concurrent_updates_to_same_patrol_serialize() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "1": {"name": "Eagles", "points": "100", "members": [1]},
            })))
            .mount(&server)
            .await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "1": {"name": "Eagles", "points": "101", "members": [1]},
            })))
            .mount(&server)
            .await;

        let svc = Arc::new(service_against(&server).await);
        let a = svc.clone();
        let b = svc.clone();
        let (ra, rb) = tokio::join!(
            async move {
                a.apply_one(&principal(), "section-1", "term-1", &PointsUpdate { patrol_id: "1".into(), delta: 1 })
                    .await
            },
            async move {
                b.apply_one(&principal(), "section-1", "term-1", &PointsUpdate { patrol_id: "1".into(), delta: 1 })
                    .await
            }
        );
        let temporary_count = [&ra, &rb].iter().filter(|r| r.is_temporary_error).count();
        assert!(temporary_count <= 1, "at most one of two racing writers should be locked out");
    }
}
