//! Component D: the upstream REST API client.
//!
//! Grounded on the companion server's GitLab client: a typed config struct,
//! a `reqwest::Client` builder with default headers, and a single generic
//! response-handling method that classifies the response by status code
//! before the caller ever sees a body. Generalised here from
//! pagination-header parsing to rate-limit/block-header parsing, since this
//! upstream has no pagination but does gate callers on quota.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::cache::Cache;
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
}

pub struct UpstreamClient {
    http: reqwest::Client,
    config: UpstreamClientConfig,
    cache: Arc<dyn Cache>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    #[serde(default)]
    #[allow(dead_code)]
    pub token_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    #[allow(dead_code)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProfileResponse {
    #[allow(dead_code)]
    pub status: bool,
    pub data: ProfileData,
}

#[derive(Debug, Deserialize)]
pub struct ProfileData {
    pub user_id: String,
    #[allow(dead_code)]
    pub full_name: String,
    #[allow(dead_code)]
    pub email: Option<String>,
    pub sections: Vec<SectionInfo>,
}

#[derive(Debug, Deserialize)]
pub struct SectionInfo {
    pub section_id: String,
    pub section_name: String,
    pub group_name: Option<String>,
    pub terms: Vec<TermInfo>,
}

#[derive(Debug, Deserialize)]
pub struct TermInfo {
    pub term_id: String,
    pub startdate: NaiveDate,
    pub enddate: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Patrol {
    pub id: String,
    pub name: String,
    pub points: i64,
}

/// Parsed `X-RateLimit-*` headers. All-or-nothing per Open Question (a):
/// callers only get `Some` when all three headers are present and well-formed.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitInfo {
    pub limit: i64,
    pub remaining: i64,
    pub reset_at: DateTime<Utc>,
}

impl UpstreamClient {
    pub fn new(config: UpstreamClientConfig, cache: Arc<dyn Cache>) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .user_agent("bridge-server/0.1")
            .build()
            .map_err(|e| AppError::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config, cache })
    }

    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, AppError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
        ];
        self.token_request(&params).await
    }

    /// The raw refresh-grant call. Revocation-vs-transient classification is
    /// the responsibility of the token-refresh coordinator (Component E),
    /// which wraps this call.
    pub async fn refresh_token_request(&self, refresh_token: &str) -> Result<TokenResponse, AppError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
        ];
        self.token_request(&params).await
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenResponse, AppError> {
        let url = format!("{}/oauth/token", self.config.base_url);
        let response = self.http.post(&url).form(params).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(response.json::<TokenResponse>().await?)
        } else {
            let body: OAuthErrorBody = response
                .json()
                .await
                .unwrap_or(OAuthErrorBody { error: "invalid_request".into(), error_description: None });
            if matches!(body.error.as_str(), "invalid_grant" | "invalid_token" | "access_denied") {
                Err(AppError::token_revoked(body.error))
            } else {
                Err(AppError::upstream_with_status(body.error, status.as_u16()))
            }
        }
    }

    pub async fn fetch_profile(&self, access_token: &str, osm_user_id: &str) -> Result<ProfileData, AppError> {
        let url = format!("{}/api.php?action=getUserRoles", self.config.base_url);
        let response = self.http.get(&url).bearer_auth(access_token).send().await?;
        let profile: ProfileResponse = self.handle_response(response, osm_user_id).await?;
        Ok(profile.data)
    }

    /// Find the section's term whose `[startdate, enddate]` interval
    /// contains today (inclusive at both bounds).
    pub async fn fetch_active_term_for_section(
        &self,
        access_token: &str,
        osm_user_id: &str,
        section_id: &str,
    ) -> Result<TermInfo, AppError> {
        let profile = self.fetch_profile(access_token, osm_user_id).await?;
        let section = profile
            .sections
            .into_iter()
            .find(|s| s.section_id == section_id)
            .ok_or_else(|| AppError::SectionNotFound {
                section_id: section_id.to_string(),
            })?;

        let today = Utc::now().date_naive();
        section
            .terms
            .into_iter()
            .find(|t| t.startdate <= today && today <= t.enddate)
            .ok_or(AppError::NotInActiveTerm)
    }

    pub async fn fetch_patrol_scores(
        &self,
        access_token: &str,
        osm_user_id: &str,
        section_id: &str,
        term_id: &str,
    ) -> Result<Vec<Patrol>, AppError> {
        let url = format!(
            "{}/api.php?action=getPatrolsWithPeople&include_no_patrol=y&sectionid={}&termid={}",
            self.config.base_url, section_id, term_id
        );
        let response = self.http.get(&url).bearer_auth(access_token).send().await?;
        let raw: serde_json::Map<String, serde_json::Value> =
            self.handle_response(response, osm_user_id).await?;
        Ok(parse_patrol_map(&raw))
    }

    pub async fn update_patrol_points(
        &self,
        access_token: &str,
        osm_user_id: &str,
        section_id: &str,
        term_id: &str,
        patrol_id: &str,
        delta: i64,
    ) -> Result<Vec<Patrol>, AppError> {
        let url = format!(
            "{}/api.php?action=updatePatrolPoints&sectionid={}&termid={}",
            self.config.base_url, section_id, term_id
        );
        let form = [
            ("patrolid", patrol_id.to_string()),
            ("points", delta.to_string()),
        ];
        let response = self.http.post(&url).bearer_auth(access_token).form(&form).send().await?;
        let raw: serde_json::Map<String, serde_json::Value> =
            self.handle_response(response, osm_user_id).await?;
        Ok(parse_patrol_map(&raw))
    }

    /// Classify the response by status, update the rate-limit/block caches
    /// from its headers, and decode the body on success.
    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
        osm_user_id: &str,
    ) -> Result<T, AppError> {
        if response.headers().contains_key("x-blocked") {
            self.cache
                .set_with_ttl("perm_blocked", "1", chrono::Duration::hours(24))
                .await?;
            tracing::error!("upstream asserted a service-wide block (X-Blocked)");
            return Err(AppError::ServiceBlocked);
        }

        if let Some(info) = parse_rate_limit_headers(response.headers()) {
            self.cache
                .set_with_ttl(
                    &format!("rate_limit:{osm_user_id}"),
                    &serde_json::to_string(&(info.limit, info.remaining, info.reset_at.to_rfc3339()))
                        .unwrap_or_default(),
                    chrono::Duration::hours(1),
                )
                .await?;
            if info.remaining < 20 {
                tracing::error!(remaining = info.remaining, osm_user_id, "upstream rate-limit quota critical");
            } else if info.remaining < 100 {
                tracing::warn!(remaining = info.remaining, osm_user_id, "upstream rate-limit quota low");
            }
        }

        if let Some(notice) = response.headers().get("x-deprecated") {
            tracing::warn!(notice = ?notice, "upstream deprecation notice");
        }

        let status = response.status();
        match status {
            StatusCode::OK => Ok(response.json::<T>().await?),
            StatusCode::UNAUTHORIZED => Err(AppError::authentication("upstream rejected the access token")),
            StatusCode::FORBIDDEN => Err(AppError::authentication("upstream denied access to this resource")),
            StatusCode::NOT_FOUND => Err(AppError::not_found("upstream resource")),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(60);
                let blocked_until = Utc::now() + chrono::Duration::seconds(retry_after);
                self.cache
                    .set_with_ttl(
                        &format!("blocked:{osm_user_id}"),
                        &blocked_until.to_rfc3339(),
                        chrono::Duration::seconds(retry_after),
                    )
                    .await?;
                Err(AppError::UserBlocked { retry_after })
            }
            other => Err(AppError::upstream_with_status(
                format!("unexpected upstream status {other}"),
                other.as_u16(),
            )),
        }
    }
}

fn parse_rate_limit_headers(headers: &reqwest::header::HeaderMap) -> Option<RateLimitInfo> {
    let limit = headers.get("x-ratelimit-limit")?.to_str().ok()?.parse().ok()?;
    let remaining = headers.get("x-ratelimit-remaining")?.to_str().ok()?.parse().ok()?;
    let reset_secs: i64 = headers.get("x-ratelimit-reset")?.to_str().ok()?.parse().ok()?;
    let reset_at = DateTime::from_timestamp(reset_secs, 0)?;
    Some(RateLimitInfo { limit, remaining, reset_at })
}

/// Filter the raw patrol map per SPEC_FULL.md §4.D: drop `unallocated`, drop
/// negative-id patrols, drop patrols with no members, sort ascending by name.
fn parse_patrol_map(raw: &serde_json::Map<String, serde_json::Value>) -> Vec<Patrol> {
    let mut patrols: Vec<Patrol> = raw
        .iter()
        .filter(|(id, _)| id.as_str() != "unallocated")
        .filter(|(id, _)| id.parse::<i64>().map(|n| n >= 0).unwrap_or(true))
        .filter_map(|(id, value)| {
            let members_empty = value
                .get("members")
                .and_then(|m| m.as_array())
                .map(|a| a.is_empty())
                .unwrap_or(false);
            if members_empty {
                return None;
            }
            let name = value.get("name")?.as_str()?.to_string();
            let points = value
                .get("points")
                .and_then(|p| p.as_str().and_then(|s| s.parse::<i64>().ok()).or_else(|| p.as_i64()))
                .unwrap_or(0);
            Some(Patrol { id: id.clone(), name, points })
        })
        .collect();
    patrols.sort_by(|a, b| a.name.cmp(&b.name));
    patrols
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_patrol_map_filters_and_sorts() {
        let raw = json!({
            "unallocated": {"name": "Unallocated", "points": "0", "members": [1]},
            "-2": {"name": "Leaders", "points": "0", "members": [1]},
            "1": {"name": "Hawks", "points": "50", "members": [1, 2]},
            "2": {"name": "Eagles", "points": "100", "members": [1]},
            "3": {"name": "Empty Patrol", "points": "10", "members": []},
        })
        .as_object()
        .unwrap()
        .clone();

        let patrols = parse_patrol_map(&raw);
        assert_eq!(patrols.len(), 2);
        assert_eq!(patrols[0].name, "Eagles");
        assert_eq!(patrols[0].points, 100);
        assert_eq!(patrols[1].name, "Hawks");
    }

    #[test]
    fn test_parse_patrol_map_numeric_points() {
        let raw = json!({
            "1": {"name": "Hawks", "points": 50, "members": [1]},
        })
        .as_object()
        .unwrap()
        .clone();
        let patrols = parse_patrol_map(&raw);
        assert_eq!(patrols[0].points, 50);
    }
}
