//! Admin web UI HTTP surface: RFC 6749 login, cookie-session middleware, and
//! the patrol-score read/write endpoints, grounded on the companion server's
//! `companion_auth.rs` (manual `Cookie`/`Set-Cookie` handling, no cookie-jar
//! crate) generalised from a locally-verified PIN to an upstream-backed
//! session.

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Json;
use serde::Deserialize;

use crate::db::{section_settings, user_credential};
use crate::error::AppError;
use crate::http::{cookie_value, AppState};
use crate::models::{Principal, WebSession};
use crate::services::score_update::{PointsUpdate, PointsUpdateResult};

const SESSION_COOKIE: &str = "admin_session";
const ADMIN_SESSION_MAX_AGE_SECS: i64 = 7 * 24 * 60 * 60;

pub async fn login(State(state): State<AppState>) -> Result<Redirect, AppError> {
    let url = state.web_flow.begin_login().await?;
    Ok(Redirect::to(&url))
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: String,
    pub state: String,
}

pub async fn callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, AppError> {
    let session = state.web_flow.complete_login(&query.code, &query.state).await?;
    let cookie = format!(
        "{SESSION_COOKIE}={}; Path=/; Max-Age={ADMIN_SESSION_MAX_AGE_SECS}; HttpOnly; Secure; SameSite=Lax",
        session.session_id,
    );
    let body = format!(
        "<html><body><h1>Signed in</h1><p>osm_user_id: {}</p>\
         <p>CSRF token for write requests: <code>{}</code></p></body></html>",
        session.osm_user_id, session.csrf_token,
    );
    let mut response = Html(body).into_response();
    response.headers_mut().insert(header::SET_COOKIE, cookie.parse().unwrap());
    Ok(response)
}

pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, AppError> {
    if let Some(session_id) = cookie_value(&headers, SESSION_COOKIE) {
        state.web_flow.logout(session_id).await?;
    }
    let clearing = format!("{SESSION_COOKIE}=; Path=/; Max-Age=0");
    let mut response = Redirect::to("/admin/login").into_response();
    response.headers_mut().insert(header::SET_COOKIE, clearing.parse().unwrap());
    Ok(response)
}

/// Resolves the `admin_session` cookie and attaches the [`WebSession`] to
/// the request as an extension for downstream handlers. Cookie-based routes
/// redirect to login on failure rather than returning a JSON 401.
pub async fn require_session(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let session_id = match cookie_value(req.headers(), SESSION_COOKIE) {
        Some(id) => id.to_string(),
        None => return Redirect::to("/admin/login").into_response(),
    };
    match state.web_flow.resolve_session(&session_id).await {
        Ok(session) => {
            req.extensions_mut().insert(session);
            next.run(req).await
        }
        Err(_) => Redirect::to("/admin/login").into_response(),
    }
}

/// Re-derives a [`Principal::User`] from the persistent upstream credential
/// rather than the session cookie's own stored tokens: `PatrolScoreService`
/// only persists refreshed admin tokens to `UserCredential`, never back to
/// `WebSession` (see its `ensure_fresh_token` doc comment), so reading from
/// the cookie here would silently use a stale token after the first refresh.
async fn principal_for(state: &AppState, osm_user_id: &str) -> Result<Principal, AppError> {
    let cred = user_credential::find(&state.pool, osm_user_id)
        .await?
        .ok_or_else(|| AppError::authentication("no upstream credential on file for this session"))?;
    Ok(Principal::from_user_credential(&cred))
}

pub async fn get_scores(
    State(state): State<AppState>,
    Path(section_id): Path<String>,
    axum::Extension(session): axum::Extension<WebSession>,
) -> Result<Json<super::device::PatrolsApiResponse>, AppError> {
    let principal = principal_for(&state, &session.osm_user_id).await?;
    let scores = state.patrol_score.get_scores_for_section(&principal, &section_id).await?;
    Ok(Json(scores.into()))
}

#[derive(Debug, Deserialize)]
pub struct ScoresBatchRequest {
    pub updates: Vec<PointsUpdate>,
}

pub async fn post_scores(
    State(state): State<AppState>,
    Path(section_id): Path<String>,
    axum::Extension(session): axum::Extension<WebSession>,
    headers: HeaderMap,
    Json(body): Json<ScoresBatchRequest>,
) -> Result<Json<Vec<PointsUpdateResult>>, AppError> {
    let submitted = headers.get("X-CSRF-Token").and_then(|v| v.to_str().ok());
    if submitted != Some(session.csrf_token.as_str()) {
        return Err(AppError::authentication("missing or mismatched X-CSRF-Token"));
    }

    let principal = principal_for(&state, &session.osm_user_id).await?;
    // Reuses the read path's term-discovery and token-refresh logic to
    // guarantee a fresh term_id and access token before writing, rather than
    // duplicating that pipeline here.
    state.patrol_score.get_scores_for_section(&principal, &section_id).await?;

    let settings = section_settings::find(&state.pool, &section_id)
        .await?
        .ok_or_else(|| AppError::SectionNotFound { section_id: section_id.clone() })?;
    let term_id = settings.term_id.ok_or(AppError::NotInActiveTerm)?;

    let results = state
        .score_update
        .apply_batch(&principal, &section_id, &term_id, &body.updates)
        .await;
    Ok(Json(results))
}
