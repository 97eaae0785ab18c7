//! Device and browser-facing HTTP surface for the RFC 8628
//! device-authorization flow, grounded on `services/device_flow.rs`'s state
//! machine. No templating engine is in scope (see DESIGN.md); the
//! confirmation and section-selection pages are small inline HTML forms
//! rather than a server-side template dependency this small surface doesn't
//! need.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{auth_session, device_code};
use crate::error::{AppError, DeviceFlowError};
use crate::http::{bearer_token, client_ip, country_header, AppState};
use crate::models::device_code::DeviceAuthorizationResponse;
use crate::services::device_flow::{ConfirmationPageData, SectionChoice, TokenPollOutcome};
use crate::services::patrol_score::PatrolScoresResponse;
use crate::services::user_code;

const DEVICE_TOKEN_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

#[derive(Debug, Deserialize)]
pub struct AuthorizeRequest {
    pub client_id: String,
}

pub async fn authorize(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<AuthorizeRequest>,
) -> Result<Json<DeviceAuthorizationResponse>, AppError> {
    let ip = client_ip(&headers, addr);
    let country = country_header(&headers);
    let response = state
        .device_flow
        .authorize(&body.client_id, Some(&ip), country.as_deref())
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub grant_type: String,
    pub device_code: String,
}

#[derive(Debug, Serialize)]
struct TokenSuccessBody {
    access_token: String,
    token_type: &'static str,
    expires_in: i64,
}

#[derive(Debug, Serialize)]
struct TokenErrorBody {
    error: DeviceFlowError,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_description: Option<String>,
}

fn device_flow_error_response(error: DeviceFlowError, error_description: Option<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(TokenErrorBody { error, error_description }),
    )
        .into_response()
}

/// `POST /device/token`. Request and response bodies follow RFC 8628's wire
/// shape verbatim rather than the generic `AppError` envelope, since device
/// clients implement this as a standard OAuth token exchange.
pub async fn token(State(state): State<AppState>, Json(body): Json<TokenRequest>) -> Response {
    if body.grant_type != DEVICE_TOKEN_GRANT_TYPE {
        return device_flow_error_response(DeviceFlowError::UnsupportedGrantType, None);
    }
    if body.device_code.is_empty() {
        return device_flow_error_response(DeviceFlowError::InvalidRequest, None);
    }

    match state.device_flow.poll_token(&body.device_code).await {
        Ok(TokenPollOutcome::Authorized { access_token, expires_in }) => {
            Json(TokenSuccessBody { access_token, token_type: "Bearer", expires_in }).into_response()
        }
        Ok(TokenPollOutcome::Pending(error)) => device_flow_error_response(error, None),
        Err(AppError::DeviceFlow { error, error_description }) => {
            device_flow_error_response(error, error_description)
        }
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct DevicePageQuery {
    pub user_code: Option<String>,
}

/// `GET /device` (bare code-entry form) and `GET /device?user_code=...`
/// (confirmation page). The confirmation branch's rate limiting lives
/// inside `DeviceFlowService::begin_verification`; the bare-form branch
/// applies the same limiter directly since there is no service call to
/// carry it through.
pub async fn device_page(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<DevicePageQuery>,
) -> Result<Html<String>, AppError> {
    let ip = client_ip(&headers, addr);
    match query.user_code {
        None => {
            state
                .rate_limiter
                .enforce(
                    "code_entry",
                    &ip,
                    state.config.code_entry_limit_per_10s as i64,
                    chrono::Duration::seconds(10),
                )
                .await?;
            Ok(Html(render_code_entry_form()))
        }
        Some(raw) => {
            let browser_country = country_header(&headers);
            let page = state
                .device_flow
                .begin_verification(&raw, &ip, browser_country.as_deref())
                .await?;
            Ok(Html(render_confirmation_page(&page)))
        }
    }
}

fn render_code_entry_form() -> String {
    "<html><body><h1>Enter your device code</h1>\
     <form method=\"get\" action=\"/device\">\
     <input name=\"user_code\" placeholder=\"XXXX-XXXX\" autocapitalize=\"characters\" required>\
     <button type=\"submit\">Continue</button></form></body></html>"
        .to_string()
}

fn render_confirmation_page(page: &ConfirmationPageData) -> String {
    let mismatch_banner = if page.country_mismatch {
        "<p class=\"warning\">This device appears to be in a different country than your browser.</p>"
    } else {
        ""
    };
    format!(
        "<html><body><h1>Confirm device authorization</h1>\
         <p>Code: {}</p>{}\
         <form method=\"post\" action=\"/device/confirm\">\
         <input type=\"hidden\" name=\"session_id\" value=\"{}\">\
         <input type=\"hidden\" name=\"user_code\" value=\"{}\">\
         <button type=\"submit\">Approve</button></form>\
         <form method=\"get\" action=\"/device/cancel\">\
         <input type=\"hidden\" name=\"user_code\" value=\"{}\">\
         <button type=\"submit\">Deny</button></form></body></html>",
        page.user_code, mismatch_banner, page.session_id, page.user_code, page.user_code,
    )
}

#[derive(Debug, Deserialize)]
pub struct ConfirmForm {
    pub session_id: String,
    pub user_code: String,
}

/// `POST /device/confirm`. CSRF is satisfied by `session_id` itself: an
/// unguessable server-generated value delivered to this browser alone as a
/// hidden form field, never exposed anywhere else (see DESIGN.md).
pub async fn confirm(
    State(state): State<AppState>,
    axum::Form(form): axum::Form<ConfirmForm>,
) -> Result<Response, AppError> {
    let redirect_url = state.device_flow.confirm(&form.session_id, &form.user_code).await?;
    Ok(axum::response::Redirect::to(&redirect_url).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CancelQuery {
    pub user_code: String,
}

pub async fn cancel(
    State(state): State<AppState>,
    Query(query): Query<CancelQuery>,
) -> Result<Html<String>, AppError> {
    state.device_flow.cancel(&query.user_code).await?;
    Ok(Html(
        "<html><body><h1>Device authorization cancelled</h1></body></html>".to_string(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct OAuthCallbackQuery {
    pub code: String,
    pub state: String,
}

pub async fn oauth_callback(
    State(state): State<AppState>,
    Query(query): Query<OAuthCallbackQuery>,
) -> Result<Html<String>, AppError> {
    let sections = state
        .device_flow
        .handle_oauth_callback(&query.code, &query.state)
        .await?;
    let session = auth_session::find(&state.pool, &query.state)
        .await?
        .ok_or_else(|| AppError::authentication("authorization session not found or expired"))?;
    Ok(Html(render_section_selection_page(&session.device_code, &sections)))
}

fn render_section_selection_page(device_code: &str, sections: &[SectionChoice]) -> String {
    let options: String = sections
        .iter()
        .map(|s| {
            let label = match &s.group_name {
                Some(group) => format!("{} ({group})", s.section_name),
                None => s.section_name.clone(),
            };
            format!(
                "<option value=\"{}\" data-name=\"{}\" data-group=\"{}\">{}</option>",
                s.section_id,
                s.section_name,
                s.group_name.as_deref().unwrap_or(""),
                label,
            )
        })
        .collect();
    format!(
        "<html><body><h1>Choose a section</h1>\
         <form method=\"post\" action=\"/device/select-section\">\
         <input type=\"hidden\" name=\"device_code\" value=\"{device_code}\">\
         <select name=\"section_id\" required>{options}</select>\
         <button type=\"submit\">Link device</button></form></body></html>"
    )
}

#[derive(Debug, Deserialize)]
pub struct SelectSectionForm {
    pub device_code: String,
    pub section_id: String,
    pub section_name: String,
    pub group_name: Option<String>,
}

pub async fn select_section(
    State(state): State<AppState>,
    axum::Form(form): axum::Form<SelectSectionForm>,
) -> Result<Html<String>, AppError> {
    state
        .device_flow
        .select_section(&form.device_code, &form.section_id, &form.section_name, form.group_name.as_deref())
        .await?;
    Ok(Html(
        "<html><body><h1>Device linked</h1><p>Return to your device to continue.</p></body></html>".to_string(),
    ))
}

/// `GET /device/qr?user_code=...` — an SVG rendering of the short
/// verification URL, grounded on the teacher's `get_companion_qr_svg`
/// (`qrcode::QrCode::new` + `render::<svg::Color>()`). The device itself
/// requests this once at setup time rather than rendering the code locally.
pub async fn qr_code(
    State(state): State<AppState>,
    Query(query): Query<CancelQuery>,
) -> Result<Response, AppError> {
    let normalized = user_code::normalize(&query.user_code)
        .ok_or_else(|| AppError::invalid_input_field("malformed user code", "user_code"))?;
    let short = user_code::to_short_form(&normalized);
    let url = format!("https://{}/d/{short}", state.config.external_domain);

    let qr = qrcode::QrCode::new(url.as_bytes())
        .map_err(|e| AppError::internal(format!("failed to generate QR code: {e}")))?;
    let svg = qr.render::<qrcode::render::svg::Color>().min_dimensions(200, 200).build();

    Ok(([(header::CONTENT_TYPE, "image/svg+xml")], svg).into_response())
}

/// `GET /d/{code}` — the short verification URL encoded in the QR code
/// rendered on the scoreboard device itself, grounded on the teacher's
/// `commands/companion_settings.rs` QR-SVG generation (see DESIGN.md).
/// A manual 302 is built here rather than `axum::response::Redirect::to`,
/// which produces a 303.
pub async fn short_redirect(Path(code): Path<String>) -> Result<Response, AppError> {
    let user_code = user_code::from_short_form(&code)
        .ok_or_else(|| AppError::invalid_input_field("malformed short code", "code"))?;
    let location = format!("/device?user_code={user_code}");
    Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
}

#[derive(Debug, Serialize)]
pub struct ApiPatrol {
    pub id: String,
    pub name: String,
    pub score: i64,
}

#[derive(Debug, Serialize)]
pub struct PatrolsApiResponse {
    pub patrols: Vec<ApiPatrol>,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub from_cache: bool,
}

impl From<PatrolScoresResponse> for PatrolsApiResponse {
    fn from(response: PatrolScoresResponse) -> Self {
        Self {
            patrols: response
                .patrols
                .into_iter()
                .map(|p| ApiPatrol { id: p.id, name: p.name, score: p.points })
                .collect(),
            cached_at: response.cached_at,
            expires_at: response.expires_at,
            from_cache: response.from_cache,
        }
    }
}

/// The device API's own `{error, retry_after, blocked_until}` wire shape for
/// the block/rate-limit cases, parallel to `TokenErrorBody`'s RFC 8628 shape
/// above: `AppError`'s generic `{"type":..., "details":...}` envelope is not
/// what a device client polling this endpoint is written against.
#[derive(Debug, Serialize)]
struct DeviceApiErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    blocked_until: Option<DateTime<Utc>>,
}

fn device_api_error_response(err: AppError) -> Response {
    match err {
        AppError::UserBlocked { retry_after } => {
            let blocked_until = Utc::now() + chrono::Duration::seconds(retry_after);
            let body = DeviceApiErrorBody {
                error: "user_temporary_block",
                retry_after: Some(retry_after),
                blocked_until: Some(blocked_until),
            };
            let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, retry_after.to_string().parse().unwrap());
            response
        }
        AppError::ServiceBlocked => {
            let body = DeviceApiErrorBody {
                error: "service_blocked",
                retry_after: None,
                blocked_until: None,
            };
            (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
        }
        other => other.into_response(),
    }
}

/// `GET /api/v1/patrols` — device bearer-token auth. The `device_access_token`
/// is the opaque token issued by `select_section`; it is resolved here to
/// the device's own `device_code` before delegating to the read path.
pub async fn patrols(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let token = match bearer_token(&headers) {
        Some(token) => token,
        None => return AppError::authentication("missing bearer token").into_response(),
    };
    let record = match device_code::find_by_device_access_token(&state.pool, token).await {
        Ok(Some(record)) => record,
        Ok(None) => return AppError::authentication("invalid device access token").into_response(),
        Err(err) => return err.into_response(),
    };
    match state.patrol_score.get_scores_for_device(&record.device_code).await {
        Ok(scores) => Json(PatrolsApiResponse::from(scores)).into_response(),
        Err(err) => device_api_error_response(err),
    }
}
