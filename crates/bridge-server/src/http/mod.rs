//! HTTP bootstrap: router composition, shared state, and graceful shutdown.
//!
//! Grounded on the companion server's `services/companion_server.rs` (router
//! composition, `CancellationToken`-driven graceful shutdown) and
//! `companion_api.rs` (centralized error mapping, here handled directly by
//! `AppError: IntoResponse` rather than a separate wrapper type). Unlike the
//! companion server, this binary owns its process lifecycle end-to-end, so
//! the external start/stop singleton the companion server needs for its
//! IPC-driven lifecycle is dropped (see DESIGN.md).

pub mod admin;
pub mod device;
pub mod health;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::error_handling::HandleErrorLayer;
use axum::http::HeaderMap;
use axum::middleware;
use axum::routing::{get, post};
use axum::{BoxError, Router};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::cache::Cache;
use crate::config::Config;
use crate::db::pool::DbPool;
use crate::error::AppError;
use crate::services::device_flow::DeviceFlowService;
use crate::services::patrol_score::PatrolScoreService;
use crate::services::rate_limiter::RateLimiter;
use crate::services::score_update::ScoreUpdateService;
use crate::services::web_flow::WebFlowService;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub cache: Arc<dyn Cache>,
    pub config: Arc<Config>,
    pub rate_limiter: RateLimiter,
    pub device_flow: Arc<DeviceFlowService>,
    pub web_flow: Arc<WebFlowService>,
    pub patrol_score: Arc<PatrolScoreService>,
    pub score_update: Arc<ScoreUpdateService>,
}

async fn handle_middleware_error(err: BoxError) -> AppError {
    if err.is::<tower::timeout::error::Elapsed>() {
        AppError::upstream("request exceeded the per-handler deadline")
    } else {
        AppError::internal(format!("unhandled middleware error: {err}"))
    }
}

/// Build the full router: unprotected device/browser surfaces, the
/// cookie-protected admin API, and the unauthenticated health probe.
pub fn router(state: AppState) -> Router {
    let deadline = state.config.request_deadline;

    let admin_api = Router::new()
        .route(
            "/api/admin/sections/{id}/scores",
            get(admin::get_scores).post(admin::post_scores),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), admin::require_session));

    Router::new()
        .route("/device/authorize", post(device::authorize))
        .route("/device/token", post(device::token))
        .route("/device", get(device::device_page))
        .route("/device/qr", get(device::qr_code))
        .route("/device/confirm", post(device::confirm))
        .route("/device/cancel", get(device::cancel))
        .route("/oauth/callback", get(device::oauth_callback))
        .route("/device/select-section", post(device::select_section))
        .route("/d/{code}", get(device::short_redirect))
        .route("/api/v1/patrols", get(device::patrols))
        .route("/admin/login", get(admin::login))
        .route("/admin/callback", get(admin::callback))
        .route("/admin/logout", post(admin::logout))
        .merge(admin_api)
        .route("/healthz", get(health::healthz))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_middleware_error))
                .layer(TimeoutLayer::new(deadline)),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Run the server until `shutdown` resolves, then drain in-flight requests.
pub async fn serve(addr: SocketAddr, state: AppState, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "bridge-server listening");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

pub(crate) fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(axum::http::header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|cookies| {
            cookies.split(';').find_map(|c| {
                let c = c.trim();
                c.strip_prefix(name).and_then(|rest| rest.strip_prefix('='))
            })
        })
}

/// Reads a CDN/reverse-proxy-injected country header when present. Real
/// geo-IP resolution is an external collaborator out of scope here (see
/// DESIGN.md); this is a best-effort fallback, never a hard requirement.
pub(crate) fn country_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get("cf-ipcountry")
        .or_else(|| headers.get("x-country-code"))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

pub(crate) fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| addr.ip().to_string())
}
