//! `GET /healthz` — ambient liveness probe, not part of the distilled
//! surface but carried the way the rest of this codebase carries its
//! ambient stack (see DESIGN.md).

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::error::AppError;
use crate::http::AppState;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    perm_blocked: bool,
}

pub async fn healthz(State(state): State<AppState>) -> Result<Json<HealthStatus>, AppError> {
    let perm_blocked = state.cache.get("perm_blocked").await?.is_some();
    Ok(Json(HealthStatus { status: "ok", perm_blocked }))
}
