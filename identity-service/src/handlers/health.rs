//! Liveness and readiness probes.

use axum::{extract::State, http::StatusCode, Json};

use crate::dtos::HealthResponse;
use crate::AppState;

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = HealthResponse)),
    tag = "health"
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: state.config.service_name.clone(),
        version: state.config.service_version.clone(),
    })
}

/// Readiness checks the database; a failure flips the pod out of rotation.
#[utoipa::path(
    get,
    path = "/ready",
    responses(
        (status = 200, description = "Dependencies reachable", body = HealthResponse),
        (status = 503, description = "Database unreachable"),
    ),
    tag = "health"
)]
pub async fn ready(
    State(state): State<AppState>,
) -> Result<Json<HealthResponse>, StatusCode> {
    if state.db.health_check().await.is_err() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(HealthResponse {
        status: "ready".to_string(),
        service: state.config.service_name.clone(),
        version: state.config.service_version.clone(),
    }))
}
