//! Security-center session management.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde_json::json;
use uuid::Uuid;

use service_core::error::AppError;

use crate::dtos::MessageResponse;
use crate::middleware::AuthUser;
use crate::models::{AuthEventType, SessionInfo};
use crate::AppState;

use super::{audit, audit_event, require_csrf};

#[utoipa::path(
    get,
    path = "/api/v2/auth/sessions",
    responses((status = 200, description = "Active sessions, current one marked", body = [SessionInfo])),
    security(("bearer" = [])),
    tag = "sessions"
)]
pub async fn list(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Vec<SessionInfo>>, AppError> {
    let sessions = state
        .sessions
        .list(auth.user.user_id, auth.session.session_id)
        .await?;
    Ok(Json(sessions))
}

#[utoipa::path(
    delete,
    path = "/api/v2/auth/sessions/{session_id}",
    params(("session_id" = Uuid, Path, description = "Session to terminate")),
    responses(
        (status = 200, description = "Session terminated", body = MessageResponse),
        (status = 403, description = "CSRF token mismatch"),
        (status = 404, description = "Not this user's session"),
    ),
    security(("bearer" = [])),
    tag = "sessions"
)]
pub async fn terminate(
    State(state): State<AppState>,
    headers: HeaderMap,
    auth: AuthUser,
    Path(session_id): Path<Uuid>,
) -> Result<Json<MessageResponse>, AppError> {
    require_csrf(&state, &headers, auth.session.session_id).await?;
    let session = state
        .sessions
        .find_owned(auth.user.user_id, session_id)
        .await?;
    state.tokens.revoke_session(session.session_id).await?;
    audit(
        &state,
        audit_event(AuthEventType::SessionTerminated, &headers)
            .user(auth.user.user_id)
            .session(session.session_id)
            .detail(json!({ "by_session": auth.session.session_id })),
    );
    Ok(Json(MessageResponse::new(
        "تم إنهاء الجلسة",
        "Session terminated",
    )))
}

#[utoipa::path(
    delete,
    path = "/api/v2/auth/sessions",
    responses(
        (status = 200, description = "All other sessions terminated", body = MessageResponse),
        (status = 403, description = "CSRF token mismatch"),
    ),
    security(("bearer" = [])),
    tag = "sessions"
)]
pub async fn terminate_others(
    State(state): State<AppState>,
    headers: HeaderMap,
    auth: AuthUser,
) -> Result<Json<MessageResponse>, AppError> {
    require_csrf(&state, &headers, auth.session.session_id).await?;
    let revoked = state
        .tokens
        .revoke_user_sessions(auth.user.user_id, Some(auth.session.session_id))
        .await?;
    audit(
        &state,
        audit_event(AuthEventType::SessionTerminated, &headers)
            .user(auth.user.user_id)
            .session(auth.session.session_id)
            .detail(json!({ "scope": "others", "revoked": revoked })),
    );
    Ok(Json(MessageResponse::new(
        "تم إنهاء الجلسات الأخرى",
        "Other sessions terminated",
    )))
}
