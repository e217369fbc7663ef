//! Authentication middleware.
//!
//! Validates the bearer token, resolves the live session behind its `sid`
//! claim and runs the per-request risk signals. Handlers pick the result up
//! from request extensions through the [`AuthUser`] extractor.

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};

use service_core::error::{AppError, ErrorBody};

use crate::models::{Session, SuspicionReason, User};
use crate::services::{AccessTokenClaims, ServiceError};
use crate::utils::context::{client_ip, fingerprint_from_user_agent, geo_from_headers};
use crate::AppState;

/// The authenticated caller, as resolved by [`auth_middleware`].
#[derive(Clone)]
pub struct AuthUser {
    pub user: User,
    pub session: Session,
    pub claims: AccessTokenClaims,
}

fn missing_token() -> AppError {
    AppError::Unauthorized(ErrorBody::new(
        "INVALID_TOKEN",
        "رمز الدخول مفقود",
        "Missing or invalid Authorization header",
    ))
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(missing_token)?;

    let claims = state.tokens.validate_access_token(token)?;

    let session_id = claims
        .sid
        .parse()
        .map_err(|_| ServiceError::InvalidToken)?;
    let mut session = state
        .sessions
        .find_valid(session_id)
        .await?
        .ok_or(ServiceError::InvalidToken)?;

    let user = state
        .db
        .find_user_by_id(session.user_id)
        .await?
        .filter(User::is_active)
        .ok_or(ServiceError::InvalidToken)?;

    // Per-request risk signals; flags only, never a rejection.
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let fingerprint = fingerprint_from_user_agent(user_agent);
    let geo = geo_from_headers(req.headers());
    let ip = client_ip(req.headers());
    let raised = state
        .sessions
        .note_activity(&mut session, &ip, &fingerprint, geo.as_ref())
        .await?;
    if !raised.is_empty() {
        audit_flags(&state, &session, &raised);
    }

    req.extensions_mut().insert(AuthUser {
        user,
        session,
        claims,
    });
    Ok(next.run(req).await)
}

fn audit_flags(state: &AppState, session: &Session, raised: &[SuspicionReason]) {
    let reasons: Vec<&'static str> = raised.iter().map(SuspicionReason::as_str).collect();
    tracing::warn!(session_id = %session.session_id, ?reasons, "Session flagged");
    let db = state.db.clone();
    let event = crate::models::AuthEvent::new(crate::models::AuthEventType::SessionFlagged)
        .user(session.user_id)
        .session(session.session_id)
        .ip(session.ip_address.clone())
        .detail(serde_json::json!({ "reasons": reasons }));
    tokio::spawn(async move {
        if let Err(e) = db.insert_auth_event(&event).await {
            tracing::error!(error = %e, "Failed to record audit event");
        }
    });
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or_else(|| missing_token().into_response())
    }
}
