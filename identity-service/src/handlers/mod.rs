//! HTTP handlers, grouped by concern.

pub mod auth;
pub mod health;
pub mod mfa;
pub mod saml;
pub mod session;
pub mod webauthn;

use axum::http::HeaderMap;
use axum_extra::extract::cookie::{Cookie, SameSite};
use uuid::Uuid;

use crate::models::{AuthEvent, AuthEventType};
use crate::services::{IssuedTokens, ServiceError};
use crate::AppState;

/// Cookie carrying the opaque refresh token. Scoped to the auth API so it
/// never rides along on ordinary requests.
pub const REFRESH_COOKIE: &str = "refresh_token";
const REFRESH_COOKIE_PATH: &str = "/api/v2/auth";

/// Header carrying the CSRF double-submit value on cookie-authenticated
/// requests.
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Value of the CSRF header, when present and readable.
pub(crate) fn csrf_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(CSRF_HEADER).and_then(|v| v.to_str().ok())
}

/// Double-submit check for mutating requests on a session the refresh
/// cookie rides along with. The header must match the session's stored
/// CSRF token.
pub(crate) async fn require_csrf(
    state: &AppState,
    headers: &HeaderMap,
    session_id: Uuid,
) -> Result<(), ServiceError> {
    let presented = csrf_header(headers).ok_or(ServiceError::CsrfMismatch)?;
    state.tokens.verify_csrf(session_id, presented).await
}

/// Fire-and-forget audit write. Failures are logged, never surfaced.
pub(crate) fn audit(state: &AppState, event: AuthEvent) {
    let db = state.db.clone();
    tokio::spawn(async move {
        if let Err(e) = db.insert_auth_event(&event).await {
            tracing::error!(error = %e, "Failed to record audit event");
        }
    });
}

/// Audit event pre-filled with the request's network context.
pub(crate) fn audit_event(event_type: AuthEventType, headers: &HeaderMap) -> AuthEvent {
    AuthEvent::new(event_type)
        .ip(crate::utils::context::client_ip(headers))
        .agent(
            headers
                .get(axum::http::header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default(),
        )
}

/// Build the httpOnly refresh cookie for a freshly issued token pair.
pub(crate) fn refresh_cookie(state: &AppState, issued: &IssuedTokens) -> Cookie<'static> {
    let mut cookie = Cookie::build((REFRESH_COOKIE, issued.refresh_token.clone()))
        .path(REFRESH_COOKIE_PATH)
        .http_only(true)
        .secure(state.config.security.cookie_secure)
        .same_site(SameSite::Strict)
        .max_age(time::Duration::days(issued.refresh_lifetime_days))
        .build();
    if let Some(domain) = &state.config.security.cookie_domain {
        cookie.set_domain(domain.clone());
    }
    cookie
}

/// An expired cookie that clears the refresh token in the browser.
pub(crate) fn clear_refresh_cookie(state: &AppState) -> Cookie<'static> {
    let mut cookie = Cookie::build((REFRESH_COOKIE, ""))
        .path(REFRESH_COOKIE_PATH)
        .http_only(true)
        .secure(state.config.security.cookie_secure)
        .same_site(SameSite::Strict)
        .max_age(time::Duration::ZERO)
        .build();
    if let Some(domain) = &state.config.security.cookie_domain {
        cookie.set_domain(domain.clone());
    }
    cookie
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csrf_header_is_read_case_insensitively() {
        let mut headers = HeaderMap::new();
        assert_eq!(csrf_header(&headers), None);
        headers.insert("X-CSRF-Token", "value-1".parse().unwrap());
        assert_eq!(csrf_header(&headers), Some("value-1"));
    }
}
