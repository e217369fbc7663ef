//! Password login, token refresh and account credential management.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use axum_extra::extract::cookie::CookieJar;
use chrono::{Duration, Utc};
use serde_json::json;
use validator::Validate;

use service_core::error::AppError;

use crate::dtos::{
    ChangePasswordRequest, CsrfResponse, ForgotPasswordRequest, LoginRequest, MessageResponse,
    MfaChallengeResponse, MfaLoginRequest, RegisterRequest, ResetPasswordRequest, TokenResponse,
};
use crate::middleware::AuthUser;
use crate::models::{
    default_permissions, AuthEventType, Session, User, UserResponse, UserRole,
    PASSWORD_LIFETIME_DAYS,
};
use crate::services::challenge::keys;
use crate::services::token::new_opaque_token;
use crate::services::{IssuedTokens, MfaMethod, ServiceError};
use crate::utils::context::{client_ip, fingerprint_from_user_agent, geo_from_headers};
use crate::utils::password::{hash_password, verify_password, Password, PasswordHashString};
use crate::AppState;

use super::{audit, audit_event, clear_refresh_cookie, refresh_cookie, require_csrf, REFRESH_COOKIE};

const MFA_TICKET_TTL_SECONDS: u64 = 300;
const PASSWORD_RESET_TTL_SECONDS: u64 = 1800;
const EVENT_PAGE_SIZE: i64 = 50;

/// Create the session and token set for a fully authenticated user.
async fn establish_session(
    state: &AppState,
    headers: &HeaderMap,
    user: &User,
    remember_me: bool,
) -> Result<(Session, IssuedTokens), ServiceError> {
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let fingerprint = fingerprint_from_user_agent(&user_agent);
    let geo = geo_from_headers(headers);

    let session = state
        .sessions
        .create(
            user.user_id,
            client_ip(headers),
            user_agent,
            fingerprint,
            geo,
            remember_me,
        )
        .await?;
    let permissions = default_permissions(user.role(), user.is_solo_lawyer);
    let issued = state
        .tokens
        .issue_for_session(user, &session, permissions)
        .await?;
    Ok((session, issued))
}

fn token_response(user: User, issued: &IssuedTokens) -> TokenResponse {
    TokenResponse {
        access_token: issued.access_token.clone(),
        token_type: "Bearer".to_string(),
        expires_in: issued.expires_in,
        csrf_token: issued.csrf_token.clone(),
        user: UserResponse::from(user),
    }
}

#[utoipa::path(
    post,
    path = "/api/v2/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created", body = TokenResponse),
        (status = 409, description = "Email already registered"),
    ),
    tag = "auth"
)]
pub async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(payload): Json<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;
    let role = UserRole::parse(&payload.role)
        .ok_or_else(|| ServiceError::Validation("Unknown role".to_string()))?;

    let email = payload.email.trim().to_lowercase();
    if state.db.find_user_by_email(&email).await?.is_some() {
        return Err(ServiceError::EmailAlreadyRegistered.into());
    }

    let hash = hash_password(&Password::new(payload.password))
        .map_err(ServiceError::Internal)?;
    let mut user = User::new(email, Some(hash.into_string()), role);
    user.is_solo_lawyer = payload.is_solo_lawyer.unwrap_or(false);
    state.db.insert_user(&user).await?;

    let (session, issued) = establish_session(&state, &headers, &user, false).await?;
    audit(
        &state,
        audit_event(AuthEventType::LoginSuccess, &headers)
            .user(user.user_id)
            .session(session.session_id)
            .detail(json!({ "method": "register" })),
    );

    let jar = jar.add(refresh_cookie(&state, &issued));
    let body = token_response(user, &issued);
    Ok((StatusCode::CREATED, jar, Json(body)))
}

#[utoipa::path(
    post,
    path = "/api/v2/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Authenticated, or an MFA ticket when a second factor is required", body = TokenResponse),
        (status = 401, description = "Invalid credentials"),
    ),
    tag = "auth"
)]
pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(payload): Json<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;
    let email = payload.email.trim().to_lowercase();
    // A distributed credential-stuffing run cannot hide behind many source
    // addresses: the target account has its own budget.
    state.auth_limiter.check_account(&email)?;

    let user = match state.db.find_user_by_email(&email).await? {
        Some(user) if user.is_active() => user,
        _ => {
            audit(
                &state,
                audit_event(AuthEventType::LoginFailed, &headers)
                    .detail(json!({ "email": email, "reason": "unknown_or_disabled" })),
            );
            return Err(ServiceError::InvalidCredentials.into());
        }
    };

    // SSO-managed and passwordless accounts have no password to check.
    let Some(stored_hash) = user.password_hash.clone() else {
        audit(
            &state,
            audit_event(AuthEventType::LoginFailed, &headers)
                .user(user.user_id)
                .detail(json!({ "reason": "no_password" })),
        );
        return Err(ServiceError::InvalidCredentials.into());
    };
    if verify_password(
        &Password::new(payload.password),
        &PasswordHashString::new(stored_hash),
    )
    .is_err()
    {
        audit(
            &state,
            audit_event(AuthEventType::LoginFailed, &headers)
                .user(user.user_id)
                .detail(json!({ "reason": "bad_password" })),
        );
        return Err(ServiceError::InvalidCredentials.into());
    }

    if user.mfa_enabled {
        // Password alone does not finish the login. Park a single-use
        // ticket and let the client come back with a code.
        let ticket = new_opaque_token();
        let payload_json = json!({
            "user_id": user.user_id,
            "remember_me": payload.remember_me,
        });
        state
            .challenges
            .put(
                &keys::mfa_login(&ticket),
                &payload_json.to_string(),
                MFA_TICKET_TTL_SECONDS,
            )
            .await
            .map_err(ServiceError::from)?;
        let body = MfaChallengeResponse {
            mfa_required: true,
            mfa_ticket: ticket,
        };
        return Ok((StatusCode::OK, jar, Json(body)).into_response());
    }

    let (session, issued) = establish_session(&state, &headers, &user, payload.remember_me).await?;
    audit(
        &state,
        audit_event(AuthEventType::LoginSuccess, &headers)
            .user(user.user_id)
            .session(session.session_id)
            .detail(json!({ "method": "password" })),
    );

    let jar = jar.add(refresh_cookie(&state, &issued));
    let body = token_response(user, &issued);
    Ok((StatusCode::OK, jar, Json(body)).into_response())
}

#[utoipa::path(
    post,
    path = "/api/v2/auth/login/mfa",
    request_body = MfaLoginRequest,
    responses(
        (status = 200, description = "Authenticated", body = TokenResponse),
        (status = 401, description = "Invalid ticket or code"),
    ),
    tag = "auth"
)]
pub async fn login_mfa(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(payload): Json<MfaLoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let stored = state
        .challenges
        .take(&keys::mfa_login(&payload.mfa_ticket))
        .await
        .map_err(ServiceError::from)?
        .ok_or(ServiceError::InvalidCredentials)?;
    let ticket: serde_json::Value = serde_json::from_str(&stored)
        .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Ticket deserialization: {e}")))?;
    let user_id = ticket["user_id"]
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or(ServiceError::InvalidCredentials)?;
    let remember_me = ticket["remember_me"].as_bool().unwrap_or(false) || payload.remember_me;

    let user = state
        .db
        .find_user_by_id(user_id)
        .await?
        .filter(User::is_active)
        .ok_or(ServiceError::InvalidCredentials)?;

    let method = state.mfa.verify(&user, &payload.code).await?;
    let (session, issued) = establish_session(&state, &headers, &user, remember_me).await?;
    let event_type = match method {
        MfaMethod::Totp => AuthEventType::MfaVerified,
        MfaMethod::BackupCode => AuthEventType::BackupCodeConsumed,
    };
    audit(
        &state,
        audit_event(event_type, &headers)
            .user(user.user_id)
            .session(session.session_id),
    );
    audit(
        &state,
        audit_event(AuthEventType::LoginSuccess, &headers)
            .user(user.user_id)
            .session(session.session_id)
            .detail(json!({ "method": "password+mfa" })),
    );

    let jar = jar.add(refresh_cookie(&state, &issued));
    let body = token_response(user, &issued);
    Ok((StatusCode::OK, jar, Json(body)))
}

#[utoipa::path(
    post,
    path = "/api/v2/auth/refresh",
    responses(
        (status = 200, description = "New token pair", body = TokenResponse),
        (status = 401, description = "Missing, expired or replayed refresh token"),
        (status = 403, description = "CSRF token mismatch"),
    ),
    tag = "auth"
)]
pub async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse, AppError> {
    let presented = jar
        .get(REFRESH_COOKIE)
        .map(|c| c.value().to_string())
        .ok_or(ServiceError::InvalidToken)?;

    // Double-submit check before the rotation burns the token. The token
    // record is only peeked here; `rotate` does the authoritative work.
    let record = state
        .db
        .find_refresh_token_by_hash(&crate::models::RefreshToken::hash(&presented))
        .await?
        .ok_or(ServiceError::InvalidToken)?;
    require_csrf(&state, &headers, record.session_id).await?;

    let (user, session, issued) = state
        .tokens
        .rotate(&presented, |u| {
            default_permissions(u.role(), u.is_solo_lawyer)
        })
        .await
        .map_err(|e| {
            if matches!(e, ServiceError::TokenReuse) {
                audit(
                    &state,
                    audit_event(AuthEventType::TokenReuseDetected, &headers)
                        .session(record.session_id)
                        .user(record.user_id),
                );
            }
            e
        })?;
    audit(
        &state,
        audit_event(AuthEventType::TokenRefreshed, &headers)
            .user(user.user_id)
            .session(session.session_id),
    );

    let jar = jar.add(refresh_cookie(&state, &issued));
    let body = token_response(user, &issued);
    Ok((StatusCode::OK, jar, Json(body)))
}

#[utoipa::path(
    post,
    path = "/api/v2/auth/logout",
    responses(
        (status = 200, description = "Session terminated", body = MessageResponse),
        (status = 403, description = "CSRF token mismatch"),
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    auth: AuthUser,
) -> Result<impl IntoResponse, AppError> {
    require_csrf(&state, &headers, auth.session.session_id).await?;
    state.tokens.revoke_session(auth.session.session_id).await?;
    audit(
        &state,
        audit_event(AuthEventType::Logout, &headers)
            .user(auth.user.user_id)
            .session(auth.session.session_id),
    );
    let jar = jar.add(clear_refresh_cookie(&state));
    Ok((
        jar,
        Json(MessageResponse::new(
            "تم تسجيل الخروج بنجاح",
            "Logged out successfully",
        )),
    ))
}

#[utoipa::path(
    post,
    path = "/api/v2/auth/logout/all",
    responses(
        (status = 200, description = "Every session terminated, the current one included", body = MessageResponse),
        (status = 403, description = "CSRF token mismatch"),
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn logout_all(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    auth: AuthUser,
) -> Result<impl IntoResponse, AppError> {
    require_csrf(&state, &headers, auth.session.session_id).await?;
    let revoked = state
        .tokens
        .revoke_user_sessions(auth.user.user_id, None)
        .await?;
    audit(
        &state,
        audit_event(AuthEventType::LogoutAll, &headers)
            .user(auth.user.user_id)
            .session(auth.session.session_id)
            .detail(json!({ "revoked": revoked })),
    );
    let jar = jar.add(clear_refresh_cookie(&state));
    Ok((
        jar,
        Json(MessageResponse::new(
            "تم تسجيل الخروج من جميع الجلسات",
            "Logged out of all sessions",
        )),
    ))
}

#[utoipa::path(
    get,
    path = "/api/v2/auth/csrf",
    responses((status = 200, description = "Fresh CSRF token", body = CsrfResponse)),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn csrf(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<CsrfResponse>, AppError> {
    let csrf_token = state.tokens.issue_csrf(auth.session.session_id).await?;
    Ok(Json(CsrfResponse { csrf_token }))
}

#[utoipa::path(
    get,
    path = "/api/v2/auth/me",
    responses((status = 200, description = "The authenticated account", body = UserResponse)),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn me(auth: AuthUser) -> Json<UserResponse> {
    Json(UserResponse::from(auth.user))
}

#[utoipa::path(
    get,
    path = "/api/v2/auth/events",
    responses((status = 200, description = "Recent authentication events", body = [crate::models::AuthEvent])),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn events(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Vec<crate::models::AuthEvent>>, AppError> {
    let events = state
        .db
        .find_auth_events(auth.user.user_id, EVENT_PAGE_SIZE)
        .await?;
    Ok(Json(events))
}

#[utoipa::path(
    post,
    path = "/api/v2/auth/password/change",
    request_body = ChangePasswordRequest,
    responses(
        (status = 200, description = "Password changed; other sessions revoked", body = MessageResponse),
        (status = 401, description = "Current password incorrect"),
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn change_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    auth: AuthUser,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    payload.validate()?;

    let Some(stored_hash) = auth.user.password_hash.clone() else {
        return Err(ServiceError::NoPassword.into());
    };
    if verify_password(
        &Password::new(payload.current_password),
        &PasswordHashString::new(stored_hash),
    )
    .is_err()
    {
        return Err(ServiceError::InvalidPassword.into());
    }

    let hash = hash_password(&Password::new(payload.new_password))
        .map_err(ServiceError::Internal)?;
    state
        .db
        .update_user_password(
            auth.user.user_id,
            hash.as_str(),
            Utc::now() + Duration::days(PASSWORD_LIFETIME_DAYS),
        )
        .await?;
    // A changed password invalidates every other session.
    state
        .tokens
        .revoke_user_sessions(auth.user.user_id, Some(auth.session.session_id))
        .await?;
    audit(
        &state,
        audit_event(AuthEventType::PasswordChanged, &headers)
            .user(auth.user.user_id)
            .session(auth.session.session_id),
    );
    Ok(Json(MessageResponse::new(
        "تم تغيير كلمة المرور بنجاح",
        "Password changed successfully",
    )))
}

#[utoipa::path(
    post,
    path = "/api/v2/auth/password/forgot",
    request_body = ForgotPasswordRequest,
    responses((status = 200, description = "Always generic, regardless of account existence", body = MessageResponse)),
    tag = "auth"
)]
pub async fn forgot_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ForgotPasswordRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    payload.validate()?;
    let email = payload.email.trim().to_lowercase();
    state.sensitive_limiter.check_account(&email)?;

    // The response never reveals whether the account exists.
    if let Some(user) = state.db.find_user_by_email(&email).await? {
        if user.is_active() && user.password_hash.is_some() {
            let token = new_opaque_token();
            let token_hash = crate::models::RefreshToken::hash(&token);
            state
                .challenges
                .put(
                    &keys::password_reset(&token_hash),
                    &user.user_id.to_string(),
                    PASSWORD_RESET_TTL_SECONDS,
                )
                .await
                .map_err(ServiceError::from)?;
            audit(
                &state,
                audit_event(AuthEventType::PasswordResetRequested, &headers).user(user.user_id),
            );
            deliver_reset_token(&state, &email, token);
        }
    }

    Ok(Json(MessageResponse::new(
        "إذا كان البريد الإلكتروني مسجلاً، فسيتم إرسال رابط إعادة التعيين",
        "If the email is registered, a reset link will be sent",
    )))
}

/// Hand the reset token to the notification service. Fire-and-forget; a
/// delivery failure is logged and the token simply expires unused.
fn deliver_reset_token(state: &AppState, email: &str, token: String) {
    let Some(webhook) = state.config.notify_webhook_url.clone() else {
        tracing::warn!("No notification webhook configured; reset token not delivered");
        return;
    };
    let email = email.to_string();
    tokio::spawn(async move {
        let result = reqwest::Client::new()
            .post(&webhook)
            .json(&json!({ "kind": "password_reset", "email": email, "token": token }))
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                tracing::error!(status = %resp.status(), "Notification service rejected reset delivery")
            }
            Err(e) => tracing::error!(error = %e, "Failed to reach notification service"),
        }
    });
}

#[utoipa::path(
    post,
    path = "/api/v2/auth/password/reset",
    request_body = ResetPasswordRequest,
    responses(
        (status = 200, description = "Password reset; all sessions revoked", body = MessageResponse),
        (status = 401, description = "Invalid or expired reset token"),
    ),
    tag = "auth"
)]
pub async fn reset_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ResetPasswordRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    payload.validate()?;

    let token_hash = crate::models::RefreshToken::hash(&payload.token);
    let user_id: uuid::Uuid = state
        .challenges
        .take(&keys::password_reset(&token_hash))
        .await
        .map_err(ServiceError::from)?
        .and_then(|s| s.parse().ok())
        .ok_or(ServiceError::InvalidToken)?;

    let user = state
        .db
        .find_user_by_id(user_id)
        .await?
        .filter(User::is_active)
        .ok_or(ServiceError::InvalidToken)?;

    let hash = hash_password(&Password::new(payload.new_password))
        .map_err(ServiceError::Internal)?;
    state
        .db
        .update_user_password(
            user.user_id,
            hash.as_str(),
            Utc::now() + Duration::days(PASSWORD_LIFETIME_DAYS),
        )
        .await?;
    state.tokens.revoke_user_sessions(user.user_id, None).await?;
    audit(
        &state,
        audit_event(AuthEventType::PasswordResetCompleted, &headers).user(user.user_id),
    );
    Ok(Json(MessageResponse::new(
        "تم إعادة تعيين كلمة المرور بنجاح",
        "Password reset successfully",
    )))
}
