//! Passkey registration, passkey login and credential management.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use axum_extra::extract::cookie::CookieJar;
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use service_core::error::AppError;

use crate::dtos::{
    MessageResponse, RenameCredentialRequest, TokenResponse,
    WebauthnFinishAuthenticationRequest, WebauthnFinishRegistrationRequest,
    WebauthnStartAuthenticationRequest, WebauthnStartAuthenticationResponse,
};
use crate::middleware::AuthUser;
use crate::models::{
    default_permissions, AuthEventType, User, UserResponse, WebAuthnCredentialResponse,
};
use crate::services::ServiceError;
use crate::utils::context::{client_ip, fingerprint_from_user_agent, geo_from_headers};
use crate::AppState;

use super::{audit, audit_event, refresh_cookie};

#[utoipa::path(
    post,
    path = "/api/v2/auth/webauthn/register/start",
    responses((status = 200, description = "Creation challenge for the browser")),
    security(("bearer" = [])),
    tag = "webauthn"
)]
pub async fn start_registration(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let challenge = state.webauthn.start_registration(&auth.user).await?;
    Ok(Json(challenge))
}

#[utoipa::path(
    post,
    path = "/api/v2/auth/webauthn/register/finish",
    request_body = WebauthnFinishRegistrationRequest,
    responses(
        (status = 201, description = "Credential registered", body = WebAuthnCredentialResponse),
        (status = 400, description = "Attestation rejected or no ceremony in progress"),
        (status = 409, description = "Credential id already registered"),
    ),
    security(("bearer" = [])),
    tag = "webauthn"
)]
pub async fn finish_registration(
    State(state): State<AppState>,
    headers: HeaderMap,
    auth: AuthUser,
    Json(payload): Json<WebauthnFinishRegistrationRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;
    let credential = state
        .webauthn
        .finish_registration(&auth.user, &payload.friendly_name, &payload.credential)
        .await?;
    audit(
        &state,
        audit_event(AuthEventType::WebauthnRegistered, &headers)
            .user(auth.user.user_id)
            .session(auth.session.session_id)
            .detail(json!({ "credential_id": credential.credential_id })),
    );
    Ok((
        StatusCode::CREATED,
        Json(WebAuthnCredentialResponse::from(credential)),
    ))
}

#[utoipa::path(
    post,
    path = "/api/v2/auth/webauthn/login/start",
    request_body = WebauthnStartAuthenticationRequest,
    responses(
        (status = 200, description = "Assertion challenge", body = WebauthnStartAuthenticationResponse),
        (status = 401, description = "Unknown account or no passkeys; indistinguishable"),
    ),
    tag = "webauthn"
)]
pub async fn start_authentication(
    State(state): State<AppState>,
    Json(payload): Json<WebauthnStartAuthenticationRequest>,
) -> Result<Json<WebauthnStartAuthenticationResponse>, AppError> {
    payload.validate()?;
    let (ceremony_id, challenge) = state
        .webauthn
        .start_authentication(payload.email.trim().to_lowercase().as_str())
        .await?;
    let challenge = serde_json::to_value(&challenge)
        .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Challenge serialization: {e}")))?;
    Ok(Json(WebauthnStartAuthenticationResponse {
        ceremony_id,
        challenge,
    }))
}

#[utoipa::path(
    post,
    path = "/api/v2/auth/webauthn/login/finish",
    request_body = WebauthnFinishAuthenticationRequest,
    responses(
        (status = 200, description = "Authenticated", body = TokenResponse),
        (status = 401, description = "Assertion rejected"),
    ),
    tag = "webauthn"
)]
pub async fn finish_authentication(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(payload): Json<WebauthnFinishAuthenticationRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state
        .webauthn
        .finish_authentication(payload.ceremony_id, &payload.credential)
        .await?;

    if outcome.clone_suspected {
        audit(
            &state,
            audit_event(AuthEventType::WebauthnCloneSuspected, &headers)
                .user(outcome.user_id)
                .detail(json!({
                    "credential_id": outcome.credential_id,
                    "reason": "sign_counter_regression",
                })),
        );
        return Err(ServiceError::CredentialCloneSuspected.into());
    }

    let user = state
        .db
        .find_user_by_id(outcome.user_id)
        .await?
        .filter(User::is_active)
        .ok_or(ServiceError::InvalidCredentials)?;

    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let session = state
        .sessions
        .create(
            user.user_id,
            client_ip(&headers),
            user_agent.clone(),
            fingerprint_from_user_agent(&user_agent),
            geo_from_headers(&headers),
            payload.remember_me,
        )
        .await?;
    let permissions = default_permissions(user.role(), user.is_solo_lawyer);
    let issued = state
        .tokens
        .issue_for_session(&user, &session, permissions)
        .await?;
    audit(
        &state,
        audit_event(AuthEventType::LoginSuccess, &headers)
            .user(user.user_id)
            .session(session.session_id)
            .detail(json!({ "method": "webauthn" })),
    );

    let jar = jar.add(refresh_cookie(&state, &issued));
    let body = TokenResponse {
        access_token: issued.access_token.clone(),
        token_type: "Bearer".to_string(),
        expires_in: issued.expires_in,
        csrf_token: issued.csrf_token.clone(),
        user: UserResponse::from(user),
    };
    Ok((StatusCode::OK, jar, Json(body)))
}

#[utoipa::path(
    get,
    path = "/api/v2/auth/webauthn/credentials",
    responses((status = 200, description = "Registered passkeys", body = [WebAuthnCredentialResponse])),
    security(("bearer" = [])),
    tag = "webauthn"
)]
pub async fn list_credentials(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Vec<WebAuthnCredentialResponse>>, AppError> {
    let credentials = state.webauthn.list(auth.user.user_id).await?;
    Ok(Json(
        credentials
            .into_iter()
            .map(WebAuthnCredentialResponse::from)
            .collect(),
    ))
}

#[utoipa::path(
    patch,
    path = "/api/v2/auth/webauthn/credentials/{credential_id}",
    params(("credential_id" = Uuid, Path, description = "Credential to rename")),
    request_body = RenameCredentialRequest,
    responses(
        (status = 200, description = "Credential renamed", body = MessageResponse),
        (status = 404, description = "Credential not found"),
    ),
    security(("bearer" = [])),
    tag = "webauthn"
)]
pub async fn rename_credential(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(credential_id): Path<Uuid>,
    Json(payload): Json<RenameCredentialRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    payload.validate()?;
    state
        .webauthn
        .rename(auth.user.user_id, credential_id, &payload.friendly_name)
        .await?;
    Ok(Json(MessageResponse::new(
        "تمت إعادة تسمية مفتاح المرور",
        "Passkey renamed",
    )))
}

#[utoipa::path(
    delete,
    path = "/api/v2/auth/webauthn/credentials/{credential_id}",
    params(("credential_id" = Uuid, Path, description = "Credential to remove")),
    responses(
        (status = 200, description = "Credential removed", body = MessageResponse),
        (status = 400, description = "Refused: it is the account's last factor"),
        (status = 404, description = "Credential not found"),
    ),
    security(("bearer" = [])),
    tag = "webauthn"
)]
pub async fn delete_credential(
    State(state): State<AppState>,
    headers: HeaderMap,
    auth: AuthUser,
    Path(credential_id): Path<Uuid>,
) -> Result<Json<MessageResponse>, AppError> {
    state.webauthn.remove(&auth.user, credential_id).await?;
    audit(
        &state,
        audit_event(AuthEventType::WebauthnRemoved, &headers)
            .user(auth.user.user_id)
            .session(auth.session.session_id)
            .detail(json!({ "credential_id": credential_id })),
    );
    Ok(Json(MessageResponse::new(
        "تم حذف مفتاح المرور",
        "Passkey removed",
    )))
}
