//! TOTP enrollment, verification and backup code management.

use axum::{extract::State, http::HeaderMap, Json};
use serde_json::json;
use validator::Validate;

use service_core::error::AppError;

use crate::dtos::{
    BackupCodesResponse, MessageResponse, MfaActivateRequest, MfaDisableRequest, MfaSetupResponse,
    MfaStatusResponse,
};
use crate::middleware::AuthUser;
use crate::models::AuthEventType;
use crate::services::ServiceError;
use crate::utils::password::{verify_password, Password, PasswordHashString};
use crate::AppState;

use super::{audit, audit_event};

#[utoipa::path(
    post,
    path = "/api/v2/auth/mfa/setup",
    responses(
        (status = 200, description = "Enrollment started", body = MfaSetupResponse),
        (status = 409, description = "MFA already enabled"),
    ),
    security(("bearer" = [])),
    tag = "mfa"
)]
pub async fn setup(
    State(state): State<AppState>,
    headers: HeaderMap,
    auth: AuthUser,
) -> Result<Json<MfaSetupResponse>, AppError> {
    let enrollment = state.mfa.start_setup(&auth.user).await?;
    audit(
        &state,
        audit_event(AuthEventType::MfaSetupStarted, &headers)
            .user(auth.user.user_id)
            .session(auth.session.session_id),
    );
    Ok(Json(MfaSetupResponse {
        secret: enrollment.secret,
        otpauth_url: enrollment.otpauth_url,
    }))
}

#[utoipa::path(
    post,
    path = "/api/v2/auth/mfa/activate",
    request_body = MfaActivateRequest,
    responses(
        (status = 200, description = "MFA enabled; one-time backup codes", body = BackupCodesResponse),
        (status = 400, description = "No pending enrollment"),
        (status = 401, description = "Wrong code"),
    ),
    security(("bearer" = [])),
    tag = "mfa"
)]
pub async fn activate(
    State(state): State<AppState>,
    headers: HeaderMap,
    auth: AuthUser,
    Json(payload): Json<MfaActivateRequest>,
) -> Result<Json<BackupCodesResponse>, AppError> {
    payload.validate()?;
    let codes = state.mfa.activate(&auth.user, &payload.code).await?;
    audit(
        &state,
        audit_event(AuthEventType::MfaEnabled, &headers)
            .user(auth.user.user_id)
            .session(auth.session.session_id),
    );
    let remaining = codes.len();
    Ok(Json(BackupCodesResponse {
        backup_codes: codes,
        remaining,
    }))
}

#[utoipa::path(
    get,
    path = "/api/v2/auth/mfa",
    responses((status = 200, description = "MFA state of the account", body = MfaStatusResponse)),
    security(("bearer" = [])),
    tag = "mfa"
)]
pub async fn status(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<MfaStatusResponse>, AppError> {
    let remaining = if auth.user.mfa_enabled {
        Some(state.mfa.remaining_backup_codes(&auth.user).await?)
    } else {
        None
    };
    Ok(Json(MfaStatusResponse {
        enabled: auth.user.mfa_enabled,
        remaining_backup_codes: remaining,
    }))
}

/// Step-up proof for disable and backup code regeneration. An account with
/// a password must re-prove it; only passwordless accounts may substitute a
/// current TOTP or backup code.
async fn verify_step_up(
    state: &AppState,
    auth: &AuthUser,
    code: Option<&str>,
    password: Option<&str>,
) -> Result<(), ServiceError> {
    if let Some(stored) = auth.user.password_hash.as_deref() {
        return check_password_proof(stored, password);
    }
    if let Some(code) = code {
        state.mfa.verify(&auth.user, code).await?;
        return Ok(());
    }
    Err(ServiceError::InvalidCode)
}

/// A wrong or absent password is a credential failure, never an internal
/// error.
fn check_password_proof(stored: &str, presented: Option<&str>) -> Result<(), ServiceError> {
    let presented = presented.ok_or(ServiceError::InvalidPassword)?;
    verify_password(
        &Password::new(presented.to_string()),
        &PasswordHashString::new(stored.to_string()),
    )
    .map_err(|_| ServiceError::InvalidPassword)
}

#[utoipa::path(
    post,
    path = "/api/v2/auth/mfa/disable",
    request_body = MfaDisableRequest,
    responses(
        (status = 200, description = "MFA disabled", body = MessageResponse),
        (status = 401, description = "Step-up proof rejected"),
    ),
    security(("bearer" = [])),
    tag = "mfa"
)]
pub async fn disable(
    State(state): State<AppState>,
    headers: HeaderMap,
    auth: AuthUser,
    Json(payload): Json<MfaDisableRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    verify_step_up(
        &state,
        &auth,
        payload.code.as_deref(),
        payload.password.as_deref(),
    )
    .await?;
    state.mfa.disable(&auth.user).await?;
    audit(
        &state,
        audit_event(AuthEventType::MfaDisabled, &headers)
            .user(auth.user.user_id)
            .session(auth.session.session_id),
    );
    Ok(Json(MessageResponse::new(
        "تم تعطيل المصادقة الثنائية",
        "Two-factor authentication disabled",
    )))
}

#[utoipa::path(
    post,
    path = "/api/v2/auth/mfa/backup-codes",
    request_body = MfaDisableRequest,
    responses(
        (status = 200, description = "Fresh backup codes; previous batch voided", body = BackupCodesResponse),
        (status = 401, description = "Step-up proof rejected"),
    ),
    security(("bearer" = [])),
    tag = "mfa"
)]
pub async fn regenerate_backup_codes(
    State(state): State<AppState>,
    headers: HeaderMap,
    auth: AuthUser,
    Json(payload): Json<MfaDisableRequest>,
) -> Result<Json<BackupCodesResponse>, AppError> {
    verify_step_up(
        &state,
        &auth,
        payload.code.as_deref(),
        payload.password.as_deref(),
    )
    .await?;
    let codes = state.mfa.regenerate_backup_codes(&auth.user).await?;
    audit(
        &state,
        audit_event(AuthEventType::BackupCodesRegenerated, &headers)
            .user(auth.user.user_id)
            .session(auth.session.session_id)
            .detail(json!({ "count": codes.len() })),
    );
    let remaining = codes.len();
    Ok(Json(BackupCodesResponse {
        backup_codes: codes,
        remaining,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::password::hash_password;

    #[test]
    fn wrong_step_up_password_is_a_credential_failure() {
        let hash = hash_password(&Password::new("correct horse battery".to_string())).unwrap();
        let err = check_password_proof(hash.as_str(), Some("wrong")).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidPassword));
        assert!(check_password_proof(hash.as_str(), Some("correct horse battery")).is_ok());
    }

    #[test]
    fn password_accounts_cannot_skip_the_password() {
        let hash = hash_password(&Password::new("correct horse battery".to_string())).unwrap();
        let err = check_password_proof(hash.as_str(), None).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidPassword));
    }
}
