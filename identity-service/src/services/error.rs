//! Service-level error taxonomy and its mapping to HTTP responses.
//!
//! Every variant carries a stable `code` through [`AppError`]; clients and
//! tests branch on the code, the Arabic/English messages are presentation.

use service_core::error::{AppError, ErrorBody};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account is not active")]
    AccountDisabled,

    #[error("Email already registered")]
    EmailAlreadyRegistered,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Refresh token reuse detected")]
    TokenReuse,

    #[error("CSRF token missing or invalid")]
    CsrfMismatch,

    #[error("User not found")]
    UserNotFound,

    #[error("Session not found")]
    SessionNotFound,

    #[error("Verification code is invalid")]
    InvalidCode,

    #[error("MFA verification required")]
    MfaRequired,

    #[error("MFA is already enabled")]
    MfaAlreadyEnabled,

    #[error("MFA setup has not been started")]
    MfaSetupNotStarted,

    #[error("MFA is not enabled")]
    MfaNotEnabled,

    #[error("Password is incorrect")]
    InvalidPassword,

    #[error("Account has no password")]
    NoPassword,

    #[error("WebAuthn ceremony failed: {0}")]
    WebauthnCeremony(String),

    #[error("Authenticator counter regressed")]
    CredentialCloneSuspected,

    #[error("Credential not found")]
    CredentialNotFound,

    #[error("Credential is already registered")]
    CredentialAlreadyRegistered,

    #[error("Removing the last credential would lock the account out")]
    LastCredential,

    #[error("SSO is not enabled for this firm")]
    SsoNotEnabled,

    #[error("SSO is not configured for this firm")]
    SsoNotConfigured,

    #[error("SAML response rejected: {0}")]
    SamlInvalid(String),

    #[error("Email domain is not allowed for this firm")]
    SsoDomainNotAllowed,

    #[error("SSO account provisioning is disabled")]
    SsoProvisioningDisabled,

    #[error("Admin access required")]
    AdminRequired,

    #[error("Validation error: {0}")]
    Validation(String),
}

fn unauthorized(code: &str, ar: &str, en: &str) -> AppError {
    AppError::Unauthorized(ErrorBody::new(code, ar, en))
}

fn bad_request(code: &str, ar: &str, en: &str) -> AppError {
    AppError::BadRequest(ErrorBody::new(code, ar, en))
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Database(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            ServiceError::Redis(e) => AppError::CacheError(e),
            ServiceError::Internal(e) => AppError::InternalError(e),
            ServiceError::InvalidCredentials => unauthorized(
                "INVALID_CREDENTIALS",
                "البريد الإلكتروني أو كلمة المرور غير صحيحة",
                "Invalid email or password",
            ),
            ServiceError::AccountDisabled => AppError::Forbidden(ErrorBody::new(
                "ACCOUNT_DISABLED",
                "الحساب غير نشط",
                "Account is not active",
            )),
            ServiceError::EmailAlreadyRegistered => AppError::Conflict(ErrorBody::new(
                "EMAIL_ALREADY_REGISTERED",
                "البريد الإلكتروني مسجل مسبقاً",
                "Email is already registered",
            )),
            ServiceError::InvalidToken => unauthorized(
                "INVALID_TOKEN",
                "رمز الدخول غير صالح",
                "Token is invalid",
            ),
            ServiceError::TokenExpired => unauthorized(
                "TOKEN_EXPIRED",
                "انتهت صلاحية رمز الدخول",
                "Token has expired",
            ),
            ServiceError::TokenReuse => unauthorized(
                "INVALID_TOKEN",
                "رمز الدخول غير صالح",
                "Token is invalid",
            ),
            ServiceError::CsrfMismatch => AppError::Forbidden(ErrorBody::new(
                "CSRF_MISMATCH",
                "فشل التحقق من مصدر الطلب",
                "CSRF token missing or invalid",
            )),
            ServiceError::UserNotFound => AppError::NotFound(ErrorBody::new(
                "USER_NOT_FOUND",
                "المستخدم غير موجود",
                "User not found",
            )),
            ServiceError::SessionNotFound => AppError::NotFound(ErrorBody::new(
                "SESSION_NOT_FOUND",
                "الجلسة غير موجودة",
                "Session not found",
            )),
            ServiceError::InvalidCode => bad_request(
                "INVALID_CODE",
                "رمز التحقق غير صحيح",
                "Verification code is invalid",
            ),
            ServiceError::MfaRequired => unauthorized(
                "MFA_REQUIRED",
                "مطلوب رمز التحقق الثنائي",
                "MFA verification required",
            ),
            ServiceError::MfaAlreadyEnabled => AppError::Conflict(ErrorBody::new(
                "MFA_ALREADY_ENABLED",
                "المصادقة الثنائية مفعلة مسبقاً",
                "MFA is already enabled",
            )),
            ServiceError::MfaSetupNotStarted => bad_request(
                "MFA_SETUP_NOT_STARTED",
                "لم يتم بدء إعداد المصادقة الثنائية",
                "MFA setup has not been started",
            ),
            ServiceError::MfaNotEnabled => bad_request(
                "MFA_NOT_ENABLED",
                "المصادقة الثنائية غير مفعلة",
                "MFA is not enabled",
            ),
            ServiceError::InvalidPassword => unauthorized(
                "INVALID_PASSWORD",
                "كلمة المرور غير صحيحة",
                "Password is incorrect",
            ),
            ServiceError::NoPassword => bad_request(
                "NO_PASSWORD",
                "لا توجد كلمة مرور لهذا الحساب",
                "Account has no password",
            ),
            ServiceError::WebauthnCeremony(detail) => AppError::BadRequest(ErrorBody::new(
                "WEBAUTHN_CEREMONY_FAILED",
                "فشل التحقق من مفتاح الأمان",
                format!("WebAuthn ceremony failed: {detail}"),
            )),
            ServiceError::CredentialCloneSuspected => unauthorized(
                "CREDENTIAL_CLONE_SUSPECTED",
                "تم رفض مفتاح الأمان للاشتباه في نسخه",
                "Authenticator rejected: possible cloned credential",
            ),
            ServiceError::CredentialNotFound => AppError::NotFound(ErrorBody::new(
                "CREDENTIAL_NOT_FOUND",
                "مفتاح الأمان غير موجود",
                "Credential not found",
            )),
            ServiceError::CredentialAlreadyRegistered => AppError::Conflict(ErrorBody::new(
                "CREDENTIAL_ALREADY_REGISTERED",
                "مفتاح الأمان مسجل مسبقاً",
                "Credential is already registered",
            )),
            ServiceError::LastCredential => bad_request(
                "LAST_CREDENTIAL",
                "لا يمكن حذف مفتاح الأمان الوحيد للحساب",
                "Cannot remove the account's only credential",
            ),
            ServiceError::SsoNotEnabled => bad_request(
                "SSO_NOT_ENABLED",
                "تسجيل الدخول الموحد غير مفعل لهذه الشركة",
                "SSO is not enabled for this firm",
            ),
            ServiceError::SsoNotConfigured => AppError::NotFound(ErrorBody::new(
                "SSO_NOT_CONFIGURED",
                "تسجيل الدخول الموحد غير مهيأ لهذه الشركة",
                "SSO is not configured for this firm",
            )),
            ServiceError::SamlInvalid(detail) => AppError::BadRequest(ErrorBody::new(
                "SAML_INVALID",
                "تم رفض استجابة تسجيل الدخول الموحد",
                format!("SAML response rejected: {detail}"),
            )),
            ServiceError::SsoDomainNotAllowed => AppError::Forbidden(ErrorBody::new(
                "SSO_DOMAIN_NOT_ALLOWED",
                "نطاق البريد الإلكتروني غير مسموح به",
                "Email domain is not allowed for this firm",
            )),
            ServiceError::SsoProvisioningDisabled => AppError::Forbidden(ErrorBody::new(
                "SSO_PROVISIONING_DISABLED",
                "إنشاء الحسابات عبر الدخول الموحد معطل",
                "SSO account provisioning is disabled",
            )),
            ServiceError::AdminRequired => AppError::Forbidden(ErrorBody::new(
                "ADMIN_REQUIRED",
                "هذه العملية تتطلب صلاحيات المسؤول",
                "Admin access required",
            )),
            ServiceError::Validation(detail) => AppError::BadRequest(ErrorBody::new(
                "VALIDATION_ERROR",
                "بيانات غير صالحة",
                detail,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    #[test]
    fn token_reuse_is_indistinguishable_from_invalid_token() {
        let reuse: AppError = ServiceError::TokenReuse.into();
        let invalid: AppError = ServiceError::InvalidToken.into();
        let a = reuse.into_response();
        let b = invalid.into_response();
        assert_eq!(a.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(a.status(), b.status());
    }

    #[test]
    fn disabled_sso_is_a_client_error_not_a_missing_resource() {
        let disabled: AppError = ServiceError::SsoNotEnabled.into();
        assert_eq!(disabled.into_response().status(), StatusCode::BAD_REQUEST);
        let unconfigured: AppError = ServiceError::SsoNotConfigured.into();
        assert_eq!(unconfigured.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn last_credential_removal_is_a_bad_request() {
        let err: AppError = ServiceError::LastCredential.into();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn clone_suspicion_maps_to_unauthorized() {
        let err: AppError = ServiceError::CredentialCloneSuspected.into();
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
    }
}
