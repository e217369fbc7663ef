//! Request and response DTOs for the HTTP API.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;
use webauthn_rs::prelude::{PublicKeyCredential, RegisterPublicKeyCredential};

use crate::models::UserResponse;

// ==================== Requests ====================

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RegisterRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 12, max = 128))]
    pub password: String,
    /// "client" or "lawyer".
    pub role: String,
    pub is_solo_lawyer: Option<bool>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct LoginRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1))]
    pub password: String,
    #[serde(default)]
    pub remember_me: bool,
}

/// Second phase of a login once the password check returned an MFA ticket.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct MfaLoginRequest {
    #[validate(length(min = 1))]
    pub mfa_ticket: String,
    /// TOTP or backup code.
    #[validate(length(min = 6, max = 16))]
    pub code: String,
    #[serde(default)]
    pub remember_me: bool,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct MfaActivateRequest {
    #[validate(length(min = 6, max = 16))]
    pub code: String,
}

/// Disabling MFA is a step-up operation: a current code or the account
/// password must accompany the request.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct MfaDisableRequest {
    pub code: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct WebauthnFinishRegistrationRequest {
    #[validate(length(min = 1, max = 64))]
    pub friendly_name: String,
    #[schema(value_type = Object)]
    pub credential: RegisterPublicKeyCredential,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct WebauthnStartAuthenticationRequest {
    #[validate(email)]
    pub email: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RenameCredentialRequest {
    #[validate(length(min = 1, max = 64))]
    pub friendly_name: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct WebauthnFinishAuthenticationRequest {
    pub ceremony_id: Uuid,
    #[schema(value_type = Object)]
    pub credential: PublicKeyCredential,
    #[serde(default)]
    pub remember_me: bool,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ChangePasswordRequest {
    #[validate(length(min = 1))]
    pub current_password: String,
    #[validate(length(min = 12, max = 128))]
    pub new_password: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ForgotPasswordRequest {
    #[validate(email)]
    pub email: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ResetPasswordRequest {
    #[validate(length(min = 1))]
    pub token: String,
    #[validate(length(min = 12, max = 128))]
    pub new_password: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct SsoConfigRequest {
    /// "azure", "okta", "google" or "custom".
    pub provider: String,
    pub enabled: bool,
    #[validate(length(min = 1, max = 512))]
    pub idp_entity_id: String,
    #[validate(url)]
    pub idp_sso_url: String,
    pub idp_slo_url: Option<String>,
    /// PEM or raw base64 X.509 certificate.
    #[validate(length(min = 1))]
    pub idp_certificate_pem: String,
    #[validate(length(min = 1))]
    pub allowed_domains: Vec<String>,
    pub default_role: String,
    pub jit_provisioning: bool,
}

/// Dry-run counterpart of [`SsoConfigRequest`]. Nothing is stored; the
/// response lists every problem found instead of failing on the first.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SsoConfigTestRequest {
    pub provider: String,
    pub idp_entity_id: String,
    pub idp_sso_url: String,
    pub idp_slo_url: Option<String>,
    pub idp_certificate_pem: String,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    pub default_role: String,
    /// Probed for reachability when present.
    pub metadata_url: Option<String>,
}

/// POST-binding assertion consumer form. Field names are fixed by the
/// SAML bindings spec.
#[derive(Debug, Deserialize, ToSchema)]
pub struct AcsForm {
    #[serde(rename = "SAMLResponse")]
    pub saml_response: String,
    #[serde(rename = "RelayState")]
    pub relay_state: Option<String>,
}

/// POST-binding single logout form. The IdP posts either a LogoutRequest
/// or a LogoutResponse.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SlsForm {
    #[serde(rename = "SAMLRequest")]
    pub saml_request: Option<String>,
    #[serde(rename = "SAMLResponse")]
    pub saml_response: Option<String>,
    #[serde(rename = "RelayState")]
    pub relay_state: Option<String>,
}

/// Redirect-binding single logout query parameters.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SlsQuery {
    #[serde(rename = "SAMLRequest")]
    pub saml_request: Option<String>,
    #[serde(rename = "SAMLResponse")]
    pub saml_response: Option<String>,
    #[serde(rename = "RelayState")]
    pub relay_state: Option<String>,
    #[serde(rename = "SigAlg")]
    pub sig_alg: Option<String>,
    #[serde(rename = "Signature")]
    pub signature: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SsoLoginQuery {
    #[serde(rename = "RelayState")]
    pub relay_state: Option<String>,
}

// ==================== Responses ====================

/// Successful authentication. The refresh token travels in an httpOnly
/// cookie, never in this body.
#[derive(Debug, Serialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub csrf_token: String,
    pub user: UserResponse,
}

/// The password checked out but the account requires a second factor.
/// The ticket is single-use and short-lived.
#[derive(Debug, Serialize, ToSchema)]
pub struct MfaChallengeResponse {
    pub mfa_required: bool,
    pub mfa_ticket: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
    #[serde(rename = "messageEn")]
    pub message_en: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>, message_en: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            message_en: message_en.into(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MfaSetupResponse {
    /// Base32 seed for manual entry.
    pub secret: String,
    /// otpauth:// URL to render as a QR code.
    pub otpauth_url: String,
}

/// Plaintext backup codes, shown exactly once.
#[derive(Debug, Serialize, ToSchema)]
pub struct BackupCodesResponse {
    pub backup_codes: Vec<String>,
    pub remaining: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MfaStatusResponse {
    pub enabled: bool,
    pub remaining_backup_codes: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WebauthnStartAuthenticationResponse {
    pub ceremony_id: Uuid,
    /// `webauthn-rs` request challenge, passed through to the browser.
    #[schema(value_type = Object)]
    pub challenge: serde_json::Value,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CsrfResponse {
    pub csrf_token: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SsoConfigTestResponse {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Outcome of SP-initiated logout. The IdP URL is absent when the firm's
/// IdP exposes no SLO endpoint.
#[derive(Debug, Serialize, ToSchema)]
pub struct SsoLogoutResponse {
    pub success: bool,
    pub idp_logout_url: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use validator::Validate;

    #[test]
    fn short_passwords_fail_validation() {
        let req = RegisterRequest {
            email: "user@example.com".to_string(),
            password: "short".to_string(),
            role: "client".to_string(),
            is_solo_lawyer: None,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn acs_form_uses_saml_field_names() {
        let form: AcsForm =
            serde_json::from_str(r#"{"SAMLResponse":"abc","RelayState":"/app"}"#).unwrap();
        assert_eq!(form.saml_response, "abc");
        assert_eq!(form.relay_state.as_deref(), Some("/app"));
    }
}
