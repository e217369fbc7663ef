//! Audit events for the authentication timeline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Event vocabulary. Kept closed so the security-center timeline can
/// localize every entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuthEventType {
    LoginSuccess,
    LoginFailed,
    Logout,
    LogoutAll,
    TokenRefreshed,
    TokenReuseDetected,
    PasswordChanged,
    PasswordResetRequested,
    PasswordResetCompleted,
    MfaSetupStarted,
    MfaEnabled,
    MfaDisabled,
    MfaVerified,
    BackupCodeConsumed,
    BackupCodesRegenerated,
    WebauthnRegistered,
    WebauthnRemoved,
    WebauthnCloneSuspected,
    SsoLogin,
    SsoUserProvisioned,
    SsoConfigChanged,
    SessionTerminated,
    SessionFlagged,
}

impl AuthEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthEventType::LoginSuccess => "login_success",
            AuthEventType::LoginFailed => "login_failed",
            AuthEventType::Logout => "logout",
            AuthEventType::LogoutAll => "logout_all",
            AuthEventType::TokenRefreshed => "token_refreshed",
            AuthEventType::TokenReuseDetected => "token_reuse_detected",
            AuthEventType::PasswordChanged => "password_changed",
            AuthEventType::PasswordResetRequested => "password_reset_requested",
            AuthEventType::PasswordResetCompleted => "password_reset_completed",
            AuthEventType::MfaSetupStarted => "mfa_setup_started",
            AuthEventType::MfaEnabled => "mfa_enabled",
            AuthEventType::MfaDisabled => "mfa_disabled",
            AuthEventType::MfaVerified => "mfa_verified",
            AuthEventType::BackupCodeConsumed => "backup_code_consumed",
            AuthEventType::BackupCodesRegenerated => "backup_codes_regenerated",
            AuthEventType::WebauthnRegistered => "webauthn_registered",
            AuthEventType::WebauthnRemoved => "webauthn_removed",
            AuthEventType::WebauthnCloneSuspected => "webauthn_clone_suspected",
            AuthEventType::SsoLogin => "sso_login",
            AuthEventType::SsoUserProvisioned => "sso_user_provisioned",
            AuthEventType::SsoConfigChanged => "sso_config_changed",
            AuthEventType::SessionTerminated => "session_terminated",
            AuthEventType::SessionFlagged => "session_flagged",
        }
    }
}

/// Append-only audit row. Written fire-and-forget off the request path;
/// an insert failure is logged, never surfaced to the caller.
#[derive(Debug, Clone, FromRow, Serialize, ToSchema)]
pub struct AuthEvent {
    pub event_id: Uuid,
    pub user_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub event_type_code: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub detail: Option<serde_json::Value>,
    pub created_utc: DateTime<Utc>,
}

impl AuthEvent {
    pub fn new(event_type: AuthEventType) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            user_id: None,
            session_id: None,
            event_type_code: event_type.as_str().to_string(),
            ip_address: None,
            user_agent: None,
            detail: None,
            created_utc: Utc::now(),
        }
    }

    pub fn user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_context() {
        let user_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let event = AuthEvent::new(AuthEventType::LoginSuccess)
            .user(user_id)
            .session(session_id)
            .ip("203.0.113.9")
            .detail(serde_json::json!({"mfa": true}));
        assert_eq!(event.event_type_code, "login_success");
        assert_eq!(event.user_id, Some(user_id));
        assert_eq!(event.session_id, Some(session_id));
        assert_eq!(event.detail.unwrap()["mfa"], true);
    }
}
