pub mod auth_event;
pub mod mfa_credential;
pub mod permission;
pub mod refresh_token;
pub mod session;
pub mod sso_config;
pub mod user;
pub mod webauthn_credential;

pub use auth_event::{AuthEvent, AuthEventType};
pub use mfa_credential::{
    looks_like_backup_code, BackupCode, BackupCodeBatch, MfaCredential, MfaState,
};
pub use permission::{default_permissions, AccessLevel, Module, PermissionMap};
pub use refresh_token::RefreshToken;
pub use session::{DeviceFingerprint, GeoLocation, Session, SessionInfo, SuspicionReason};
pub use sso_config::{SpEndpoints, SsoConfig, SsoConfigResponse, SsoProvider};
pub use user::{User, UserResponse, UserRole, PASSWORD_LIFETIME_DAYS};
pub use webauthn_credential::{
    counter_regressed, deletion_locks_out, WebAuthnCredential, WebAuthnCredentialResponse,
};
