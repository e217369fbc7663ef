//! User model - identity records for clients and lawyers.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Account roles. A lawyer may belong to a firm or practice solo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Client,
    Lawyer,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Client => "client",
            UserRole::Lawyer => "lawyer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "client" => Some(UserRole::Client),
            "lawyer" => Some(UserRole::Lawyer),
            _ => None,
        }
    }
}

/// User entity. Accounts are never hard-deleted; state transitions only,
/// so the audit trail stays coherent.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub user_id: Uuid,
    pub email: String,
    /// Null for passwordless (WebAuthn-only) and SSO-managed accounts.
    pub password_hash: Option<String>,
    pub role_code: String,
    pub firm_id: Option<Uuid>,
    pub is_solo_lawyer: bool,
    pub email_verified: bool,
    pub mfa_enabled: bool,
    pub sso_managed: bool,
    pub given_name: Option<String>,
    pub surname: Option<String>,
    pub user_state_code: String,
    pub password_changed_utc: Option<DateTime<Utc>>,
    pub password_expires_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Lifetime of a password before expiry is flagged (days).
pub const PASSWORD_LIFETIME_DAYS: i64 = 365;

impl User {
    pub fn new(email: String, password_hash: Option<String>, role: UserRole) -> Self {
        let now = Utc::now();
        Self {
            user_id: Uuid::new_v4(),
            email,
            password_changed_utc: password_hash.as_ref().map(|_| now),
            password_expires_utc: password_hash
                .as_ref()
                .map(|_| now + Duration::days(PASSWORD_LIFETIME_DAYS)),
            password_hash,
            role_code: role.as_str().to_string(),
            firm_id: None,
            is_solo_lawyer: false,
            email_verified: false,
            mfa_enabled: false,
            sso_managed: false,
            given_name: None,
            surname: None,
            user_state_code: "active".to_string(),
            created_utc: now,
            updated_utc: now,
        }
    }

    /// Create a user during SAML just-in-time provisioning.
    pub fn provisioned(email: String, firm_id: Uuid, given_name: Option<String>, surname: Option<String>, role: UserRole) -> Self {
        let mut user = Self::new(email, None, role);
        user.firm_id = Some(firm_id);
        user.sso_managed = true;
        // The IdP asserted the address; no separate verification round-trip.
        user.email_verified = true;
        user.given_name = given_name;
        user.surname = surname;
        user
    }

    pub fn role(&self) -> UserRole {
        UserRole::parse(&self.role_code).unwrap_or(UserRole::Client)
    }

    pub fn is_active(&self) -> bool {
        self.user_state_code == "active"
    }

    /// True when WebAuthn is the account's only authentication factor.
    pub fn is_passwordless(&self) -> bool {
        self.password_hash.is_none() && !self.sso_managed
    }

    pub fn password_expired(&self) -> bool {
        self.password_expires_utc
            .map(|t| Utc::now() > t)
            .unwrap_or(false)
    }
}

/// User response for the API - no credential material, derived booleans only.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UserResponse {
    pub user_id: Uuid,
    pub email: String,
    pub role: String,
    pub firm_id: Option<Uuid>,
    pub is_solo_lawyer: bool,
    pub email_verified: bool,
    pub mfa_enabled: bool,
    pub sso_managed: bool,
    pub has_password: bool,
    pub given_name: Option<String>,
    pub surname: Option<String>,
    pub password_expires_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(u: User) -> Self {
        Self {
            user_id: u.user_id,
            email: u.email.clone(),
            role: u.role_code.clone(),
            firm_id: u.firm_id,
            is_solo_lawyer: u.is_solo_lawyer,
            email_verified: u.email_verified,
            mfa_enabled: u.mfa_enabled,
            sso_managed: u.sso_managed,
            has_password: u.password_hash.is_some(),
            given_name: u.given_name,
            surname: u.surname,
            password_expires_utc: u.password_expires_utc,
            created_utc: u.created_utc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_user_with_password_gets_expiry_metadata() {
        let user = User::new(
            "lawyer@firm.example".to_string(),
            Some("$argon2id$stub".to_string()),
            UserRole::Lawyer,
        );
        assert!(user.password_changed_utc.is_some());
        assert!(user.password_expires_utc.is_some());
        assert!(!user.password_expired());
        assert!(!user.is_passwordless());
    }

    #[test]
    fn provisioned_user_is_sso_managed_and_verified() {
        let firm = Uuid::new_v4();
        let user = User::provisioned(
            "new@corp.example".to_string(),
            firm,
            Some("Nora".to_string()),
            None,
            UserRole::Lawyer,
        );
        assert!(user.sso_managed);
        assert!(user.email_verified);
        assert_eq!(user.firm_id, Some(firm));
        assert!(user.password_hash.is_none());
        // SSO-managed is not the same as passwordless-WebAuthn.
        assert!(!user.is_passwordless());
    }

    #[test]
    fn response_never_exposes_hash() {
        let user = User::new(
            "client@example.com".to_string(),
            Some("$argon2id$stub".to_string()),
            UserRole::Client,
        );
        let resp = UserResponse::from(user);
        assert!(resp.has_password);
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("password_hash").is_none());
    }
}
