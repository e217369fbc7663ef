//! WebAuthn credential model - passkey material plus clone-detection state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Stored authenticator credential, N:1 with a user.
///
/// `public_key_json` is the serialized `webauthn_rs` passkey; the sign
/// counter is tracked separately so regression checks do not depend on
/// library internals.
#[derive(Debug, Clone, FromRow)]
pub struct WebAuthnCredential {
    pub credential_id: Uuid,
    pub user_id: Uuid,
    /// Raw credential id bytes as reported by the authenticator.
    pub external_id: Vec<u8>,
    pub public_key_json: serde_json::Value,
    pub sign_counter: i64,
    pub device_type_code: String,
    pub transports: Vec<String>,
    pub friendly_name: String,
    pub created_utc: DateTime<Utc>,
    pub last_used_utc: Option<DateTime<Utc>>,
}

impl WebAuthnCredential {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: Uuid,
        external_id: Vec<u8>,
        public_key_json: serde_json::Value,
        sign_counter: i64,
        device_type_code: String,
        transports: Vec<String>,
        friendly_name: String,
    ) -> Self {
        Self {
            credential_id: Uuid::new_v4(),
            user_id,
            external_id,
            public_key_json,
            sign_counter,
            device_type_code,
            transports,
            friendly_name,
            created_utc: Utc::now(),
            last_used_utc: None,
        }
    }
}

/// Clone detection: the authenticator's counter must strictly increase on
/// every assertion once it is non-zero. A stale or equal counter means the
/// credential was replayed or cloned and is a hard reject.
pub fn counter_regressed(stored: i64, presented: i64) -> bool {
    stored > 0 && presented <= stored
}

/// Guard for credential deletion: a user whose only factor is WebAuthn must
/// always retain at least one credential, otherwise the account locks out.
pub fn deletion_locks_out(remaining_credentials: u64, user_is_passwordless: bool) -> bool {
    user_is_passwordless && remaining_credentials <= 1
}

/// Credential listing entry; never exposes key material.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct WebAuthnCredentialResponse {
    pub credential_id: Uuid,
    pub device_type: String,
    pub transports: Vec<String>,
    pub friendly_name: String,
    pub created_utc: DateTime<Utc>,
    pub last_used_utc: Option<DateTime<Utc>>,
}

impl From<WebAuthnCredential> for WebAuthnCredentialResponse {
    fn from(c: WebAuthnCredential) -> Self {
        Self {
            credential_id: c.credential_id,
            device_type: c.device_type_code,
            transports: c.transports,
            friendly_name: c.friendly_name,
            created_utc: c.created_utc,
            last_used_utc: c.last_used_utc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_must_strictly_increase() {
        assert!(counter_regressed(5, 5));
        assert!(counter_regressed(5, 4));
        assert!(!counter_regressed(5, 6));
        // Authenticators that never increment report zero; no signal there.
        assert!(!counter_regressed(0, 0));
    }

    #[test]
    fn last_credential_of_passwordless_user_is_protected() {
        assert!(deletion_locks_out(1, true));
        assert!(!deletion_locks_out(2, true));
        assert!(!deletion_locks_out(1, false));
    }
}
