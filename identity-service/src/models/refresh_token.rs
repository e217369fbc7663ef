//! Refresh token model - opaque rotating tokens bound to a session.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

/// One refresh token in a session's rotation lineage. Only the SHA-256
/// hash of the opaque value is stored; the value itself lives in the
/// httpOnly cookie and nowhere else.
#[derive(Debug, Clone, FromRow)]
pub struct RefreshToken {
    pub token_id: Uuid,
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub token_hash: String,
    /// Token this one replaced, forming the lineage chain.
    pub rotated_from: Option<Uuid>,
    pub revoked: bool,
    pub expires_utc: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
}

impl RefreshToken {
    pub fn new(
        user_id: Uuid,
        session_id: Uuid,
        token_hash: String,
        rotated_from: Option<Uuid>,
        lifetime_days: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            token_id: Uuid::new_v4(),
            user_id,
            session_id,
            token_hash,
            rotated_from,
            revoked: false,
            expires_utc: now + Duration::days(lifetime_days),
            created_utc: now,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_utc
    }

    pub fn is_valid(&self) -> bool {
        !self.revoked && !self.is_expired()
    }

    /// Hash a presented token value for lookup.
    pub fn hash(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_valid() {
        let token = RefreshToken::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            RefreshToken::hash("opaque-value"),
            None,
            7,
        );
        assert!(token.is_valid());
        assert!(!token.is_expired());
        assert!(token.rotated_from.is_none());
    }

    #[test]
    fn hash_is_deterministic_and_not_the_value() {
        let hash = RefreshToken::hash("opaque-value");
        assert_eq!(hash, RefreshToken::hash("opaque-value"));
        assert_ne!(hash, "opaque-value");
        assert_eq!(hash.len(), 64);
    }
}
