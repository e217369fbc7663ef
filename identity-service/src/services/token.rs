//! Token service - RS256 access tokens, rotating opaque refresh tokens
//! and session-bound CSRF tokens.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use super::challenge::{keys, ChallengeStore};
use super::database::Database;
use super::error::ServiceError;
use crate::config::JwtConfig;
use crate::models::{PermissionMap, RefreshToken, Session, User};

/// Claims carried by every access token. Business services authorize from
/// these alone; they never call back into the identity service per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// Subject (user id).
    pub sub: String,
    /// Session id, so revocation checks and CSRF keys bind to the session.
    pub sid: String,
    pub email: String,
    pub role: String,
    pub firm_id: Option<Uuid>,
    pub is_solo_lawyer: bool,
    pub permissions: PermissionMap,
    pub iss: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
}

/// Everything a successful login or refresh hands back to the HTTP layer.
/// The refresh token is opaque and goes into an httpOnly cookie only.
#[derive(Debug)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub csrf_token: String,
    pub expires_in: i64,
    pub refresh_lifetime_days: i64,
}

/// Outcome of presenting a refresh token for rotation.
#[derive(Debug, PartialEq, Eq)]
enum PresentedTokenState {
    Active,
    Expired,
    /// Already rotated away; this presentation is a replay.
    Reused,
}

fn classify(token: &RefreshToken) -> PresentedTokenState {
    if token.revoked {
        PresentedTokenState::Reused
    } else if token.is_expired() {
        PresentedTokenState::Expired
    } else {
        PresentedTokenState::Active
    }
}

/// Generate an opaque token value: 32 random bytes, URL-safe base64.
pub fn new_opaque_token() -> String {
    let mut raw = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}

#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    audience: String,
    access_token_expiry_minutes: i64,
    refresh_token_expiry_days: i64,
    refresh_token_remember_me_days: i64,
    db: Database,
    challenges: Arc<dyn ChallengeStore>,
}

impl TokenService {
    pub fn new(
        config: &JwtConfig,
        db: Database,
        challenges: Arc<dyn ChallengeStore>,
    ) -> Result<Self, anyhow::Error> {
        let private_key_pem = fs::read_to_string(&config.private_key_path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read private key from {}: {}",
                config.private_key_path,
                e
            )
        })?;
        let encoding_key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;

        let public_key_pem = fs::read_to_string(&config.public_key_path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read public key from {}: {}",
                config.public_key_path,
                e
            )
        })?;
        let decoding_key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to parse public key: {}", e))?;

        tracing::info!("Token service initialized with RS256 keys");

        Ok(Self {
            encoding_key,
            decoding_key,
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            access_token_expiry_minutes: config.access_token_expiry_minutes,
            refresh_token_expiry_days: config.refresh_token_expiry_days,
            refresh_token_remember_me_days: config.refresh_token_remember_me_days,
            db,
            challenges,
        })
    }

    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.access_token_expiry_minutes * 60
    }

    pub fn refresh_lifetime_days(&self, remember_me: bool) -> i64 {
        if remember_me {
            self.refresh_token_remember_me_days
        } else {
            self.refresh_token_expiry_days
        }
    }

    // ==================== Access Tokens ====================

    pub fn sign_access_token(
        &self,
        user: &User,
        session_id: Uuid,
        permissions: PermissionMap,
    ) -> Result<String, ServiceError> {
        let now = Utc::now();
        let exp = now + Duration::minutes(self.access_token_expiry_minutes);
        let claims = AccessTokenClaims {
            sub: user.user_id.to_string(),
            sid: session_id.to_string(),
            email: user.email.clone(),
            role: user.role_code.clone(),
            firm_id: user.firm_id,
            is_solo_lawyer: user.is_solo_lawyer,
            permissions,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        let header = Header::new(Algorithm::RS256);
        encode(&header, &claims, &self.encoding_key)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Failed to encode token: {e}")))
    }

    /// Validate signature, expiry, issuer and audience. Expiry gets its own
    /// code so clients know to refresh instead of re-authenticating.
    pub fn validate_access_token(&self, token: &str) -> Result<AccessTokenClaims, ServiceError> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);

        match decode::<AccessTokenClaims>(token, &self.decoding_key, &validation) {
            Ok(data) => Ok(data.claims),
            Err(e) if matches!(e.kind(), jsonwebtoken::errors::ErrorKind::ExpiredSignature) => {
                Err(ServiceError::TokenExpired)
            }
            Err(_) => Err(ServiceError::InvalidToken),
        }
    }

    // ==================== Refresh Rotation ====================

    /// Issue the first refresh token of a session plus its matching access
    /// and CSRF tokens.
    pub async fn issue_for_session(
        &self,
        user: &User,
        session: &Session,
        permissions: PermissionMap,
    ) -> Result<IssuedTokens, ServiceError> {
        let lifetime_days = self.refresh_lifetime_days(session.remember_me);
        let opaque = new_opaque_token();
        let record = RefreshToken::new(
            user.user_id,
            session.session_id,
            RefreshToken::hash(&opaque),
            None,
            lifetime_days,
        );
        self.db.insert_refresh_token(&record).await?;

        let access_token = self.sign_access_token(user, session.session_id, permissions)?;
        let csrf_token = self.issue_csrf(session.session_id).await?;

        Ok(IssuedTokens {
            access_token,
            refresh_token: opaque,
            csrf_token,
            expires_in: self.access_token_expiry_seconds(),
            refresh_lifetime_days: lifetime_days,
        })
    }

    /// Rotate a presented refresh token.
    ///
    /// Replay of an already-rotated token revokes the whole session lineage
    /// and terminates the session; the caller sees the same `INVALID_TOKEN`
    /// as for garbage input, so probing reveals nothing. Under concurrent
    /// rotation of the same token the database compare-and-set picks one
    /// winner and the losers are treated as replays without the lineage
    /// penalty (the token they raced on was legitimately spent).
    pub async fn rotate(
        &self,
        presented: &str,
        permissions_for: impl FnOnce(&User) -> PermissionMap,
    ) -> Result<(User, Session, IssuedTokens), ServiceError> {
        let hash = RefreshToken::hash(presented);
        let record = self
            .db
            .find_refresh_token_by_hash(&hash)
            .await?
            .ok_or(ServiceError::InvalidToken)?;

        match classify(&record) {
            PresentedTokenState::Expired => return Err(ServiceError::InvalidToken),
            PresentedTokenState::Reused => {
                tracing::warn!(
                    session_id = %record.session_id,
                    "Refresh token replay detected; revoking session lineage"
                );
                self.db.revoke_session_tokens(record.session_id).await?;
                self.db.terminate_session(record.session_id).await?;
                return Err(ServiceError::TokenReuse);
            }
            PresentedTokenState::Active => {}
        }

        let session = self
            .db
            .find_session_by_id(record.session_id)
            .await?
            .ok_or(ServiceError::InvalidToken)?;
        if !session.is_valid() {
            return Err(ServiceError::InvalidToken);
        }

        let user = self
            .db
            .find_user_by_id(record.user_id)
            .await?
            .ok_or(ServiceError::InvalidToken)?;
        if !user.is_active() {
            return Err(ServiceError::AccountDisabled);
        }

        // Exactly one concurrent caller wins this update.
        if self.db.revoke_refresh_token_if_active(record.token_id).await? == 0 {
            return Err(ServiceError::InvalidToken);
        }

        let lifetime_days = self.refresh_lifetime_days(session.remember_me);
        let opaque = new_opaque_token();
        let replacement = RefreshToken::new(
            user.user_id,
            session.session_id,
            RefreshToken::hash(&opaque),
            Some(record.token_id),
            lifetime_days,
        );
        self.db.insert_refresh_token(&replacement).await?;

        let permissions = permissions_for(&user);
        let access_token = self.sign_access_token(&user, session.session_id, permissions)?;
        let csrf_token = self.issue_csrf(session.session_id).await?;

        let issued = IssuedTokens {
            access_token,
            refresh_token: opaque,
            csrf_token,
            expires_in: self.access_token_expiry_seconds(),
            refresh_lifetime_days: lifetime_days,
        };
        Ok((user, session, issued))
    }

    /// Revoke a single session: lineage tokens, session row, CSRF token.
    pub async fn revoke_session(&self, session_id: Uuid) -> Result<(), ServiceError> {
        self.db.revoke_session_tokens(session_id).await?;
        self.db.terminate_session(session_id).await?;
        self.challenges.delete(&keys::csrf(session_id)).await?;
        Ok(())
    }

    /// Revoke every session of a user except, optionally, the current one.
    pub async fn revoke_user_sessions(
        &self,
        user_id: Uuid,
        except: Option<Uuid>,
    ) -> Result<u64, ServiceError> {
        match except {
            Some(keep) => {
                let sessions = self.db.find_active_sessions(user_id).await?;
                let mut revoked = 0;
                for session in sessions {
                    if session.session_id != keep {
                        self.revoke_session(session.session_id).await?;
                        revoked += 1;
                    }
                }
                Ok(revoked)
            }
            None => {
                self.db.revoke_user_tokens(user_id).await?;
                let count = self.db.terminate_user_sessions(user_id, None).await?;
                Ok(count)
            }
        }
    }

    // ==================== CSRF ====================

    /// CSRF tokens rotate with every refresh, so they never need to outlive
    /// more than a day of idle time.
    pub const CSRF_TTL_SECONDS: u64 = 24 * 60 * 60;

    /// Mint a session-bound CSRF token. Reissuing replaces the previous
    /// value, which is fine: only the latest cookie is in the browser.
    pub async fn issue_csrf(&self, session_id: Uuid) -> Result<String, ServiceError> {
        let token = new_opaque_token();
        self.challenges
            .put(&keys::csrf(session_id), &token, Self::CSRF_TTL_SECONDS)
            .await?;
        Ok(token)
    }

    /// Constant-time comparison against the stored value.
    pub async fn verify_csrf(&self, session_id: Uuid, presented: &str) -> Result<(), ServiceError> {
        let stored = self
            .challenges
            .peek(&keys::csrf(session_id))
            .await?
            .ok_or(ServiceError::CsrfMismatch)?;
        if stored.as_bytes().ct_eq(presented.as_bytes()).into() {
            Ok(())
        } else {
            Err(ServiceError::CsrfMismatch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn opaque_tokens_are_unique_and_urlsafe() {
        let a = new_opaque_token();
        let b = new_opaque_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn classify_prefers_reuse_over_expiry() {
        let mut token = RefreshToken::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            RefreshToken::hash("x"),
            None,
            7,
        );
        assert_eq!(classify(&token), PresentedTokenState::Active);

        token.expires_utc = Utc::now() - Duration::minutes(1);
        assert_eq!(classify(&token), PresentedTokenState::Expired);

        // A revoked token is a replay even when it also expired.
        token.revoked = true;
        assert_eq!(classify(&token), PresentedTokenState::Reused);
    }
}
