//! WebAuthn ceremony manager.
//!
//! Ceremony state lives in the challenge store between the start and
//! finish halves, so any replica can complete a ceremony another replica
//! started. Sign counters are checked explicitly on every assertion.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use webauthn_rs::prelude::*;

use super::challenge::{keys, ChallengeStore};
use super::database::Database;
use super::error::ServiceError;
use crate::models::{counter_regressed, deletion_locks_out, User, WebAuthnCredential};

const CEREMONY_TTL_SECONDS: u64 = 300;

/// Authentication ceremony state parked between start and finish.
#[derive(Serialize, Deserialize)]
struct PendingAuthentication {
    user_id: Uuid,
    state: PasskeyAuthentication,
}

/// Outcome of a finished assertion.
#[derive(Debug)]
pub struct AssertionOutcome {
    pub user_id: Uuid,
    pub credential_id: Uuid,
    /// Set when the sign counter regressed; the caller flags the session
    /// and audits it, the login itself is already rejected.
    pub clone_suspected: bool,
}

#[derive(Clone)]
pub struct WebauthnService {
    webauthn: Arc<Webauthn>,
    db: Database,
    challenges: Arc<dyn ChallengeStore>,
}

impl WebauthnService {
    pub fn new(
        rp_id: &str,
        rp_origin: &str,
        rp_name: &str,
        db: Database,
        challenges: Arc<dyn ChallengeStore>,
    ) -> Result<Self, anyhow::Error> {
        let origin = Url::parse(rp_origin)
            .map_err(|e| anyhow::anyhow!("Invalid relying-party origin {rp_origin}: {e}"))?;
        let webauthn = WebauthnBuilder::new(rp_id, &origin)
            .map_err(|e| anyhow::anyhow!("WebAuthn configuration rejected: {e}"))?
            .rp_name(rp_name)
            .build()
            .map_err(|e| anyhow::anyhow!("WebAuthn configuration rejected: {e}"))?;
        Ok(Self {
            webauthn: Arc::new(webauthn),
            db,
            challenges,
        })
    }

    // ==================== Registration ====================

    /// Start registering a new passkey for an authenticated user. Existing
    /// credentials are excluded so the same authenticator cannot enroll
    /// twice.
    pub async fn start_registration(
        &self,
        user: &User,
    ) -> Result<CreationChallengeResponse, ServiceError> {
        let existing = self.db.find_webauthn_credentials(user.user_id).await?;
        let exclude: Vec<CredentialID> = existing
            .iter()
            .map(|c| CredentialID::from(c.external_id.clone()))
            .collect();
        let display_name = user
            .given_name
            .clone()
            .unwrap_or_else(|| user.email.clone());

        let (challenge, state) = self
            .webauthn
            .start_passkey_registration(
                user.user_id,
                &user.email,
                &display_name,
                Some(exclude),
            )
            .map_err(|e| ServiceError::WebauthnCeremony(e.to_string()))?;

        let serialized = serde_json::to_string(&state)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("State serialization: {e}")))?;
        self.challenges
            .put(
                &keys::webauthn_registration(user.user_id),
                &serialized,
                CEREMONY_TTL_SECONDS,
            )
            .await?;
        Ok(challenge)
    }

    /// Finish registration, persisting the new credential.
    pub async fn finish_registration(
        &self,
        user: &User,
        friendly_name: &str,
        response: &RegisterPublicKeyCredential,
    ) -> Result<WebAuthnCredential, ServiceError> {
        let serialized = self
            .challenges
            .take(&keys::webauthn_registration(user.user_id))
            .await?
            .ok_or_else(|| {
                ServiceError::WebauthnCeremony("No registration in progress".to_string())
            })?;
        let state: PasskeyRegistration = serde_json::from_str(&serialized)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("State deserialization: {e}")))?;

        let passkey = self
            .webauthn
            .finish_passkey_registration(response, &state)
            .map_err(|e| ServiceError::WebauthnCeremony(e.to_string()))?;

        if self
            .db
            .find_webauthn_credential_by_external_id(passkey.cred_id().as_ref())
            .await?
            .is_some()
        {
            return Err(ServiceError::CredentialAlreadyRegistered);
        }

        let public_key_json = serde_json::to_value(&passkey)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Passkey serialization: {e}")))?;
        let credential = WebAuthnCredential::new(
            user.user_id,
            passkey.cred_id().to_vec(),
            public_key_json,
            0,
            "security_key".to_string(),
            Vec::new(),
            friendly_name.to_string(),
        );
        self.db.insert_webauthn_credential(&credential).await?;
        Ok(credential)
    }

    // ==================== Authentication ====================

    /// Start a passkey login. The email is resolved server-side; when the
    /// account is unknown or has no passkeys the same generic error comes
    /// back, so the endpoint does not confirm account existence.
    pub async fn start_authentication(
        &self,
        email: &str,
    ) -> Result<(Uuid, RequestChallengeResponse), ServiceError> {
        let user = self
            .db
            .find_user_by_email(email)
            .await?
            .filter(User::is_active)
            .ok_or(ServiceError::InvalidCredentials)?;

        let stored = self.db.find_webauthn_credentials(user.user_id).await?;
        if stored.is_empty() {
            return Err(ServiceError::InvalidCredentials);
        }
        let passkeys: Vec<Passkey> = stored
            .iter()
            .map(|c| serde_json::from_value(c.public_key_json.clone()))
            .collect::<Result<_, _>>()
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Passkey deserialization: {e}")))?;

        let (challenge, state) = self
            .webauthn
            .start_passkey_authentication(&passkeys)
            .map_err(|e| ServiceError::WebauthnCeremony(e.to_string()))?;

        let ceremony_id = Uuid::new_v4();
        let pending = PendingAuthentication {
            user_id: user.user_id,
            state,
        };
        let serialized = serde_json::to_string(&pending)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("State serialization: {e}")))?;
        self.challenges
            .put(
                &keys::webauthn_authentication(ceremony_id),
                &serialized,
                CEREMONY_TTL_SECONDS,
            )
            .await?;
        Ok((ceremony_id, challenge))
    }

    /// Finish a passkey login. A regressed sign counter rejects the
    /// assertion and reports the suspicion to the caller.
    pub async fn finish_authentication(
        &self,
        ceremony_id: Uuid,
        response: &PublicKeyCredential,
    ) -> Result<AssertionOutcome, ServiceError> {
        let serialized = self
            .challenges
            .take(&keys::webauthn_authentication(ceremony_id))
            .await?
            .ok_or_else(|| {
                ServiceError::WebauthnCeremony("No authentication in progress".to_string())
            })?;
        let pending: PendingAuthentication = serde_json::from_str(&serialized)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("State deserialization: {e}")))?;

        let result = self
            .webauthn
            .finish_passkey_authentication(response, &pending.state)
            .map_err(|e| ServiceError::WebauthnCeremony(e.to_string()))?;

        let stored = self
            .db
            .find_webauthn_credential_by_external_id(result.cred_id().as_ref())
            .await?
            .ok_or(ServiceError::CredentialNotFound)?;
        if stored.user_id != pending.user_id {
            return Err(ServiceError::WebauthnCeremony(
                "Credential does not belong to this account".to_string(),
            ));
        }

        let presented = i64::from(result.counter());
        if counter_regressed(stored.sign_counter, presented) {
            tracing::warn!(
                credential_id = %stored.credential_id,
                stored = stored.sign_counter,
                presented,
                "Sign counter regression; possible cloned authenticator"
            );
            return Ok(AssertionOutcome {
                user_id: stored.user_id,
                credential_id: stored.credential_id,
                clone_suspected: true,
            });
        }

        self.db
            .update_webauthn_counter(stored.credential_id, presented)
            .await?;
        Ok(AssertionOutcome {
            user_id: stored.user_id,
            credential_id: stored.credential_id,
            clone_suspected: false,
        })
    }

    // ==================== Management ====================

    pub async fn list(&self, user_id: Uuid) -> Result<Vec<WebAuthnCredential>, ServiceError> {
        self.db.find_webauthn_credentials(user_id).await
    }

    pub async fn rename(
        &self,
        user_id: Uuid,
        credential_id: Uuid,
        friendly_name: &str,
    ) -> Result<(), ServiceError> {
        let updated = self
            .db
            .rename_webauthn_credential(user_id, credential_id, friendly_name)
            .await?;
        if updated == 0 {
            return Err(ServiceError::CredentialNotFound);
        }
        Ok(())
    }

    /// Remove a credential, refusing when it is the account's only
    /// remaining factor. The guard lives inside the DELETE statement, so
    /// concurrent removals cannot race an account down to zero.
    pub async fn remove(&self, user: &User, credential_id: Uuid) -> Result<(), ServiceError> {
        let deleted = self
            .db
            .delete_webauthn_credential(user.user_id, credential_id, !user.is_passwordless())
            .await?;
        if deleted == 0 {
            let stored = self.db.find_webauthn_credentials(user.user_id).await?;
            let exists = stored.iter().any(|c| c.credential_id == credential_id);
            if exists && deletion_locks_out(stored.len() as u64, user.is_passwordless()) {
                return Err(ServiceError::LastCredential);
            }
            return Err(ServiceError::CredentialNotFound);
        }
        Ok(())
    }
}
