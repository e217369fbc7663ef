//! MFA engine - TOTP enrollment, verification and backup codes.
//!
//! TOTP seeds are sealed with ChaCha20-Poly1305 before they reach the
//! database. The AAD binds each ciphertext to its user and credential, so
//! a row copied between users fails to open.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use totp_rs::{Algorithm as TotpAlgorithm, Secret, TOTP};
use uuid::Uuid;

use super::database::Database;
use super::error::ServiceError;
use crate::models::{
    looks_like_backup_code, BackupCode, BackupCodeBatch, MfaCredential, User,
};

const NONCE_LEN: usize = 12;
const SEED_LEN: usize = 20;

fn seed_aad(user_id: Uuid, credential_id: Uuid) -> String {
    format!("totp-seed:v1|{user_id}|{credential_id}")
}

/// Seals and opens TOTP seeds. The 32-byte key comes from configuration
/// and never leaves process memory.
#[derive(Clone)]
pub struct SeedCipher {
    cipher: ChaCha20Poly1305,
}

impl SeedCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    pub fn from_hex(hex_key: &str) -> Result<Self, anyhow::Error> {
        let raw = hex::decode(hex_key)
            .map_err(|e| anyhow::anyhow!("MFA encryption key is not valid hex: {e}"))?;
        let key: [u8; 32] = raw
            .try_into()
            .map_err(|_| anyhow::anyhow!("MFA encryption key must be 32 bytes"))?;
        Ok(Self::new(&key))
    }

    /// Nonce is random per seal and prefixed to the ciphertext.
    pub fn seal(
        &self,
        seed: &[u8],
        user_id: Uuid,
        credential_id: Uuid,
    ) -> Result<Vec<u8>, ServiceError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let aad = seed_aad(user_id, credential_id);
        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: seed,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| ServiceError::Internal(anyhow::anyhow!("Seed encryption failed")))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(
        &self,
        sealed: &[u8],
        user_id: Uuid,
        credential_id: Uuid,
    ) -> Result<Vec<u8>, ServiceError> {
        if sealed.len() <= NONCE_LEN {
            return Err(ServiceError::Internal(anyhow::anyhow!(
                "Sealed seed is truncated"
            )));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let aad = seed_aad(user_id, credential_id);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| ServiceError::Internal(anyhow::anyhow!("Seed decryption failed")))
    }
}

/// Build the verifier for a raw seed. Skew of 1 accepts the previous and
/// next 30-second step to absorb clock drift.
fn totp_for_seed(
    seed: Vec<u8>,
    issuer: &str,
    account: &str,
) -> Result<TOTP, ServiceError> {
    TOTP::new(
        TotpAlgorithm::SHA1,
        6,
        1,
        30,
        seed,
        Some(issuer.to_string()),
        account.to_string(),
    )
    .map_err(|e| ServiceError::Internal(anyhow::anyhow!("TOTP construction failed: {e}")))
}

/// What `start_setup` hands back for the enrollment screen.
#[derive(Debug)]
pub struct MfaEnrollment {
    /// Base32 seed for manual entry.
    pub secret: String,
    /// otpauth:// URL for the QR code.
    pub otpauth_url: String,
}

#[derive(Clone)]
pub struct MfaService {
    db: Database,
    cipher: SeedCipher,
    issuer: String,
}

/// How a second factor was satisfied, for the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MfaMethod {
    Totp,
    BackupCode,
}

impl MfaService {
    pub fn new(db: Database, cipher: SeedCipher, issuer: String) -> Self {
        Self { db, cipher, issuer }
    }

    /// Begin enrollment: generate a seed, store it sealed in the pending
    /// state, return the secret for the QR screen. Restarting before
    /// activation replaces the pending seed.
    pub async fn start_setup(&self, user: &User) -> Result<MfaEnrollment, ServiceError> {
        if user.mfa_enabled {
            return Err(ServiceError::MfaAlreadyEnabled);
        }

        let mut seed = vec![0u8; SEED_LEN];
        rand::rngs::OsRng.fill_bytes(&mut seed);

        let credential_id = Uuid::new_v4();
        let sealed = self.cipher.seal(&seed, user.user_id, credential_id)?;
        let mut credential = MfaCredential::new(user.user_id, sealed);
        credential.credential_id = credential_id;
        self.db.upsert_mfa_credential(&credential).await?;

        let totp = totp_for_seed(seed.clone(), &self.issuer, &user.email)?;
        Ok(MfaEnrollment {
            secret: Secret::Raw(seed).to_encoded().to_string(),
            otpauth_url: totp.get_url(),
        })
    }

    /// Activate a pending credential by proving possession of the seed.
    /// Returns the one-time plaintext backup codes.
    pub async fn activate(&self, user: &User, code: &str) -> Result<Vec<String>, ServiceError> {
        if user.mfa_enabled {
            return Err(ServiceError::MfaAlreadyEnabled);
        }
        let credential = self
            .db
            .find_mfa_credential(user.user_id)
            .await?
            .ok_or(ServiceError::MfaSetupNotStarted)?;
        if credential.is_active() {
            return Err(ServiceError::MfaAlreadyEnabled);
        }

        self.check_totp(user, &credential, code)?;

        let batch = BackupCodeBatch::generate();
        self.db.activate_mfa_credential(credential.credential_id).await?;
        self.db
            .replace_backup_codes(credential.credential_id, &batch.code_hashes)
            .await?;
        self.db.set_user_mfa_enabled(user.user_id, true).await?;
        Ok(batch.codes)
    }

    /// Verify a second factor during login. Backup codes are recognized by
    /// shape and consumed on success.
    pub async fn verify(&self, user: &User, code: &str) -> Result<MfaMethod, ServiceError> {
        let credential = self
            .db
            .find_mfa_credential(user.user_id)
            .await?
            .filter(MfaCredential::is_active)
            .ok_or(ServiceError::MfaNotEnabled)?;

        if looks_like_backup_code(code) {
            let consumed = self
                .db
                .consume_backup_code(credential.credential_id, &BackupCode::hash(code))
                .await?;
            if consumed == 1 {
                return Ok(MfaMethod::BackupCode);
            }
            return Err(ServiceError::InvalidCode);
        }

        self.check_totp(user, &credential, code)?;
        Ok(MfaMethod::Totp)
    }

    /// Disable MFA. The caller has already re-verified the user (password
    /// or current code); this clears the credential and its backup codes.
    pub async fn disable(&self, user: &User) -> Result<(), ServiceError> {
        if !user.mfa_enabled {
            return Err(ServiceError::MfaNotEnabled);
        }
        self.db.delete_mfa_credential(user.user_id).await?;
        self.db.set_user_mfa_enabled(user.user_id, false).await?;
        Ok(())
    }

    /// Issue a fresh batch of backup codes, invalidating all previous ones.
    pub async fn regenerate_backup_codes(
        &self,
        user: &User,
    ) -> Result<Vec<String>, ServiceError> {
        let credential = self
            .db
            .find_mfa_credential(user.user_id)
            .await?
            .filter(MfaCredential::is_active)
            .ok_or(ServiceError::MfaNotEnabled)?;
        let batch = BackupCodeBatch::generate();
        self.db
            .replace_backup_codes(credential.credential_id, &batch.code_hashes)
            .await?;
        Ok(batch.codes)
    }

    pub async fn remaining_backup_codes(&self, user: &User) -> Result<i64, ServiceError> {
        let credential = self
            .db
            .find_mfa_credential(user.user_id)
            .await?
            .filter(MfaCredential::is_active)
            .ok_or(ServiceError::MfaNotEnabled)?;
        self.db
            .count_unconsumed_backup_codes(credential.credential_id)
            .await
    }

    fn check_totp(
        &self,
        user: &User,
        credential: &MfaCredential,
        code: &str,
    ) -> Result<(), ServiceError> {
        let seed = self.cipher.open(
            &credential.secret_ciphertext,
            user.user_id,
            credential.credential_id,
        )?;
        let totp = totp_for_seed(seed, &self.issuer, &user.email)?;
        let ok = totp
            .check_current(code.trim())
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Clock error: {e}")))?;
        if ok {
            Ok(())
        } else {
            // A wrong TOTP is an invalid token; INVALID_CODE is reserved
            // for backup codes that are unknown or already consumed.
            Err(ServiceError::InvalidToken)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn cipher() -> SeedCipher {
        SeedCipher::new(&[7u8; 32])
    }

    #[test]
    fn sealed_seed_round_trips() {
        let cipher = cipher();
        let user_id = Uuid::new_v4();
        let credential_id = Uuid::new_v4();
        let seed = b"0123456789abcdefghij";
        let sealed = cipher.seal(seed, user_id, credential_id).unwrap();
        assert_ne!(&sealed[NONCE_LEN..], seed.as_slice());
        let opened = cipher.open(&sealed, user_id, credential_id).unwrap();
        assert_eq!(opened, seed);
    }

    #[test]
    fn ciphertext_is_bound_to_its_owner() {
        let cipher = cipher();
        let user_id = Uuid::new_v4();
        let credential_id = Uuid::new_v4();
        let sealed = cipher
            .seal(b"0123456789abcdefghij", user_id, credential_id)
            .unwrap();
        assert!(cipher.open(&sealed, Uuid::new_v4(), credential_id).is_err());
        assert!(cipher.open(&sealed, user_id, Uuid::new_v4()).is_err());
    }

    #[test]
    fn adjacent_step_codes_are_accepted() {
        let seed = b"0123456789abcdefghij".to_vec();
        let totp = totp_for_seed(seed, "Test", "user@example.com").unwrap();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let previous = totp.generate(now - 30);
        let current = totp.generate(now);
        assert!(totp.check(&previous, now));
        assert!(totp.check(&current, now));
        // Two steps back is outside the accepted window.
        let stale = totp.generate(now - 90);
        if stale != current && stale != previous && stale != totp.generate(now + 30) {
            assert!(!totp.check(&stale, now));
        }
    }

    #[tokio::test]
    async fn wrong_totp_is_an_invalid_token_not_an_invalid_code() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/never-connected")
            .unwrap();
        let service = MfaService::new(Database::new(pool), cipher(), "Test".to_string());

        let user = User::new(
            "totp@example.com".to_string(),
            None,
            crate::models::UserRole::Lawyer,
        );
        let credential_id = Uuid::new_v4();
        let sealed = service
            .cipher
            .seal(b"0123456789abcdefghij", user.user_id, credential_id)
            .unwrap();
        let mut credential = MfaCredential::new(user.user_id, sealed);
        credential.credential_id = credential_id;

        // Five digits can never be a valid six-digit code.
        let err = service.check_totp(&user, &credential, "00000").unwrap_err();
        assert!(matches!(err, ServiceError::InvalidToken));
    }

    #[test]
    fn provisioning_url_carries_issuer() {
        let seed = b"0123456789abcdefghij".to_vec();
        let totp = totp_for_seed(seed, "Mizan", "user@example.com").unwrap();
        let url = totp.get_url();
        assert!(url.starts_with("otpauth://totp/"));
        assert!(url.contains("issuer=Mizan"));
    }
}
