//! MFA credential model - TOTP secret plus single-use backup codes.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

/// MFA enrollment states: `disabled -> pending_setup -> enabled -> disabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MfaState {
    PendingSetup,
    Active,
}

impl MfaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MfaState::PendingSetup => "pending",
            MfaState::Active => "active",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MfaState::PendingSetup),
            "active" => Some(MfaState::Active),
            _ => None,
        }
    }
}

/// TOTP credential, 1:1 with a user. The secret is ChaCha20-Poly1305
/// encrypted at rest; plaintext exists only transiently in memory.
#[derive(Debug, Clone, FromRow)]
pub struct MfaCredential {
    pub credential_id: Uuid,
    pub user_id: Uuid,
    pub secret_ciphertext: Vec<u8>,
    pub state_code: String,
    pub created_utc: DateTime<Utc>,
    pub activated_utc: Option<DateTime<Utc>>,
}

impl MfaCredential {
    pub fn new(user_id: Uuid, secret_ciphertext: Vec<u8>) -> Self {
        Self {
            credential_id: Uuid::new_v4(),
            user_id,
            secret_ciphertext,
            state_code: MfaState::PendingSetup.as_str().to_string(),
            created_utc: Utc::now(),
            activated_utc: None,
        }
    }

    pub fn state(&self) -> Option<MfaState> {
        MfaState::parse(&self.state_code)
    }

    pub fn is_active(&self) -> bool {
        self.state() == Some(MfaState::Active)
    }
}

/// One stored backup code. Only the SHA-256 hash is persisted; consumption
/// is recorded with a timestamp so a code can never verify twice.
#[derive(Debug, Clone, FromRow)]
pub struct BackupCode {
    pub code_id: Uuid,
    pub credential_id: Uuid,
    pub code_hash: String,
    pub consumed_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

impl BackupCode {
    pub fn is_consumed(&self) -> bool {
        self.consumed_utc.is_some()
    }

    /// Hash a normalized code with SHA-256 (hex).
    pub fn hash(code: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(normalize(code).as_bytes());
        hex::encode(hasher.finalize())
    }
}

pub const BACKUP_CODE_COUNT: usize = 10;
const BACKUP_CODE_LEN: usize = 8;
const BACKUP_CODE_GROUP: usize = 4;
// No 0/O/1/I to keep codes unambiguous when read over the phone.
const BACKUP_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// A freshly generated batch: plaintext codes (shown exactly once) plus
/// their hashes for storage.
#[derive(Debug)]
pub struct BackupCodeBatch {
    pub codes: Vec<String>,
    pub code_hashes: Vec<String>,
}

impl BackupCodeBatch {
    /// Generate exactly [`BACKUP_CODE_COUNT`] codes in `XXXX-XXXX` form.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        let mut codes = Vec::with_capacity(BACKUP_CODE_COUNT);
        let mut code_hashes = Vec::with_capacity(BACKUP_CODE_COUNT);
        for _ in 0..BACKUP_CODE_COUNT {
            let code = generate_code(&mut rng);
            code_hashes.push(BackupCode::hash(&code));
            codes.push(code);
        }
        Self { codes, code_hashes }
    }
}

/// Strip separators and uppercase so `ab2c-d3ef` matches `AB2C-D3EF`.
fn normalize(input: &str) -> String {
    input
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|ch| ch.to_ascii_uppercase())
        .collect()
}

/// True when the input even looks like a backup code (as opposed to a
/// 6-digit TOTP code).
pub fn looks_like_backup_code(input: &str) -> bool {
    normalize(input).len() == BACKUP_CODE_LEN
}

fn generate_code<R: RngCore>(rng: &mut R) -> String {
    let mut raw = [0u8; BACKUP_CODE_LEN];
    rng.fill_bytes(&mut raw);
    let mut out = String::with_capacity(BACKUP_CODE_LEN + 1);
    for (idx, byte) in raw.iter().enumerate() {
        if idx == BACKUP_CODE_GROUP {
            out.push('-');
        }
        let pos = usize::from(*byte) % BACKUP_CODE_ALPHABET.len();
        out.push(BACKUP_CODE_ALPHABET[pos] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_has_ten_grouped_codes() {
        let batch = BackupCodeBatch::generate();
        assert_eq!(batch.codes.len(), BACKUP_CODE_COUNT);
        assert_eq!(batch.code_hashes.len(), BACKUP_CODE_COUNT);
        for code in &batch.codes {
            assert_eq!(code.len(), 9, "XXXX-XXXX is nine characters: {code}");
            assert_eq!(code.as_bytes()[4], b'-');
            assert!(code
                .chars()
                .filter(|c| *c != '-')
                .all(|c| BACKUP_CODE_ALPHABET.contains(&(c as u8))));
        }
    }

    #[test]
    fn hash_is_separator_and_case_insensitive() {
        assert_eq!(BackupCode::hash("AB2C-D3EF"), BackupCode::hash("ab2cd3ef"));
        assert_ne!(BackupCode::hash("AB2C-D3EF"), BackupCode::hash("AB2C-D3EG"));
    }

    #[test]
    fn totp_codes_are_not_mistaken_for_backup_codes() {
        assert!(!looks_like_backup_code("123456"));
        assert!(looks_like_backup_code("AB2C-D3EF"));
    }

    #[test]
    fn batches_do_not_repeat() {
        let a = BackupCodeBatch::generate();
        let b = BackupCodeBatch::generate();
        assert_ne!(a.codes, b.codes);
    }
}
