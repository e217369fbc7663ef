//! PostgreSQL database service.
//!
//! All persistence goes through this wrapper; services never touch the pool
//! directly. Compare-and-set updates return the affected row count so the
//! caller decides what a lost race means.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use uuid::Uuid;

use super::error::ServiceError;
use crate::models::{
    AuthEvent, BackupCode, MfaCredential, RefreshToken, Session, SsoConfig, User,
    WebAuthnCredential,
};

/// PostgreSQL database wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Health check - ping the database.
    pub async fn health_check(&self) -> Result<(), ServiceError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // ==================== User Operations ====================

    pub async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, ServiceError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, ServiceError> {
        let user =
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE LOWER(email) = LOWER($1)")
                .bind(email)
                .fetch_optional(&self.pool)
                .await?;
        Ok(user)
    }

    pub async fn insert_user(&self, user: &User) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO users (
                user_id, email, password_hash, role_code, firm_id, is_solo_lawyer,
                email_verified, mfa_enabled, sso_managed, given_name, surname,
                user_state_code, password_changed_utc, password_expires_utc,
                created_utc, updated_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(user.user_id)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.role_code)
        .bind(user.firm_id)
        .bind(user.is_solo_lawyer)
        .bind(user.email_verified)
        .bind(user.mfa_enabled)
        .bind(user.sso_managed)
        .bind(&user.given_name)
        .bind(&user.surname)
        .bind(&user.user_state_code)
        .bind(user.password_changed_utc)
        .bind(user.password_expires_utc)
        .bind(user.created_utc)
        .bind(user.updated_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_user_password(
        &self,
        user_id: Uuid,
        password_hash: &str,
        expires_utc: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            UPDATE users
            SET password_hash = $2, password_changed_utc = NOW(),
                password_expires_utc = $3, updated_utc = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(password_hash)
        .bind(expires_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_user_mfa_enabled(
        &self,
        user_id: Uuid,
        enabled: bool,
    ) -> Result<(), ServiceError> {
        sqlx::query("UPDATE users SET mfa_enabled = $2, updated_utc = NOW() WHERE user_id = $1")
            .bind(user_id)
            .bind(enabled)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_user_profile_from_idp(
        &self,
        user_id: Uuid,
        given_name: Option<&str>,
        surname: Option<&str>,
    ) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            UPDATE users
            SET given_name = COALESCE($2, given_name),
                surname = COALESCE($3, surname),
                updated_utc = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(given_name)
        .bind(surname)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== Refresh Token Operations ====================

    pub async fn insert_refresh_token(&self, token: &RefreshToken) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (
                token_id, user_id, session_id, token_hash, rotated_from,
                revoked, expires_utc, created_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(token.token_id)
        .bind(token.user_id)
        .bind(token.session_id)
        .bind(&token.token_hash)
        .bind(token.rotated_from)
        .bind(token.revoked)
        .bind(token.expires_utc)
        .bind(token.created_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_refresh_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshToken>, ServiceError> {
        let token =
            sqlx::query_as::<_, RefreshToken>("SELECT * FROM refresh_tokens WHERE token_hash = $1")
                .bind(token_hash)
                .fetch_optional(&self.pool)
                .await?;
        Ok(token)
    }

    /// Compare-and-set revocation used by rotation. Exactly one concurrent
    /// caller observes `1` here; everyone else lost the race.
    pub async fn revoke_refresh_token_if_active(
        &self,
        token_id: Uuid,
    ) -> Result<u64, ServiceError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE WHERE token_id = $1 AND revoked = FALSE",
        )
        .bind(token_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Revoke every token in a session's lineage, used on reuse detection
    /// and on logout.
    pub async fn revoke_session_tokens(&self, session_id: Uuid) -> Result<u64, ServiceError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE WHERE session_id = $1 AND revoked = FALSE",
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn revoke_user_tokens(&self, user_id: Uuid) -> Result<u64, ServiceError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE WHERE user_id = $1 AND revoked = FALSE",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ==================== Session Operations ====================

    pub async fn insert_session(&self, session: &Session) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                session_id, user_id, ip_address, user_agent, browser, os, device_class,
                country, city, region, latitude, longitude,
                created_utc, last_activity_utc, expires_utc, terminated_utc,
                is_new_device, is_suspicious, suspicious_reasons, seen_locations,
                request_count, remember_me
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
            "#,
        )
        .bind(session.session_id)
        .bind(session.user_id)
        .bind(&session.ip_address)
        .bind(&session.user_agent)
        .bind(&session.browser)
        .bind(&session.os)
        .bind(&session.device_class)
        .bind(&session.country)
        .bind(&session.city)
        .bind(&session.region)
        .bind(session.latitude)
        .bind(session.longitude)
        .bind(session.created_utc)
        .bind(session.last_activity_utc)
        .bind(session.expires_utc)
        .bind(session.terminated_utc)
        .bind(session.is_new_device)
        .bind(session.is_suspicious)
        .bind(&session.suspicious_reasons)
        .bind(&session.seen_locations)
        .bind(session.request_count)
        .bind(session.remember_me)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_session_by_id(
        &self,
        session_id: Uuid,
    ) -> Result<Option<Session>, ServiceError> {
        let session = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE session_id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(session)
    }

    /// Active (non-terminated, non-expired) sessions, newest first.
    pub async fn find_active_sessions(&self, user_id: Uuid) -> Result<Vec<Session>, ServiceError> {
        let sessions = sqlx::query_as::<_, Session>(
            r#"
            SELECT * FROM sessions
            WHERE user_id = $1 AND terminated_utc IS NULL AND expires_utc > NOW()
            ORDER BY last_activity_utc DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    /// Most recent sessions regardless of state, for device/location history.
    pub async fn find_recent_sessions(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Session>, ServiceError> {
        let sessions = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE user_id = $1 ORDER BY created_utc DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    /// Persist activity bookkeeping and any newly raised flags.
    pub async fn touch_session(&self, session: &Session) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            UPDATE sessions
            SET last_activity_utc = $2, request_count = $3, is_suspicious = $4,
                suspicious_reasons = $5, seen_locations = $6
            WHERE session_id = $1
            "#,
        )
        .bind(session.session_id)
        .bind(session.last_activity_utc)
        .bind(session.request_count)
        .bind(session.is_suspicious)
        .bind(&session.suspicious_reasons)
        .bind(&session.seen_locations)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn terminate_session(&self, session_id: Uuid) -> Result<u64, ServiceError> {
        let result = sqlx::query(
            "UPDATE sessions SET terminated_utc = NOW() WHERE session_id = $1 AND terminated_utc IS NULL",
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn terminate_user_sessions(
        &self,
        user_id: Uuid,
        except: Option<Uuid>,
    ) -> Result<u64, ServiceError> {
        let result = sqlx::query(
            r#"
            UPDATE sessions SET terminated_utc = NOW()
            WHERE user_id = $1 AND terminated_utc IS NULL
              AND ($2::uuid IS NULL OR session_id <> $2)
            "#,
        )
        .bind(user_id)
        .bind(except)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ==================== MFA Operations ====================

    pub async fn find_mfa_credential(
        &self,
        user_id: Uuid,
    ) -> Result<Option<MfaCredential>, ServiceError> {
        let credential =
            sqlx::query_as::<_, MfaCredential>("SELECT * FROM mfa_credentials WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(credential)
    }

    /// Insert or replace the user's pending credential. Re-running setup
    /// before activation issues a fresh secret.
    pub async fn upsert_mfa_credential(
        &self,
        credential: &MfaCredential,
    ) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO mfa_credentials (
                credential_id, user_id, secret_ciphertext, state_code, created_utc, activated_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id) DO UPDATE
            SET credential_id = EXCLUDED.credential_id,
                secret_ciphertext = EXCLUDED.secret_ciphertext,
                state_code = EXCLUDED.state_code,
                created_utc = EXCLUDED.created_utc,
                activated_utc = EXCLUDED.activated_utc
            "#,
        )
        .bind(credential.credential_id)
        .bind(credential.user_id)
        .bind(&credential.secret_ciphertext)
        .bind(&credential.state_code)
        .bind(credential.created_utc)
        .bind(credential.activated_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn activate_mfa_credential(&self, credential_id: Uuid) -> Result<(), ServiceError> {
        sqlx::query(
            "UPDATE mfa_credentials SET state_code = 'active', activated_utc = NOW() WHERE credential_id = $1",
        )
        .bind(credential_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_mfa_credential(&self, user_id: Uuid) -> Result<(), ServiceError> {
        sqlx::query("DELETE FROM mfa_credentials WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Replace the credential's backup codes with a fresh batch.
    pub async fn replace_backup_codes(
        &self,
        credential_id: Uuid,
        code_hashes: &[String],
    ) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM backup_codes WHERE credential_id = $1")
            .bind(credential_id)
            .execute(&mut *tx)
            .await?;
        for hash in code_hashes {
            sqlx::query(
                r#"
                INSERT INTO backup_codes (code_id, credential_id, code_hash, created_utc)
                VALUES ($1, $2, $3, NOW())
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(credential_id)
            .bind(hash)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Consume a backup code by hash. Single-use is enforced by the
    /// `consumed_utc IS NULL` predicate, so a replayed code affects 0 rows.
    pub async fn consume_backup_code(
        &self,
        credential_id: Uuid,
        code_hash: &str,
    ) -> Result<u64, ServiceError> {
        let result = sqlx::query(
            r#"
            UPDATE backup_codes SET consumed_utc = NOW()
            WHERE credential_id = $1 AND code_hash = $2 AND consumed_utc IS NULL
            "#,
        )
        .bind(credential_id)
        .bind(code_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_unconsumed_backup_codes(
        &self,
        credential_id: Uuid,
    ) -> Result<i64, ServiceError> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM backup_codes WHERE credential_id = $1 AND consumed_utc IS NULL",
        )
        .bind(credential_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0)
    }

    pub async fn find_backup_codes(
        &self,
        credential_id: Uuid,
    ) -> Result<Vec<BackupCode>, ServiceError> {
        let codes =
            sqlx::query_as::<_, BackupCode>("SELECT * FROM backup_codes WHERE credential_id = $1")
                .bind(credential_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(codes)
    }

    // ==================== WebAuthn Operations ====================

    pub async fn insert_webauthn_credential(
        &self,
        credential: &WebAuthnCredential,
    ) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO webauthn_credentials (
                credential_id, user_id, external_id, public_key_json, sign_counter,
                device_type_code, transports, friendly_name, created_utc, last_used_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(credential.credential_id)
        .bind(credential.user_id)
        .bind(&credential.external_id)
        .bind(&credential.public_key_json)
        .bind(credential.sign_counter)
        .bind(&credential.device_type_code)
        .bind(&credential.transports)
        .bind(&credential.friendly_name)
        .bind(credential.created_utc)
        .bind(credential.last_used_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_webauthn_credentials(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<WebAuthnCredential>, ServiceError> {
        let credentials = sqlx::query_as::<_, WebAuthnCredential>(
            "SELECT * FROM webauthn_credentials WHERE user_id = $1 ORDER BY created_utc",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(credentials)
    }

    pub async fn find_webauthn_credential_by_external_id(
        &self,
        external_id: &[u8],
    ) -> Result<Option<WebAuthnCredential>, ServiceError> {
        let credential = sqlx::query_as::<_, WebAuthnCredential>(
            "SELECT * FROM webauthn_credentials WHERE external_id = $1",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(credential)
    }

    pub async fn update_webauthn_counter(
        &self,
        credential_id: Uuid,
        sign_counter: i64,
    ) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            UPDATE webauthn_credentials
            SET sign_counter = $2, last_used_utc = NOW()
            WHERE credential_id = $1
            "#,
        )
        .bind(credential_id)
        .bind(sign_counter)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn rename_webauthn_credential(
        &self,
        user_id: Uuid,
        credential_id: Uuid,
        friendly_name: &str,
    ) -> Result<u64, ServiceError> {
        let result = sqlx::query(
            r#"
            UPDATE webauthn_credentials
            SET friendly_name = $3
            WHERE user_id = $1 AND credential_id = $2
            "#,
        )
        .bind(user_id)
        .bind(credential_id)
        .bind(friendly_name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Delete a credential. Unless `allow_last` is set, the statement
    /// refuses to remove the user's only remaining credential; the count
    /// runs inside the DELETE so concurrent removals cannot both pass the
    /// guard.
    pub async fn delete_webauthn_credential(
        &self,
        user_id: Uuid,
        credential_id: Uuid,
        allow_last: bool,
    ) -> Result<u64, ServiceError> {
        let result = sqlx::query(
            r#"
            DELETE FROM webauthn_credentials
            WHERE user_id = $1 AND credential_id = $2
              AND ($3 OR (SELECT COUNT(*) FROM webauthn_credentials w WHERE w.user_id = $1) > 1)
            "#,
        )
        .bind(user_id)
        .bind(credential_id)
        .bind(allow_last)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ==================== SSO Config Operations ====================

    pub async fn find_sso_config(&self, firm_id: Uuid) -> Result<Option<SsoConfig>, ServiceError> {
        let config =
            sqlx::query_as::<_, SsoConfig>("SELECT * FROM sso_configs WHERE firm_id = $1")
                .bind(firm_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(config)
    }

    pub async fn upsert_sso_config(&self, config: &SsoConfig) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO sso_configs (
                config_id, firm_id, provider_code, enabled, idp_entity_id, idp_sso_url,
                idp_slo_url, idp_certificate_pem, allowed_domains, default_role_code,
                jit_provisioning, created_utc, updated_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (firm_id) DO UPDATE
            SET provider_code = EXCLUDED.provider_code,
                enabled = EXCLUDED.enabled,
                idp_entity_id = EXCLUDED.idp_entity_id,
                idp_sso_url = EXCLUDED.idp_sso_url,
                idp_slo_url = EXCLUDED.idp_slo_url,
                idp_certificate_pem = EXCLUDED.idp_certificate_pem,
                allowed_domains = EXCLUDED.allowed_domains,
                default_role_code = EXCLUDED.default_role_code,
                jit_provisioning = EXCLUDED.jit_provisioning,
                updated_utc = NOW()
            "#,
        )
        .bind(config.config_id)
        .bind(config.firm_id)
        .bind(&config.provider_code)
        .bind(config.enabled)
        .bind(&config.idp_entity_id)
        .bind(&config.idp_sso_url)
        .bind(&config.idp_slo_url)
        .bind(&config.idp_certificate_pem)
        .bind(&config.allowed_domains)
        .bind(&config.default_role_code)
        .bind(config.jit_provisioning)
        .bind(config.created_utc)
        .bind(config.updated_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== Audit Operations ====================

    pub async fn insert_auth_event(&self, event: &AuthEvent) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO auth_events (
                event_id, user_id, session_id, event_type_code, ip_address,
                user_agent, detail, created_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.event_id)
        .bind(event.user_id)
        .bind(event.session_id)
        .bind(&event.event_type_code)
        .bind(&event.ip_address)
        .bind(&event.user_agent)
        .bind(&event.detail)
        .bind(event.created_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_auth_events(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<AuthEvent>, ServiceError> {
        let events = sqlx::query_as::<_, AuthEvent>(
            "SELECT * FROM auth_events WHERE user_id = $1 ORDER BY created_utc DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }
}
