//! Short-lived single-use challenge storage.
//!
//! Backs WebAuthn ceremony state, outbound SAML request ids and CSRF
//! tokens. Redis in production; an in-memory store keeps tests free of
//! external processes.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use redis::AsyncCommands;
use std::sync::Arc;

use super::error::ServiceError;

/// Key-value store where `take` removes the value atomically. A challenge
/// can therefore verify at most once.
#[async_trait]
pub trait ChallengeStore: Send + Sync {
    async fn put(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), ServiceError>;

    /// Read without consuming, used for CSRF tokens which stay valid for
    /// the session lifetime.
    async fn peek(&self, key: &str) -> Result<Option<String>, ServiceError>;

    /// Atomically read and delete.
    async fn take(&self, key: &str) -> Result<Option<String>, ServiceError>;

    async fn delete(&self, key: &str) -> Result<(), ServiceError>;
}

/// Redis-backed store using key TTLs and `GETDEL` for consumption.
pub struct RedisChallengeStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisChallengeStore {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ChallengeStore for RedisChallengeStore {
    async fn put(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), ServiceError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_seconds).await?;
        Ok(())
    }

    async fn peek(&self, key: &str) -> Result<Option<String>, ServiceError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn take(&self, key: &str) -> Result<Option<String>, ServiceError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GETDEL").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), ServiceError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}

/// In-memory store for tests and single-node development.
#[derive(Default)]
pub struct MemoryChallengeStore {
    entries: Arc<DashMap<String, (String, DateTime<Utc>)>>,
}

impl MemoryChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self, key: &str) -> Option<String> {
        let entry = self.entries.get(key)?;
        let (value, expires) = entry.value();
        if Utc::now() > *expires {
            return None;
        }
        Some(value.clone())
    }
}

#[async_trait]
impl ChallengeStore for MemoryChallengeStore {
    async fn put(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), ServiceError> {
        let expires = Utc::now() + Duration::seconds(ttl_seconds as i64);
        self.entries
            .insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }

    async fn peek(&self, key: &str) -> Result<Option<String>, ServiceError> {
        Ok(self.live(key))
    }

    async fn take(&self, key: &str) -> Result<Option<String>, ServiceError> {
        let value = self.live(key);
        self.entries.remove(key);
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), ServiceError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Key namespaces, so one store serves every challenge family.
pub mod keys {
    use uuid::Uuid;

    pub fn webauthn_registration(user_id: Uuid) -> String {
        format!("webauthn:reg:{user_id}")
    }

    pub fn webauthn_authentication(ceremony_id: Uuid) -> String {
        format!("webauthn:auth:{ceremony_id}")
    }

    pub fn saml_request(request_id: &str) -> String {
        format!("saml:req:{request_id}")
    }

    pub fn csrf(session_id: Uuid) -> String {
        format!("csrf:{session_id}")
    }

    pub fn mfa_login(ticket: &str) -> String {
        format!("mfa:login:{ticket}")
    }

    pub fn password_reset(token_hash: &str) -> String {
        format!("pwreset:{token_hash}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn take_consumes_exactly_once() {
        let store = MemoryChallengeStore::new();
        store.put("k", "v", 60).await.unwrap();
        assert_eq!(store.take("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(store.take("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn peek_does_not_consume() {
        let store = MemoryChallengeStore::new();
        store.put("k", "v", 60).await.unwrap();
        assert_eq!(store.peek("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(store.peek("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn expired_entries_are_gone() {
        let store = MemoryChallengeStore::new();
        store.put("k", "v", 0).await.unwrap();
        assert_eq!(store.take("k").await.unwrap(), None);
    }
}
