//! Session registry - creation, listing, activity tracking.
//!
//! Termination of tokens belonging to a session goes through the token
//! service; this service owns the session rows themselves.

use chrono::Utc;
use uuid::Uuid;

use super::database::Database;
use super::error::ServiceError;
use super::risk::RiskEngine;
use crate::models::{
    DeviceFingerprint, GeoLocation, Session, SessionInfo, SuspicionReason,
};

/// How many past sessions feed the risk evaluation of a new login.
const RISK_HISTORY_LIMIT: i64 = 50;

#[derive(Clone)]
pub struct SessionService {
    db: Database,
    risk: RiskEngine,
}

impl SessionService {
    pub fn new(db: Database, risk: RiskEngine) -> Self {
        Self { db, risk }
    }

    /// Create and persist a session for a fresh login, evaluated against
    /// the user's device and location history.
    pub async fn create(
        &self,
        user_id: Uuid,
        ip_address: String,
        user_agent: String,
        fingerprint: DeviceFingerprint,
        geo: Option<GeoLocation>,
        remember_me: bool,
    ) -> Result<Session, ServiceError> {
        let history = self
            .db
            .find_recent_sessions(user_id, RISK_HISTORY_LIMIT)
            .await?;
        let mut session = Session::new(
            user_id,
            ip_address,
            user_agent,
            fingerprint,
            geo,
            remember_me,
        );
        self.risk.evaluate_new_session(&mut session, &history);
        self.db.insert_session(&session).await?;
        Ok(session)
    }

    /// Record one authenticated request against the session: bumps activity
    /// bookkeeping, re-runs the per-request risk signals and persists any
    /// change. Returns the newly raised suspicion reasons.
    pub async fn note_activity(
        &self,
        session: &mut Session,
        ip: &str,
        fingerprint: &DeviceFingerprint,
        geo: Option<&GeoLocation>,
    ) -> Result<Vec<SuspicionReason>, ServiceError> {
        let raised = self
            .risk
            .evaluate_activity(session, ip, fingerprint, geo, Utc::now());
        self.db.touch_session(session).await?;
        Ok(raised)
    }

    pub async fn find_valid(&self, session_id: Uuid) -> Result<Option<Session>, ServiceError> {
        let session = self.db.find_session_by_id(session_id).await?;
        Ok(session.filter(Session::is_valid))
    }

    /// Active sessions of a user for the security center, current one
    /// marked.
    pub async fn list(
        &self,
        user_id: Uuid,
        current_session_id: Uuid,
    ) -> Result<Vec<SessionInfo>, ServiceError> {
        let sessions = self.db.find_active_sessions(user_id).await?;
        Ok(sessions
            .iter()
            .map(|s| SessionInfo::from_session(s, current_session_id))
            .collect())
    }

    /// Resolve a session only if it belongs to the given user.
    pub async fn find_owned(
        &self,
        user_id: Uuid,
        session_id: Uuid,
    ) -> Result<Session, ServiceError> {
        self.db
            .find_session_by_id(session_id)
            .await?
            .filter(|s| s.user_id == user_id)
            .ok_or(ServiceError::SessionNotFound)
    }
}
