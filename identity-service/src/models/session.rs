//! Session model - device fingerprint, geo context and risk state.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Closed vocabulary of suspicion reasons. The risk engine only ever
/// appends values from this set; free-text reasons would break client
/// rendering of the Arabic security center.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SuspicionReason {
    IpMismatch,
    UserAgentMismatch,
    ImpossibleTravel,
    LocationChange,
    MultipleLocations,
    AbnormalActivityPattern,
}

impl SuspicionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuspicionReason::IpMismatch => "ip_mismatch",
            SuspicionReason::UserAgentMismatch => "user_agent_mismatch",
            SuspicionReason::ImpossibleTravel => "impossible_travel",
            SuspicionReason::LocationChange => "location_change",
            SuspicionReason::MultipleLocations => "multiple_locations",
            SuspicionReason::AbnormalActivityPattern => "abnormal_activity_pattern",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ip_mismatch" => Some(SuspicionReason::IpMismatch),
            "user_agent_mismatch" => Some(SuspicionReason::UserAgentMismatch),
            "impossible_travel" => Some(SuspicionReason::ImpossibleTravel),
            "location_change" => Some(SuspicionReason::LocationChange),
            "multiple_locations" => Some(SuspicionReason::MultipleLocations),
            "abnormal_activity_pattern" => Some(SuspicionReason::AbnormalActivityPattern),
            _ => None,
        }
    }
}

/// Device attributes parsed from the User-Agent at session creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DeviceFingerprint {
    pub browser: String,
    pub os: String,
    /// "desktop", "mobile" or "tablet".
    pub device_class: String,
}

impl DeviceFingerprint {
    /// Stable key used for "seen this device before" comparisons.
    pub fn key(&self) -> String {
        format!("{}|{}|{}", self.browser, self.os, self.device_class)
    }
}

/// Geo context resolved by the edge proxy and forwarded in headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct GeoLocation {
    pub country: String,
    pub city: Option<String>,
    pub region: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl GeoLocation {
    /// Coarse key for "seen this location before" comparisons.
    pub fn key(&self) -> String {
        match &self.city {
            Some(city) => format!("{}|{}", self.country, city),
            None => self.country.clone(),
        }
    }
}

/// Server-side session row. One row per login; refresh rotation reuses the
/// row, termination stamps `terminated_utc` and never deletes.
#[derive(Debug, Clone, FromRow)]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub ip_address: String,
    pub user_agent: String,
    pub browser: String,
    pub os: String,
    pub device_class: String,
    pub country: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub created_utc: DateTime<Utc>,
    pub last_activity_utc: DateTime<Utc>,
    pub expires_utc: DateTime<Utc>,
    pub terminated_utc: Option<DateTime<Utc>>,
    pub is_new_device: bool,
    pub is_suspicious: bool,
    /// Deduplicated subset of [`SuspicionReason`] string forms.
    pub suspicious_reasons: Vec<String>,
    /// Location keys observed over the session lifetime, oldest first.
    pub seen_locations: Vec<String>,
    pub request_count: i64,
    pub remember_me: bool,
}

/// Idle timeout before a session stops accepting activity.
pub const SESSION_IDLE_DAYS: i64 = 7;
/// Extended lifetime when the user opted into "remember me".
pub const SESSION_REMEMBER_ME_DAYS: i64 = 30;

impl Session {
    pub fn new(
        user_id: Uuid,
        ip_address: String,
        user_agent: String,
        fingerprint: DeviceFingerprint,
        geo: Option<GeoLocation>,
        remember_me: bool,
    ) -> Self {
        let now = Utc::now();
        let lifetime = if remember_me {
            Duration::days(SESSION_REMEMBER_ME_DAYS)
        } else {
            Duration::days(SESSION_IDLE_DAYS)
        };
        let seen_locations = geo.as_ref().map(|g| vec![g.key()]).unwrap_or_default();
        Self {
            session_id: Uuid::new_v4(),
            user_id,
            ip_address,
            user_agent,
            browser: fingerprint.browser,
            os: fingerprint.os,
            device_class: fingerprint.device_class,
            country: geo.as_ref().map(|g| g.country.clone()),
            city: geo.as_ref().and_then(|g| g.city.clone()),
            region: geo.as_ref().and_then(|g| g.region.clone()),
            latitude: geo.as_ref().and_then(|g| g.latitude),
            longitude: geo.as_ref().and_then(|g| g.longitude),
            created_utc: now,
            last_activity_utc: now,
            expires_utc: now + lifetime,
            terminated_utc: None,
            is_new_device: false,
            is_suspicious: false,
            suspicious_reasons: Vec::new(),
            seen_locations,
            request_count: 0,
            remember_me,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated_utc.is_some()
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_utc
    }

    pub fn is_valid(&self) -> bool {
        !self.is_terminated() && !self.is_expired()
    }

    pub fn fingerprint(&self) -> DeviceFingerprint {
        DeviceFingerprint {
            browser: self.browser.clone(),
            os: self.os.clone(),
            device_class: self.device_class.clone(),
        }
    }

    pub fn geo(&self) -> Option<GeoLocation> {
        self.country.as_ref().map(|country| GeoLocation {
            country: country.clone(),
            city: self.city.clone(),
            region: self.region.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
        })
    }

    /// Append a reason without duplicating it, and mark the session.
    pub fn flag(&mut self, reason: SuspicionReason) {
        let code = reason.as_str().to_string();
        if !self.suspicious_reasons.contains(&code) {
            self.suspicious_reasons.push(code);
        }
        self.is_suspicious = true;
    }

    pub fn reasons(&self) -> Vec<SuspicionReason> {
        self.suspicious_reasons
            .iter()
            .filter_map(|s| SuspicionReason::parse(s))
            .collect()
    }
}

/// Session listing entry for the user's security center.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub browser: String,
    pub os: String,
    pub device_class: String,
    pub ip_address: String,
    pub country: Option<String>,
    pub city: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub last_activity_utc: DateTime<Utc>,
    pub is_current: bool,
    pub is_suspicious: bool,
    pub suspicious_reasons: Vec<String>,
}

impl SessionInfo {
    pub fn from_session(s: &Session, current_session_id: Uuid) -> Self {
        Self {
            session_id: s.session_id,
            browser: s.browser.clone(),
            os: s.os.clone(),
            device_class: s.device_class.clone(),
            ip_address: s.ip_address.clone(),
            country: s.country.clone(),
            city: s.city.clone(),
            created_utc: s.created_utc,
            last_activity_utc: s.last_activity_utc,
            is_current: s.session_id == current_session_id,
            is_suspicious: s.is_suspicious,
            suspicious_reasons: s.suspicious_reasons.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint() -> DeviceFingerprint {
        DeviceFingerprint {
            browser: "Firefox".to_string(),
            os: "Linux".to_string(),
            device_class: "desktop".to_string(),
        }
    }

    #[test]
    fn remember_me_extends_lifetime() {
        let short = Session::new(
            Uuid::new_v4(),
            "203.0.113.9".to_string(),
            "ua".to_string(),
            fingerprint(),
            None,
            false,
        );
        let long = Session::new(
            Uuid::new_v4(),
            "203.0.113.9".to_string(),
            "ua".to_string(),
            fingerprint(),
            None,
            true,
        );
        assert!(long.expires_utc > short.expires_utc);
        assert!(short.is_valid());
    }

    #[test]
    fn flag_deduplicates_reasons() {
        let mut session = Session::new(
            Uuid::new_v4(),
            "203.0.113.9".to_string(),
            "ua".to_string(),
            fingerprint(),
            None,
            false,
        );
        session.flag(SuspicionReason::IpMismatch);
        session.flag(SuspicionReason::IpMismatch);
        session.flag(SuspicionReason::ImpossibleTravel);
        assert!(session.is_suspicious);
        assert_eq!(session.suspicious_reasons.len(), 2);
        assert_eq!(
            session.reasons(),
            vec![SuspicionReason::IpMismatch, SuspicionReason::ImpossibleTravel]
        );
    }

    #[test]
    fn geo_round_trips_through_columns() {
        let geo = GeoLocation {
            country: "SA".to_string(),
            city: Some("Riyadh".to_string()),
            region: Some("Riyadh Province".to_string()),
            latitude: Some(24.7136),
            longitude: Some(46.6753),
        };
        let session = Session::new(
            Uuid::new_v4(),
            "203.0.113.9".to_string(),
            "ua".to_string(),
            fingerprint(),
            Some(geo.clone()),
            false,
        );
        assert_eq!(session.geo(), Some(geo.clone()));
        assert_eq!(session.seen_locations, vec![geo.key()]);
    }
}
