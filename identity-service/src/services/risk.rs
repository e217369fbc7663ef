//! Session risk engine.
//!
//! Flags sessions, never terminates them: a false positive that logged the
//! user out would be worse than a flagged row the user can review in the
//! security center. All signals reduce to pure functions over session
//! history so they stay testable without a database.

use chrono::{DateTime, Utc};

use crate::config::RiskConfig;
use crate::models::{DeviceFingerprint, GeoLocation, Session, SuspicionReason};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two coordinates.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Implied speed between two located observations, in km/h. `None` when
/// either point lacks coordinates or no time passed.
pub fn implied_speed_kmh(
    from: &GeoLocation,
    from_time: DateTime<Utc>,
    to: &GeoLocation,
    to_time: DateTime<Utc>,
) -> Option<f64> {
    let (lat1, lon1) = (from.latitude?, from.longitude?);
    let (lat2, lon2) = (to.latitude?, to.longitude?);
    let hours = (to_time - from_time).num_seconds() as f64 / 3600.0;
    if hours <= 0.0 {
        return None;
    }
    Some(haversine_km(lat1, lon1, lat2, lon2) / hours)
}

#[derive(Clone)]
pub struct RiskEngine {
    config: RiskConfig,
}

impl RiskEngine {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Evaluate a freshly created session against the user's recent
    /// history, flagging it in place.
    pub fn evaluate_new_session(&self, session: &mut Session, history: &[Session]) {
        let fingerprint = session.fingerprint();
        let known_device = history
            .iter()
            .any(|s| s.fingerprint().key() == fingerprint.key());
        if !known_device {
            // Surfaced as its own flag; suspicion reasons are reserved for
            // the mid-session signals with a fixed client vocabulary.
            session.is_new_device = true;
        }

        if let Some(geo) = session.geo() {
            let known_location = history
                .iter()
                .any(|s| s.seen_locations.contains(&geo.key()));
            if !known_location && !history.is_empty() {
                session.flag(SuspicionReason::LocationChange);
            }

            // Impossible travel against the most recent located activity.
            if let Some((last_geo, last_time)) = latest_located(history) {
                if let Some(speed) =
                    implied_speed_kmh(&last_geo, last_time, &geo, session.created_utc)
                {
                    if speed > self.config.impossible_travel_kmh {
                        session.flag(SuspicionReason::ImpossibleTravel);
                    }
                }
            }

            // A concurrently active session in another country.
            let conflict = history.iter().any(|s| {
                s.is_valid()
                    && s.country.is_some()
                    && s.country != session.country
            });
            if conflict {
                session.flag(SuspicionReason::MultipleLocations);
            }
        }
    }

    /// Per-request evaluation of an established session against its own
    /// registration-time baseline. Updates activity bookkeeping and raises
    /// flags; returns the newly raised reasons.
    pub fn evaluate_activity(
        &self,
        session: &mut Session,
        ip: &str,
        fingerprint: &DeviceFingerprint,
        geo: Option<&GeoLocation>,
        now: DateTime<Utc>,
    ) -> Vec<SuspicionReason> {
        let before = session.suspicious_reasons.len();

        if ip != session.ip_address {
            session.flag(SuspicionReason::IpMismatch);
        }

        if fingerprint.key() != session.fingerprint().key() {
            session.flag(SuspicionReason::UserAgentMismatch);
        }

        if let Some(geo) = geo {
            if let (Some(previous), last_time) = (session.geo(), session.last_activity_utc) {
                if let Some(speed) = implied_speed_kmh(&previous, last_time, geo, now) {
                    if speed > self.config.impossible_travel_kmh {
                        session.flag(SuspicionReason::ImpossibleTravel);
                    }
                }
            }
            let key = geo.key();
            if !session.seen_locations.contains(&key) {
                session.flag(SuspicionReason::LocationChange);
                session.seen_locations.push(key);
                if session.seen_locations.len() > 2 {
                    session.flag(SuspicionReason::MultipleLocations);
                }
            }
        }

        session.request_count += 1;
        session.last_activity_utc = now;
        if self.is_rapid(session, now) {
            session.flag(SuspicionReason::AbnormalActivityPattern);
        }

        session
            .suspicious_reasons
            .iter()
            .skip(before)
            .filter_map(|s| SuspicionReason::parse(s))
            .collect()
    }

    /// Sustained request rate well beyond interactive use. Requires a
    /// minimum sample so the first burst of page-load requests does not
    /// trip it.
    fn is_rapid(&self, session: &Session, now: DateTime<Utc>) -> bool {
        if session.request_count < self.config.rapid_request_min_sample {
            return false;
        }
        let minutes = (now - session.created_utc).num_seconds() as f64 / 60.0;
        if minutes <= 0.0 {
            return true;
        }
        session.request_count as f64 / minutes > self.config.max_requests_per_minute as f64
    }
}

fn latest_located(history: &[Session]) -> Option<(GeoLocation, DateTime<Utc>)> {
    history
        .iter()
        .filter_map(|s| s.geo().map(|g| (g, s.last_activity_utc)))
        .filter(|(g, _)| g.latitude.is_some() && g.longitude.is_some())
        .max_by_key(|(_, t)| *t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn engine() -> RiskEngine {
        RiskEngine::new(RiskConfig {
            impossible_travel_kmh: 900.0,
            max_requests_per_minute: 120,
            rapid_request_min_sample: 30,
        })
    }

    fn fingerprint(browser: &str) -> DeviceFingerprint {
        DeviceFingerprint {
            browser: browser.to_string(),
            os: "Linux".to_string(),
            device_class: "desktop".to_string(),
        }
    }

    fn riyadh() -> GeoLocation {
        GeoLocation {
            country: "SA".to_string(),
            city: Some("Riyadh".to_string()),
            region: None,
            latitude: Some(24.7136),
            longitude: Some(46.6753),
        }
    }

    fn london() -> GeoLocation {
        GeoLocation {
            country: "GB".to_string(),
            city: Some("London".to_string()),
            region: None,
            latitude: Some(51.5074),
            longitude: Some(-0.1278),
        }
    }

    fn session(fp: DeviceFingerprint, geo: Option<GeoLocation>) -> Session {
        Session::new(
            Uuid::new_v4(),
            "203.0.113.9".to_string(),
            "ua".to_string(),
            fp,
            geo,
            false,
        )
    }

    #[test]
    fn haversine_matches_known_distance() {
        // Riyadh to London is roughly 4900 km.
        let km = haversine_km(24.7136, 46.6753, 51.5074, -0.1278);
        assert!((4700.0..5100.0).contains(&km), "got {km}");
    }

    #[test]
    fn first_session_is_new_device_but_not_suspicious() {
        let engine = engine();
        let mut s = session(fingerprint("Firefox"), Some(riyadh()));
        engine.evaluate_new_session(&mut s, &[]);
        assert!(s.is_new_device);
        assert!(!s.is_suspicious);
        assert!(s.suspicious_reasons.is_empty());
    }

    #[test]
    fn unseen_device_and_location_are_flagged() {
        let engine = engine();
        let history = vec![session(fingerprint("Firefox"), Some(riyadh()))];
        let mut s = session(fingerprint("Chrome"), Some(london()));
        engine.evaluate_new_session(&mut s, &history);
        assert!(s.is_new_device);
        assert!(s.reasons().contains(&SuspicionReason::LocationChange));
    }

    #[test]
    fn known_location_on_a_new_device_is_not_suspicious() {
        let engine = engine();
        let history = vec![session(fingerprint("Firefox"), Some(riyadh()))];
        let mut s = session(fingerprint("Chrome"), Some(riyadh()));
        s.created_utc = Utc::now() + Duration::hours(1);
        engine.evaluate_new_session(&mut s, &history);
        assert!(s.is_new_device);
        assert!(!s.is_suspicious);
    }

    #[test]
    fn impossible_travel_is_flagged_on_fast_relocation() {
        let engine = engine();
        let mut previous = session(fingerprint("Firefox"), Some(riyadh()));
        previous.last_activity_utc = Utc::now() - Duration::minutes(30);
        let mut s = session(fingerprint("Firefox"), Some(london()));
        engine.evaluate_new_session(&mut s, &[previous]);
        // 4900 km in 30 minutes is far beyond 900 km/h.
        assert!(s.reasons().contains(&SuspicionReason::ImpossibleTravel));
    }

    #[test]
    fn slow_relocation_is_not_impossible_travel() {
        let engine = engine();
        let mut previous = session(fingerprint("Firefox"), Some(riyadh()));
        previous.last_activity_utc = Utc::now() - Duration::hours(12);
        previous.terminated_utc = Some(Utc::now() - Duration::hours(11));
        let mut s = session(fingerprint("Firefox"), Some(london()));
        engine.evaluate_new_session(&mut s, &[previous]);
        assert!(!s.reasons().contains(&SuspicionReason::ImpossibleTravel));
    }

    #[test]
    fn concurrent_sessions_in_different_countries_conflict() {
        let engine = engine();
        let history = vec![session(fingerprint("Firefox"), Some(riyadh()))];
        let mut s = session(fingerprint("Firefox"), Some(london()));
        engine.evaluate_new_session(&mut s, &history);
        assert!(s.reasons().contains(&SuspicionReason::MultipleLocations));
    }

    #[test]
    fn ip_change_mid_session_is_flagged() {
        let engine = engine();
        let mut s = session(fingerprint("Firefox"), None);
        let raised = engine.evaluate_activity(
            &mut s,
            "198.51.100.7",
            &fingerprint("Firefox"),
            None,
            Utc::now(),
        );
        assert_eq!(raised, vec![SuspicionReason::IpMismatch]);
        // Flagged, never terminated.
        assert!(s.is_valid());
    }

    #[test]
    fn user_agent_change_mid_session_is_flagged() {
        let engine = engine();
        let mut s = session(fingerprint("Firefox"), None);
        let raised = engine.evaluate_activity(
            &mut s,
            "203.0.113.9",
            &fingerprint("Chrome"),
            None,
            Utc::now(),
        );
        assert_eq!(raised, vec![SuspicionReason::UserAgentMismatch]);
    }

    #[test]
    fn sustained_burst_is_abnormal_activity() {
        let engine = engine();
        let mut s = session(fingerprint("Firefox"), None);
        s.created_utc = Utc::now() - Duration::seconds(10);
        let fp = fingerprint("Firefox");
        let mut raised = Vec::new();
        for _ in 0..40 {
            raised = engine.evaluate_activity(&mut s, "203.0.113.9", &fp, None, Utc::now());
        }
        assert!(s
            .reasons()
            .contains(&SuspicionReason::AbnormalActivityPattern));
        // Raised exactly once; later calls return nothing new.
        assert!(raised.is_empty() || raised == vec![SuspicionReason::AbnormalActivityPattern]);
    }

    #[test]
    fn flags_never_terminate_the_session() {
        let engine = engine();
        let history = vec![session(fingerprint("Firefox"), Some(riyadh()))];
        let mut s = session(fingerprint("Chrome"), Some(london()));
        engine.evaluate_new_session(&mut s, &history);
        assert!(s.is_suspicious);
        assert!(s.terminated_utc.is_none());
        assert!(s.is_valid());
    }
}
