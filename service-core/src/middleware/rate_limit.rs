//! Tiered rate limiting.
//!
//! Three independent tiers gate the identity endpoints before any business
//! logic runs: `public` for read-only surfaces, `auth` for credential
//! verification, `sensitive` for credential enrollment/destruction. Each tier
//! is keyed by client IP; credential endpoints additionally check an
//! account-identifier key so a distributed credential-stuffing run cannot
//! hide behind many source addresses.

use crate::error::{AppError, ErrorBody};
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use governor::{
    clock::{Clock, DefaultClock},
    state::keyed::DashMapStateStore,
    Quota, RateLimiter,
};
use std::{net::IpAddr, num::NonZeroU32, sync::Arc, time::Duration};

/// Rate limiter keyed by IP address.
pub type IpKeyedLimiter = RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>;

/// Rate limiter keyed by an opaque account identifier (lowercased email).
pub type AccountKeyedLimiter = RateLimiter<String, DashMapStateStore<String>, DefaultClock>;

/// Rate-limit tier identities, each with its own 429 code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateTier {
    Public,
    Auth,
    Sensitive,
}

impl RateTier {
    pub fn code(&self) -> &'static str {
        match self {
            RateTier::Public => "RATE_LIMIT_EXCEEDED",
            RateTier::Auth => "AUTH_RATE_LIMIT_EXCEEDED",
            RateTier::Sensitive => "SENSITIVE_RATE_LIMIT_EXCEEDED",
        }
    }

    fn message_en(&self) -> &'static str {
        match self {
            RateTier::Public => "Too many requests. Please try again later.",
            RateTier::Auth => "Too many authentication attempts. Please try again later.",
            RateTier::Sensitive => {
                "Too many sensitive operations. Please try again later."
            }
        }
    }

    fn message_ar(&self) -> &'static str {
        match self {
            RateTier::Public => "عدد كبير من الطلبات، يرجى المحاولة لاحقاً",
            RateTier::Auth => "عدد كبير من محاولات تسجيل الدخول، يرجى المحاولة لاحقاً",
            RateTier::Sensitive => "عدد كبير من العمليات الحساسة، يرجى المحاولة لاحقاً",
        }
    }
}

/// One tier of the limiter stack: a quota applied per-IP and per-account.
pub struct TierLimiter {
    tier: RateTier,
    limit: u32,
    window_seconds: u64,
    by_ip: IpKeyedLimiter,
    by_account: AccountKeyedLimiter,
}

impl TierLimiter {
    pub fn new(tier: RateTier, limit: u32, window_seconds: u64) -> Arc<Self> {
        let limit = limit.max(1);
        let period = Duration::from_millis((window_seconds * 1000) / u64::from(limit));
        let quota = Quota::with_period(period)
            .expect("rate limit period is non-zero")
            .allow_burst(NonZeroU32::new(limit).expect("limit is guaranteed non-zero"));

        Arc::new(Self {
            tier,
            limit,
            window_seconds,
            by_ip: RateLimiter::dashmap(quota),
            by_account: RateLimiter::dashmap(quota),
        })
    }

    pub fn tier(&self) -> RateTier {
        self.tier
    }

    /// Check the per-IP budget; returns the tier's 429 on exhaustion.
    pub fn check_ip(&self, ip: IpAddr) -> Result<(), AppError> {
        match self.by_ip.check_key(&ip) {
            Ok(()) => Ok(()),
            Err(negative) => Err(self.exceeded(negative.wait_time_from(DefaultClock::default().now()))),
        }
    }

    /// Check the per-account budget for credential endpoints.
    pub fn check_account(&self, account: &str) -> Result<(), AppError> {
        let key = account.trim().to_lowercase();
        match self.by_account.check_key(&key) {
            Ok(()) => Ok(()),
            Err(negative) => Err(self.exceeded(negative.wait_time_from(DefaultClock::default().now()))),
        }
    }

    fn exceeded(&self, wait: Duration) -> AppError {
        AppError::TooManyRequests {
            body: ErrorBody::new(
                self.tier.code(),
                self.tier.message_ar(),
                self.tier.message_en(),
            ),
            limit: self.limit,
            window_seconds: self.window_seconds,
            retry_after_seconds: wait.as_secs().max(1),
        }
    }
}

/// Resolve the client IP: `x-forwarded-for` first (edge-terminated TLS),
/// falling back to the socket peer address.
pub fn client_ip(request: &Request) -> Option<IpAddr> {
    let forwarded = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse::<IpAddr>().ok());

    forwarded.or_else(|| {
        request
            .extensions()
            .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
            .map(|axum::extract::ConnectInfo(addr)| addr.ip())
    })
}

/// Middleware applying one tier's per-IP budget to a route group.
pub async fn tier_rate_limit_middleware(
    State(limiter): State<Arc<TierLimiter>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    match client_ip(&request) {
        Some(ip) => {
            limiter.check_ip(ip)?;
            Ok(next.run(request).await)
        }
        None => {
            tracing::warn!(tier = ?limiter.tier(), "Could not determine IP for rate limiting");
            Ok(next.run(request).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_tier_denies_sixteenth_attempt() {
        let limiter = TierLimiter::new(RateTier::Auth, 15, 900);
        let ip: IpAddr = "203.0.113.7".parse().unwrap();

        for _ in 0..15 {
            assert!(limiter.check_ip(ip).is_ok());
        }

        let err = limiter.check_ip(ip).unwrap_err();
        match err {
            AppError::TooManyRequests { body, limit, .. } => {
                assert_eq!(body.code, "AUTH_RATE_LIMIT_EXCEEDED");
                assert_eq!(limit, 15);
            }
            other => panic!("expected TooManyRequests, got {other:?}"),
        }

        // A different IP is unaffected.
        let other_ip: IpAddr = "203.0.113.8".parse().unwrap();
        assert!(limiter.check_ip(other_ip).is_ok());
    }

    #[test]
    fn account_key_is_case_insensitive() {
        let limiter = TierLimiter::new(RateTier::Sensitive, 3, 3600);

        assert!(limiter.check_account("Lawyer@Firm.example").is_ok());
        assert!(limiter.check_account("lawyer@firm.example").is_ok());
        assert!(limiter.check_account("LAWYER@FIRM.EXAMPLE").is_ok());

        let err = limiter.check_account("lawyer@firm.example").unwrap_err();
        match err {
            AppError::TooManyRequests { body, .. } => {
                assert_eq!(body.code, "SENSITIVE_RATE_LIMIT_EXCEEDED");
            }
            other => panic!("expected TooManyRequests, got {other:?}"),
        }
    }

    #[test]
    fn public_tier_uses_generic_code() {
        let limiter = TierLimiter::new(RateTier::Public, 1, 900);
        let ip: IpAddr = "198.51.100.1".parse().unwrap();
        assert!(limiter.check_ip(ip).is_ok());
        let err = limiter.check_ip(ip).unwrap_err();
        match err {
            AppError::TooManyRequests { body, .. } => {
                assert_eq!(body.code, "RATE_LIMIT_EXCEEDED");
            }
            other => panic!("expected TooManyRequests, got {other:?}"),
        }
    }
}
