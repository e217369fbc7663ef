use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    /// Webhook of the notification service that delivers password reset
    /// links; without it resets are recorded but not delivered.
    pub notify_webhook_url: Option<String>,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub security: SecurityConfig,
    pub mfa: MfaConfig,
    pub webauthn: WebauthnConfig,
    pub saml: SamlConfig,
    pub rate_limit: RateLimitConfig,
    pub risk: RiskConfig,
    pub swagger: SwaggerConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub private_key_path: String,
    pub public_key_path: String,
    pub issuer: String,
    pub audience: String,
    pub access_token_expiry_minutes: i64,
    pub refresh_token_expiry_days: i64,
    pub refresh_token_remember_me_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    pub cookie_domain: Option<String>,
    pub cookie_secure: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MfaConfig {
    /// 32-byte ChaCha20-Poly1305 key, hex encoded.
    pub encryption_key_hex: String,
    /// Issuer shown in authenticator apps.
    pub issuer: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebauthnConfig {
    pub rp_id: String,
    pub rp_origin: String,
    pub rp_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SamlConfig {
    /// Public base URL the SP endpoints are derived from.
    pub base_url: String,
    /// RSA key that signs outbound AuthnRequests and LogoutRequests.
    pub sp_private_key_path: String,
    pub clock_skew_seconds: i64,
}

/// The three endpoint tiers. Windows are in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub public_limit: u32,
    pub public_window_seconds: u64,
    pub auth_limit: u32,
    pub auth_window_seconds: u64,
    pub sensitive_limit: u32,
    pub sensitive_window_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    pub impossible_travel_kmh: f64,
    pub max_requests_per_minute: i64,
    pub rapid_request_min_sample: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwaggerConfig {
    pub enabled: SwaggerMode,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SwaggerMode {
    Public,
    Disabled,
}

impl IdentityConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;
        let is_prod = environment == Environment::Prod;

        let config = IdentityConfig {
            common: common_config,
            environment,
            service_name: get_env("SERVICE_NAME", Some("identity-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            notify_webhook_url: env::var("NOTIFY_WEBHOOK_URL").ok(),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10", is_prod)?,
            },
            redis: RedisConfig {
                url: get_env("REDIS_URL", None, is_prod)?,
            },
            jwt: JwtConfig {
                private_key_path: get_env("JWT_PRIVATE_KEY_PATH", None, is_prod)?,
                public_key_path: get_env("JWT_PUBLIC_KEY_PATH", None, is_prod)?,
                issuer: get_env("JWT_ISSUER", Some("https://auth.mizan.example"), is_prod)?,
                audience: get_env("JWT_AUDIENCE", Some("mizan-platform"), is_prod)?,
                access_token_expiry_minutes: parse_env(
                    "JWT_ACCESS_TOKEN_EXPIRY_MINUTES",
                    "15",
                    is_prod,
                )?,
                refresh_token_expiry_days: parse_env(
                    "JWT_REFRESH_TOKEN_EXPIRY_DAYS",
                    "7",
                    is_prod,
                )?,
                refresh_token_remember_me_days: parse_env(
                    "JWT_REFRESH_TOKEN_REMEMBER_ME_DAYS",
                    "30",
                    is_prod,
                )?,
            },
            security: SecurityConfig {
                allowed_origins: get_env(
                    "ALLOWED_ORIGINS",
                    Some("http://localhost:3000"),
                    is_prod,
                )?
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
                cookie_domain: env::var("COOKIE_DOMAIN").ok(),
                cookie_secure: parse_env("COOKIE_SECURE", "true", is_prod)?,
            },
            mfa: MfaConfig {
                encryption_key_hex: get_env("MFA_ENCRYPTION_KEY", None, is_prod)?,
                issuer: get_env("MFA_ISSUER", Some("Mizan"), is_prod)?,
            },
            webauthn: WebauthnConfig {
                rp_id: get_env("WEBAUTHN_RP_ID", Some("localhost"), is_prod)?,
                rp_origin: get_env(
                    "WEBAUTHN_RP_ORIGIN",
                    Some("http://localhost:3000"),
                    is_prod,
                )?,
                rp_name: get_env("WEBAUTHN_RP_NAME", Some("Mizan"), is_prod)?,
            },
            saml: SamlConfig {
                base_url: get_env("SAML_BASE_URL", Some("http://localhost:8080"), is_prod)?,
                sp_private_key_path: get_env("SAML_SP_PRIVATE_KEY_PATH", None, is_prod)?,
                clock_skew_seconds: parse_env("SAML_CLOCK_SKEW_SECONDS", "90", is_prod)?,
            },
            rate_limit: RateLimitConfig {
                public_limit: parse_env("RATE_LIMIT_PUBLIC", "300", is_prod)?,
                public_window_seconds: parse_env("RATE_LIMIT_PUBLIC_WINDOW_SECONDS", "900", is_prod)?,
                auth_limit: parse_env("RATE_LIMIT_AUTH", "15", is_prod)?,
                auth_window_seconds: parse_env("RATE_LIMIT_AUTH_WINDOW_SECONDS", "900", is_prod)?,
                sensitive_limit: parse_env("RATE_LIMIT_SENSITIVE", "3", is_prod)?,
                sensitive_window_seconds: parse_env(
                    "RATE_LIMIT_SENSITIVE_WINDOW_SECONDS",
                    "3600",
                    is_prod,
                )?,
            },
            risk: RiskConfig {
                impossible_travel_kmh: parse_env("RISK_IMPOSSIBLE_TRAVEL_KMH", "900", is_prod)?,
                max_requests_per_minute: parse_env("RISK_MAX_REQUESTS_PER_MINUTE", "120", is_prod)?,
                rapid_request_min_sample: parse_env("RISK_RAPID_REQUEST_MIN_SAMPLE", "30", is_prod)?,
            },
            swagger: SwaggerConfig {
                enabled: get_env("ENABLE_SWAGGER", Some("public"), is_prod)?
                    .parse()
                    .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }
        if self.jwt.access_token_expiry_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_ACCESS_TOKEN_EXPIRY_MINUTES must be positive"
            )));
        }
        if self.jwt.refresh_token_expiry_days <= 0
            || self.jwt.refresh_token_remember_me_days < self.jwt.refresh_token_expiry_days
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Refresh token lifetimes are inconsistent"
            )));
        }
        if self.mfa.encryption_key_hex.len() != 64 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "MFA_ENCRYPTION_KEY must be 32 bytes of hex"
            )));
        }

        if self.environment == Environment::Prod {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }
            if !self.security.cookie_secure {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "COOKIE_SECURE must be true in production"
                )));
            }
            if self.swagger.enabled == SwaggerMode::Public {
                tracing::error!(
                    "Swagger is publicly accessible in production - consider 'disabled'"
                );
            }
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?
        .parse()
        .map_err(|e: T::Err| {
            AppError::ConfigError(anyhow::anyhow!("{} is invalid: {}", key, e))
        })
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

impl std::str::FromStr for SwaggerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "public" => Ok(SwaggerMode::Public),
            "disabled" => Ok(SwaggerMode::Disabled),
            _ => Err(format!("Invalid swagger mode: {}", s)),
        }
    }
}
