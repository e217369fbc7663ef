pub mod config;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

use std::sync::Arc;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, patch, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

use service_core::error::AppError;
use service_core::middleware::rate_limit::{
    tier_rate_limit_middleware, RateTier, TierLimiter,
};
use service_core::middleware::security_headers::security_headers_middleware;
use service_core::middleware::tracing::request_id_middleware;

use crate::config::{Environment, IdentityConfig, SwaggerMode};
use crate::services::{
    ChallengeStore, Database, MfaService, SamlService, SeedCipher, SessionService, TokenService,
    WebauthnService,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::health,
        handlers::health::ready,
        handlers::auth::register,
        handlers::auth::login,
        handlers::auth::login_mfa,
        handlers::auth::refresh,
        handlers::auth::logout,
        handlers::auth::logout_all,
        handlers::auth::csrf,
        handlers::auth::me,
        handlers::auth::events,
        handlers::auth::change_password,
        handlers::auth::forgot_password,
        handlers::auth::reset_password,
        handlers::mfa::setup,
        handlers::mfa::activate,
        handlers::mfa::status,
        handlers::mfa::disable,
        handlers::mfa::regenerate_backup_codes,
        handlers::webauthn::start_registration,
        handlers::webauthn::finish_registration,
        handlers::webauthn::start_authentication,
        handlers::webauthn::finish_authentication,
        handlers::webauthn::list_credentials,
        handlers::webauthn::rename_credential,
        handlers::webauthn::delete_credential,
        handlers::saml::metadata,
        handlers::saml::login,
        handlers::saml::acs,
        handlers::saml::sls,
        handlers::saml::sls_post,
        handlers::saml::logout,
        handlers::saml::get_config,
        handlers::saml::put_config,
        handlers::saml::test_config,
        handlers::session::list,
        handlers::session::terminate,
        handlers::session::terminate_others,
    ),
    components(
        schemas(
            dtos::RegisterRequest,
            dtos::LoginRequest,
            dtos::MfaLoginRequest,
            dtos::MfaActivateRequest,
            dtos::MfaDisableRequest,
            dtos::WebauthnStartAuthenticationRequest,
            dtos::ChangePasswordRequest,
            dtos::ForgotPasswordRequest,
            dtos::ResetPasswordRequest,
            dtos::SsoConfigRequest,
            dtos::SsoConfigTestRequest,
            dtos::SsoConfigTestResponse,
            dtos::SlsForm,
            dtos::RenameCredentialRequest,
            dtos::TokenResponse,
            dtos::MfaChallengeResponse,
            dtos::MessageResponse,
            dtos::MfaSetupResponse,
            dtos::BackupCodesResponse,
            dtos::MfaStatusResponse,
            dtos::WebauthnStartAuthenticationResponse,
            dtos::CsrfResponse,
            dtos::SsoLogoutResponse,
            dtos::HealthResponse,
            models::UserResponse,
            models::SessionInfo,
            models::AuthEvent,
            models::WebAuthnCredentialResponse,
            models::SsoConfigResponse,
            models::SpEndpoints,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "auth", description = "Password login, token lifecycle, account credentials"),
        (name = "mfa", description = "TOTP enrollment and backup codes"),
        (name = "webauthn", description = "Passkey registration and login"),
        (name = "sso", description = "Per-firm SAML federation"),
        (name = "sessions", description = "Security-center session management"),
        (name = "health", description = "Service probes"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<IdentityConfig>,
    pub db: Database,
    pub challenges: Arc<dyn ChallengeStore>,
    pub tokens: TokenService,
    pub sessions: SessionService,
    pub mfa: MfaService,
    pub webauthn: WebauthnService,
    pub saml: SamlService,
    pub public_limiter: Arc<TierLimiter>,
    pub auth_limiter: Arc<TierLimiter>,
    pub sensitive_limiter: Arc<TierLimiter>,
}

impl AppState {
    /// Wire every service against the given database and challenge store.
    pub fn build(
        config: IdentityConfig,
        db: Database,
        challenges: Arc<dyn ChallengeStore>,
    ) -> Result<Self, AppError> {
        let tokens = TokenService::new(&config.jwt, db.clone(), challenges.clone())
            .map_err(AppError::ConfigError)?;
        let risk = crate::services::RiskEngine::new(config.risk.clone());
        let sessions = SessionService::new(db.clone(), risk);
        let cipher = SeedCipher::from_hex(&config.mfa.encryption_key_hex)
            .map_err(AppError::ConfigError)?;
        let mfa = MfaService::new(db.clone(), cipher, config.mfa.issuer.clone());
        let webauthn = WebauthnService::new(
            &config.webauthn.rp_id,
            &config.webauthn.rp_origin,
            &config.webauthn.rp_name,
            db.clone(),
            challenges.clone(),
        )
        .map_err(AppError::ConfigError)?;
        let saml = SamlService::new(&config.saml, db.clone(), challenges.clone())
            .map_err(AppError::ConfigError)?;

        let rl = &config.rate_limit;
        let public_limiter = TierLimiter::new(RateTier::Public, rl.public_limit, rl.public_window_seconds);
        let auth_limiter = TierLimiter::new(RateTier::Auth, rl.auth_limit, rl.auth_window_seconds);
        let sensitive_limiter = TierLimiter::new(
            RateTier::Sensitive,
            rl.sensitive_limit,
            rl.sensitive_window_seconds,
        );

        Ok(Self {
            config: Arc::new(config),
            db,
            challenges,
            tokens,
            sessions,
            mfa,
            webauthn,
            saml,
            public_limiter,
            auth_limiter,
            sensitive_limiter,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let public_limiter = state.public_limiter.clone();
    let auth_limiter = state.auth_limiter.clone();
    let sensitive_limiter = state.sensitive_limiter.clone();

    // Credential-presenting endpoints: the strictest anonymous tier.
    let credential_routes = Router::new()
        .route("/api/v2/auth/register", post(handlers::auth::register))
        .route("/api/v2/auth/login", post(handlers::auth::login))
        .route("/api/v2/auth/login/mfa", post(handlers::auth::login_mfa))
        .route("/api/v2/auth/refresh", post(handlers::auth::refresh))
        .route(
            "/api/v2/auth/webauthn/login/start",
            post(handlers::webauthn::start_authentication),
        )
        .route(
            "/api/v2/auth/webauthn/login/finish",
            post(handlers::webauthn::finish_authentication),
        )
        .layer(from_fn_with_state(
            auth_limiter.clone(),
            tier_rate_limit_middleware,
        ));

    // Anonymous sensitive operations.
    let anonymous_sensitive_routes = Router::new()
        .route(
            "/api/v2/auth/password/forgot",
            post(handlers::auth::forgot_password),
        )
        .route(
            "/api/v2/auth/password/reset",
            post(handlers::auth::reset_password),
        )
        .layer(from_fn_with_state(
            sensitive_limiter.clone(),
            tier_rate_limit_middleware,
        ));

    // Authenticated sensitive operations: bearer auth plus the tightest
    // budget.
    let authed_sensitive_routes = Router::new()
        .route(
            "/api/v2/auth/password/change",
            post(handlers::auth::change_password),
        )
        .route("/api/v2/auth/mfa/setup", post(handlers::mfa::setup))
        .route("/api/v2/auth/mfa/disable", post(handlers::mfa::disable))
        .route(
            "/api/v2/auth/mfa/backup-codes",
            post(handlers::mfa::regenerate_backup_codes),
        )
        .route(
            "/api/v2/auth/webauthn/register/start",
            post(handlers::webauthn::start_registration),
        )
        .route(
            "/api/v2/auth/webauthn/register/finish",
            post(handlers::webauthn::finish_registration),
        )
        .layer(from_fn_with_state(state.clone(), middleware::auth_middleware))
        .layer(from_fn_with_state(
            sensitive_limiter,
            tier_rate_limit_middleware,
        ));

    // The rest of the authenticated surface.
    let authed_routes = Router::new()
        .route("/api/v2/auth/logout", post(handlers::auth::logout))
        .route("/api/v2/auth/logout/all", post(handlers::auth::logout_all))
        .route("/api/v2/auth/csrf", get(handlers::auth::csrf))
        .route("/api/v2/auth/me", get(handlers::auth::me))
        .route("/api/v2/auth/events", get(handlers::auth::events))
        .route("/api/v2/auth/mfa", get(handlers::mfa::status))
        .route("/api/v2/auth/mfa/activate", post(handlers::mfa::activate))
        .route(
            "/api/v2/auth/webauthn/credentials",
            get(handlers::webauthn::list_credentials),
        )
        .route(
            "/api/v2/auth/webauthn/credentials/:credential_id",
            patch(handlers::webauthn::rename_credential)
                .delete(handlers::webauthn::delete_credential),
        )
        .route(
            "/api/v2/auth/sessions",
            get(handlers::session::list).delete(handlers::session::terminate_others),
        )
        .route(
            "/api/v2/auth/sessions/:session_id",
            delete(handlers::session::terminate),
        )
        .route(
            "/api/v2/auth/saml/logout/:firm_id",
            get(handlers::saml::logout),
        )
        .route(
            "/api/v2/auth/sso/:firm_id/config",
            get(handlers::saml::get_config).put(handlers::saml::put_config),
        )
        .route(
            "/api/v2/auth/sso/:firm_id/config/test",
            post(handlers::saml::test_config),
        )
        .layer(from_fn_with_state(state.clone(), middleware::auth_middleware))
        .layer(from_fn_with_state(
            public_limiter.clone(),
            tier_rate_limit_middleware,
        ));

    // Browser-facing federation endpoints and probes.
    let mut public_routes = Router::new()
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .route(
            "/api/v2/auth/saml/metadata/:firm_id",
            get(handlers::saml::metadata),
        )
        .route(
            "/api/v2/auth/saml/login/:firm_id",
            get(handlers::saml::login),
        )
        .route("/api/v2/auth/saml/acs/:firm_id", post(handlers::saml::acs))
        .route(
            "/api/v2/auth/saml/sls/:firm_id",
            get(handlers::saml::sls).post(handlers::saml::sls_post),
        );

    let swagger_enabled = match state.config.environment {
        Environment::Dev => true,
        Environment::Prod => state.config.swagger.enabled == SwaggerMode::Public,
    };
    if swagger_enabled {
        public_routes = public_routes
            .merge(SwaggerUi::new("/docs").url("/.well-known/openapi.json", ApiDoc::openapi()));
    }

    let public_routes = public_routes.layer(from_fn_with_state(
        public_limiter,
        tier_rate_limit_middleware,
    ));

    let cors = CorsLayer::new()
        .allow_origin(
            state
                .config
                .security
                .allowed_origins
                .iter()
                .filter_map(|o| match o.parse::<HeaderValue>() {
                    Ok(value) => Some(value),
                    Err(e) => {
                        tracing::error!(origin = %o, error = %e, "Invalid CORS origin, skipping");
                        None
                    }
                })
                .collect::<Vec<_>>(),
        )
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(handlers::CSRF_HEADER),
        ])
        .allow_credentials(true);

    Router::new()
        .merge(public_routes)
        .merge(credential_routes)
        .merge(anonymous_sensitive_routes)
        .merge(authed_sensitive_routes)
        .merge(authed_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(service_core::middleware::tracing::REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");
                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(cors)
}
