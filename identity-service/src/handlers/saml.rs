//! Per-firm SAML federation endpoints: SP metadata, login, assertion
//! consumer, single logout and the admin configuration surface.

use axum::{
    extract::{Path, Query, RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    Form, Json,
};
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use service_core::error::AppError;

use crate::dtos::{
    AcsForm, MessageResponse, SlsForm, SlsQuery, SsoConfigRequest, SsoConfigTestRequest,
    SsoConfigTestResponse, SsoLoginQuery, SsoLogoutResponse,
};
use crate::middleware::AuthUser;
use crate::models::{
    default_permissions, AuthEventType, SsoConfig, SsoConfigResponse, SsoProvider, UserRole,
};
use crate::services::{ServiceError, SlsBinding};
use crate::utils::context::{client_ip, fingerprint_from_user_agent, geo_from_headers};
use crate::AppState;

use super::{audit, audit_event, refresh_cookie};

/// Only a safe relative path survives as a post-login redirect target;
/// anything else collapses to the app root.
fn safe_relay_target(relay_state: Option<&str>) -> String {
    match relay_state {
        Some(path) if path.starts_with('/') && !path.starts_with("//") => path.to_string(),
        _ => "/".to_string(),
    }
}

/// Value of a query parameter exactly as it appeared on the wire, still
/// URL-encoded. The redirect-binding signature covers these raw octets.
fn raw_query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then_some(value)
    })
}

fn require_firm_admin(auth: &AuthUser, firm_id: Uuid) -> Result<(), ServiceError> {
    if auth.user.role() == UserRole::Lawyer && auth.user.firm_id == Some(firm_id) {
        Ok(())
    } else {
        Err(ServiceError::AdminRequired)
    }
}

#[utoipa::path(
    get,
    path = "/api/v2/auth/saml/metadata/{firm_id}",
    params(("firm_id" = Uuid, Path, description = "Firm whose SP metadata to serve")),
    responses((status = 200, description = "SP metadata document", content_type = "application/samlmetadata+xml")),
    tag = "sso"
)]
pub async fn metadata(
    State(state): State<AppState>,
    Path(firm_id): Path<Uuid>,
) -> impl IntoResponse {
    let xml = state.saml.metadata_xml(firm_id);
    (
        [(header::CONTENT_TYPE, "application/samlmetadata+xml")],
        xml,
    )
}

#[utoipa::path(
    get,
    path = "/api/v2/auth/saml/login/{firm_id}",
    params(
        ("firm_id" = Uuid, Path, description = "Firm to authenticate against"),
        ("RelayState" = Option<String>, Query, description = "Path to return to after login"),
    ),
    responses(
        (status = 307, description = "Redirect to the firm's IdP"),
        (status = 400, description = "SSO is disabled for this firm"),
        (status = 404, description = "SSO was never configured for this firm"),
    ),
    tag = "sso"
)]
pub async fn login(
    State(state): State<AppState>,
    Path(firm_id): Path<Uuid>,
    Query(query): Query<SsoLoginQuery>,
) -> Result<Redirect, AppError> {
    let url = state
        .saml
        .begin_login(firm_id, query.relay_state.as_deref())
        .await?;
    Ok(Redirect::temporary(&url))
}

#[utoipa::path(
    post,
    path = "/api/v2/auth/saml/acs/{firm_id}",
    params(("firm_id" = Uuid, Path, description = "Firm the assertion belongs to")),
    responses(
        (status = 303, description = "Session established; redirect into the app"),
        (status = 400, description = "Assertion rejected"),
    ),
    tag = "sso"
)]
pub async fn acs(
    State(state): State<AppState>,
    Path(firm_id): Path<Uuid>,
    headers: HeaderMap,
    jar: CookieJar,
    Form(form): Form<AcsForm>,
) -> Result<Response, AppError> {
    let outcome = state.saml.complete_acs(firm_id, &form.saml_response).await?;

    if outcome.provisioned {
        audit(
            &state,
            audit_event(AuthEventType::SsoUserProvisioned, &headers)
                .user(outcome.user.user_id)
                .detail(json!({ "firm_id": firm_id })),
        );
    }

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let session = state
        .sessions
        .create(
            outcome.user.user_id,
            client_ip(&headers),
            user_agent.clone(),
            fingerprint_from_user_agent(&user_agent),
            geo_from_headers(&headers),
            false,
        )
        .await?;
    let permissions = default_permissions(outcome.user.role(), outcome.user.is_solo_lawyer);
    let issued = state
        .tokens
        .issue_for_session(&outcome.user, &session, permissions)
        .await?;
    audit(
        &state,
        audit_event(AuthEventType::SsoLogin, &headers)
            .user(outcome.user.user_id)
            .session(session.session_id)
            .detail(json!({
                "firm_id": firm_id,
                "session_index": outcome.session_index,
            })),
    );

    // The browser arrives here on a cross-site POST from the IdP. The
    // refresh cookie goes down with the redirect; the frontend then calls
    // /refresh to obtain an access token.
    let jar = jar.add(refresh_cookie(&state, &issued));
    let target = safe_relay_target(form.relay_state.as_deref());
    Ok((jar, Redirect::to(&target)).into_response())
}

/// IdP-initiated logout: terminate every local session of the named
/// account, provided it actually belongs to this firm.
async fn terminate_for_idp_logout(
    state: &AppState,
    firm_id: Uuid,
    headers: &HeaderMap,
    email: Option<String>,
) -> Result<(), AppError> {
    let Some(email) = email else { return Ok(()) };
    if let Some(user) = state.db.find_user_by_email(&email).await? {
        if user.firm_id == Some(firm_id) {
            let revoked = state.tokens.revoke_user_sessions(user.user_id, None).await?;
            audit(
                state,
                audit_event(AuthEventType::Logout, headers)
                    .user(user.user_id)
                    .detail(json!({ "via": "saml_sls", "revoked": revoked })),
            );
        }
    }
    Ok(())
}

#[utoipa::path(
    get,
    path = "/api/v2/auth/saml/sls/{firm_id}",
    params(("firm_id" = Uuid, Path, description = "Firm the logout message belongs to")),
    responses(
        (status = 200, description = "Logout processed", body = MessageResponse),
        (status = 400, description = "Malformed or badly signed message"),
    ),
    tag = "sso"
)]
pub async fn sls(
    State(state): State<AppState>,
    Path(firm_id): Path<Uuid>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    Query(query): Query<SlsQuery>,
) -> Result<impl IntoResponse, AppError> {
    let raw_query = raw_query.unwrap_or_default();
    let (encoded, raw_encoded) = if let Some(request) = query.saml_request.as_deref() {
        (
            request,
            raw_query_param(&raw_query, "SAMLRequest").unwrap_or_default(),
        )
    } else if let Some(response) = query.saml_response.as_deref() {
        (
            response,
            raw_query_param(&raw_query, "SAMLResponse").unwrap_or_default(),
        )
    } else {
        return Err(
            ServiceError::SamlInvalid("Neither SAMLRequest nor SAMLResponse".to_string()).into(),
        );
    };

    let logged_out_email = state
        .saml
        .handle_sls(
            firm_id,
            SlsBinding::Redirect,
            encoded,
            raw_encoded,
            raw_query_param(&raw_query, "RelayState"),
            raw_query_param(&raw_query, "SigAlg"),
            query.signature.as_deref(),
        )
        .await?;
    terminate_for_idp_logout(&state, firm_id, &headers, logged_out_email).await?;

    Ok(Json(MessageResponse::new(
        "تم تسجيل الخروج",
        "Logout processed",
    )))
}

#[utoipa::path(
    post,
    path = "/api/v2/auth/saml/sls/{firm_id}",
    params(("firm_id" = Uuid, Path, description = "Firm the logout message belongs to")),
    request_body(content = SlsForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Logout processed", body = MessageResponse),
        (status = 400, description = "Malformed or badly signed message"),
    ),
    tag = "sso"
)]
pub async fn sls_post(
    State(state): State<AppState>,
    Path(firm_id): Path<Uuid>,
    headers: HeaderMap,
    Form(form): Form<SlsForm>,
) -> Result<impl IntoResponse, AppError> {
    let encoded = form
        .saml_request
        .as_deref()
        .or(form.saml_response.as_deref())
        .ok_or_else(|| {
            ServiceError::SamlInvalid("Neither SAMLRequest nor SAMLResponse".to_string())
        })?;

    let logged_out_email = state
        .saml
        .handle_sls(firm_id, SlsBinding::Post, encoded, "", None, None, None)
        .await?;
    terminate_for_idp_logout(&state, firm_id, &headers, logged_out_email).await?;

    Ok(Json(MessageResponse::new(
        "تم تسجيل الخروج",
        "Logout processed",
    )))
}

#[utoipa::path(
    get,
    path = "/api/v2/auth/saml/logout/{firm_id}",
    params(("firm_id" = Uuid, Path, description = "Firm whose IdP to log out from")),
    responses(
        (status = 200, description = "Local session ended; IdP logout URL when the IdP supports SLO", body = SsoLogoutResponse),
    ),
    security(("bearer" = [])),
    tag = "sso"
)]
pub async fn logout(
    State(state): State<AppState>,
    Path(firm_id): Path<Uuid>,
    headers: HeaderMap,
    auth: AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let redirect = state
        .saml
        .begin_logout(firm_id, &auth.user.email, None)
        .await?;
    state.tokens.revoke_session(auth.session.session_id).await?;
    audit(
        &state,
        audit_event(AuthEventType::Logout, &headers)
            .user(auth.user.user_id)
            .session(auth.session.session_id)
            .detail(json!({ "via": "sp_initiated_slo" })),
    );
    Ok(Json(SsoLogoutResponse {
        success: true,
        idp_logout_url: redirect,
    }))
}

#[utoipa::path(
    get,
    path = "/api/v2/auth/sso/{firm_id}/config",
    params(("firm_id" = Uuid, Path, description = "Firm whose SSO config to read")),
    responses(
        (status = 200, description = "Current configuration", body = SsoConfigResponse),
        (status = 403, description = "Caller does not administer this firm"),
        (status = 404, description = "No configuration stored"),
    ),
    security(("bearer" = [])),
    tag = "sso"
)]
pub async fn get_config(
    State(state): State<AppState>,
    Path(firm_id): Path<Uuid>,
    auth: AuthUser,
) -> Result<Json<SsoConfigResponse>, AppError> {
    require_firm_admin(&auth, firm_id)?;
    let config = state
        .saml
        .find_config(firm_id)
        .await?
        .ok_or(ServiceError::SsoNotConfigured)?;
    Ok(Json(SsoConfigResponse::from_config(
        &config,
        state.saml.base_url(),
    )))
}

#[utoipa::path(
    put,
    path = "/api/v2/auth/sso/{firm_id}/config",
    params(("firm_id" = Uuid, Path, description = "Firm whose SSO config to replace")),
    request_body = SsoConfigRequest,
    responses(
        (status = 200, description = "Configuration stored", body = SsoConfigResponse),
        (status = 400, description = "Rejected: bad certificate or unknown provider"),
        (status = 403, description = "Caller does not administer this firm"),
    ),
    security(("bearer" = [])),
    tag = "sso"
)]
pub async fn put_config(
    State(state): State<AppState>,
    Path(firm_id): Path<Uuid>,
    headers: HeaderMap,
    auth: AuthUser,
    Json(payload): Json<SsoConfigRequest>,
) -> Result<(StatusCode, Json<SsoConfigResponse>), AppError> {
    require_firm_admin(&auth, firm_id)?;
    payload.validate()?;

    let provider = SsoProvider::parse(&payload.provider)
        .ok_or_else(|| ServiceError::Validation("Unknown SSO provider".to_string()))?;
    let default_role = UserRole::parse(&payload.default_role)
        .ok_or_else(|| ServiceError::Validation("Unknown default role".to_string()))?;

    let now = Utc::now();
    let config = SsoConfig {
        config_id: Uuid::new_v4(),
        firm_id,
        provider_code: provider.as_str().to_string(),
        enabled: payload.enabled,
        idp_entity_id: payload.idp_entity_id,
        idp_sso_url: payload.idp_sso_url,
        idp_slo_url: payload.idp_slo_url.filter(|u| !u.is_empty()),
        idp_certificate_pem: payload.idp_certificate_pem,
        allowed_domains: payload
            .allowed_domains
            .into_iter()
            .map(|d| d.trim().to_lowercase())
            .filter(|d| !d.is_empty())
            .collect(),
        default_role_code: default_role.as_str().to_string(),
        jit_provisioning: payload.jit_provisioning,
        created_utc: now,
        updated_utc: now,
    };
    state.saml.store_config(&config).await?;
    audit(
        &state,
        audit_event(AuthEventType::SsoConfigChanged, &headers)
            .user(auth.user.user_id)
            .session(auth.session.session_id)
            .detail(json!({ "firm_id": firm_id, "enabled": config.enabled })),
    );
    Ok((
        StatusCode::OK,
        Json(SsoConfigResponse::from_config(&config, state.saml.base_url())),
    ))
}

/// Offline checks of a candidate configuration, collected rather than
/// short-circuited so the admin sees every problem at once.
fn dry_validate(payload: &SsoConfigTestRequest) -> Vec<String> {
    let mut errors = Vec::new();
    if SsoProvider::parse(&payload.provider).is_none() {
        errors.push(format!("Unknown provider \"{}\"", payload.provider));
    }
    if UserRole::parse(&payload.default_role).is_none() {
        errors.push(format!("Unknown default role \"{}\"", payload.default_role));
    }
    if payload.idp_entity_id.trim().is_empty() {
        errors.push("IdP entity id is empty".to_string());
    }
    if !payload.idp_sso_url.starts_with("https://") {
        errors.push("IdP SSO URL must be an https:// URL".to_string());
    }
    if let Some(slo) = payload.idp_slo_url.as_deref().filter(|u| !u.is_empty()) {
        if !slo.starts_with("https://") {
            errors.push("IdP SLO URL must be an https:// URL".to_string());
        }
    }
    if let Err(e) = crate::services::saml::xmldsig::parse_certificate(&payload.idp_certificate_pem)
    {
        errors.push(format!("IdP certificate rejected: {e}"));
    }
    if payload.allowed_domains.iter().all(|d| d.trim().is_empty()) {
        errors.push("At least one allowed email domain is required".to_string());
    }
    errors
}

/// Reachability probe with a short timeout. A slow or erroring IdP counts
/// as a failure, never as a pass.
async fn probe_metadata_url(url: &str) -> Result<(), String> {
    if !url.starts_with("https://") {
        return Err("must be an https:// URL".to_string());
    }
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()
        .map_err(|e| e.to_string())?;
    let response = client.get(url).send().await.map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("HTTP {}", response.status()));
    }
    Ok(())
}

#[utoipa::path(
    post,
    path = "/api/v2/auth/sso/{firm_id}/config/test",
    params(("firm_id" = Uuid, Path, description = "Firm the candidate configuration is for")),
    request_body = SsoConfigTestRequest,
    responses(
        (status = 200, description = "Validation findings; nothing is stored", body = SsoConfigTestResponse),
        (status = 403, description = "Caller does not administer this firm"),
    ),
    security(("bearer" = [])),
    tag = "sso"
)]
pub async fn test_config(
    State(_state): State<AppState>,
    Path(firm_id): Path<Uuid>,
    auth: AuthUser,
    Json(payload): Json<SsoConfigTestRequest>,
) -> Result<Json<SsoConfigTestResponse>, AppError> {
    require_firm_admin(&auth, firm_id)?;

    let mut errors = dry_validate(&payload);
    if let Some(url) = payload.metadata_url.as_deref().filter(|u| !u.is_empty()) {
        if let Err(e) = probe_metadata_url(url).await {
            errors.push(format!("Metadata URL unreachable: {e}"));
        }
    }

    Ok(Json(SsoConfigTestResponse {
        valid: errors.is_empty(),
        errors,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_targets_are_constrained_to_relative_paths() {
        assert_eq!(safe_relay_target(Some("/cases/42")), "/cases/42");
        assert_eq!(safe_relay_target(Some("https://evil.example")), "/");
        assert_eq!(safe_relay_target(Some("//evil.example")), "/");
        assert_eq!(safe_relay_target(None), "/");
    }

    #[test]
    fn dry_validation_collects_every_problem() {
        let payload = SsoConfigTestRequest {
            provider: "pingfederate".to_string(),
            idp_entity_id: "  ".to_string(),
            idp_sso_url: "http://idp.example.com/sso".to_string(),
            idp_slo_url: None,
            idp_certificate_pem: "not a certificate".to_string(),
            allowed_domains: vec![],
            default_role: "client".to_string(),
            metadata_url: None,
        };
        let errors = dry_validate(&payload);
        assert!(errors.iter().any(|e| e.contains("Unknown provider")));
        assert!(errors.iter().any(|e| e.contains("entity id")));
        assert!(errors.iter().any(|e| e.contains("SSO URL")));
        assert!(errors.iter().any(|e| e.contains("certificate")));
        assert!(errors.iter().any(|e| e.contains("allowed email domain")));
    }

    #[test]
    fn raw_query_params_stay_encoded() {
        let query = "SAMLRequest=abc%2B%2F&RelayState=%2Fapp&SigAlg=alg";
        assert_eq!(raw_query_param(query, "SAMLRequest"), Some("abc%2B%2F"));
        assert_eq!(raw_query_param(query, "RelayState"), Some("%2Fapp"));
        assert_eq!(raw_query_param(query, "Missing"), None);
    }
}
