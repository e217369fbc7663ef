//! Per-firm SAML configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Known identity provider flavours. `Custom` accepts any SAML 2.0 IdP;
/// the named variants only drive UI hints and setup docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SsoProvider {
    Azure,
    Okta,
    Google,
    Custom,
}

impl SsoProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            SsoProvider::Azure => "azure",
            SsoProvider::Okta => "okta",
            SsoProvider::Google => "google",
            SsoProvider::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "azure" => Some(SsoProvider::Azure),
            "okta" => Some(SsoProvider::Okta),
            "google" => Some(SsoProvider::Google),
            "custom" => Some(SsoProvider::Custom),
            _ => None,
        }
    }
}

/// Firm-scoped SAML service-provider configuration, 1:1 with a firm.
#[derive(Debug, Clone, FromRow)]
pub struct SsoConfig {
    pub config_id: Uuid,
    pub firm_id: Uuid,
    pub provider_code: String,
    pub enabled: bool,
    pub idp_entity_id: String,
    pub idp_sso_url: String,
    pub idp_slo_url: Option<String>,
    /// PEM-encoded X.509 signing certificate of the IdP.
    pub idp_certificate_pem: String,
    /// Email domains allowed to authenticate through this firm's IdP.
    pub allowed_domains: Vec<String>,
    /// Role assigned to users provisioned on first SSO login.
    pub default_role_code: String,
    pub jit_provisioning: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl SsoConfig {
    pub fn provider(&self) -> SsoProvider {
        SsoProvider::parse(&self.provider_code).unwrap_or(SsoProvider::Custom)
    }

    /// Case-insensitive check of the address's domain part.
    pub fn domain_allowed(&self, email: &str) -> bool {
        let Some(domain) = email.rsplit('@').next().filter(|d| !d.is_empty()) else {
            return false;
        };
        if !email.contains('@') {
            return false;
        }
        self.allowed_domains
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(domain))
    }
}

/// Service-provider endpoints, derived from the firm id rather than stored.
/// Every firm gets its own entity id so IdP-side audience restrictions
/// cannot leak assertions across tenants.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SpEndpoints {
    pub entity_id: String,
    pub metadata_url: String,
    pub acs_url: String,
    pub sls_url: String,
}

impl SpEndpoints {
    pub fn for_firm(base_url: &str, firm_id: Uuid) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            entity_id: format!("{base}/api/v2/auth/saml/metadata/{firm_id}"),
            metadata_url: format!("{base}/api/v2/auth/saml/metadata/{firm_id}"),
            acs_url: format!("{base}/api/v2/auth/saml/acs/{firm_id}"),
            sls_url: format!("{base}/api/v2/auth/saml/sls/{firm_id}"),
        }
    }
}

/// Admin-facing view. The certificate itself is write-only; only its
/// presence is reported.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SsoConfigResponse {
    pub firm_id: Uuid,
    pub provider: String,
    pub enabled: bool,
    pub idp_entity_id: String,
    pub idp_sso_url: String,
    pub idp_slo_url: Option<String>,
    pub has_certificate: bool,
    pub allowed_domains: Vec<String>,
    pub default_role: String,
    pub jit_provisioning: bool,
    pub sp: SpEndpoints,
    pub updated_utc: DateTime<Utc>,
}

impl SsoConfigResponse {
    pub fn from_config(config: &SsoConfig, base_url: &str) -> Self {
        Self {
            firm_id: config.firm_id,
            provider: config.provider_code.clone(),
            enabled: config.enabled,
            idp_entity_id: config.idp_entity_id.clone(),
            idp_sso_url: config.idp_sso_url.clone(),
            idp_slo_url: config.idp_slo_url.clone(),
            has_certificate: !config.idp_certificate_pem.is_empty(),
            allowed_domains: config.allowed_domains.clone(),
            default_role: config.default_role_code.clone(),
            jit_provisioning: config.jit_provisioning,
            sp: SpEndpoints::for_firm(base_url, config.firm_id),
            updated_utc: config.updated_utc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SsoConfig {
        SsoConfig {
            config_id: Uuid::new_v4(),
            firm_id: Uuid::new_v4(),
            provider_code: "azure".to_string(),
            enabled: true,
            idp_entity_id: "https://sts.windows.net/tenant/".to_string(),
            idp_sso_url: "https://login.example.com/saml2".to_string(),
            idp_slo_url: None,
            idp_certificate_pem: "-----BEGIN CERTIFICATE-----".to_string(),
            allowed_domains: vec!["firm.example".to_string()],
            default_role_code: "lawyer".to_string(),
            jit_provisioning: true,
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        }
    }

    #[test]
    fn domain_check_is_case_insensitive() {
        let config = config();
        assert!(config.domain_allowed("nora@firm.example"));
        assert!(config.domain_allowed("nora@FIRM.EXAMPLE"));
        assert!(!config.domain_allowed("nora@other.example"));
        assert!(!config.domain_allowed("not-an-email"));
    }

    #[test]
    fn sp_endpoints_are_firm_scoped() {
        let firm_id = Uuid::new_v4();
        let sp = SpEndpoints::for_firm("https://api.example.com/", firm_id);
        assert_eq!(
            sp.acs_url,
            format!("https://api.example.com/api/v2/auth/saml/acs/{firm_id}")
        );
        assert_eq!(
            sp.sls_url,
            format!("https://api.example.com/api/v2/auth/saml/sls/{firm_id}")
        );
        assert_eq!(sp.entity_id, sp.metadata_url);
    }

    #[test]
    fn response_reports_certificate_presence_only() {
        let config = config();
        let resp = SsoConfigResponse::from_config(&config, "https://api.example.com");
        assert!(resp.has_certificate);
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("idp_certificate_pem").is_none());
    }
}
