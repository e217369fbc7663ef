//! SAML federation gateway.
//!
//! Each law firm acts as its own service provider: entity id, ACS and SLS
//! endpoints all carry the firm id, and assertions are validated strictly
//! against that firm's stored IdP configuration.

pub mod c14n;
pub mod message;
pub mod xmldsig;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::challenge::{keys, ChallengeStore};
use super::database::Database;
use super::error::ServiceError;
use crate::config::SamlConfig;
use crate::models::{SpEndpoints, SsoConfig, User, UserRole};
use message::{ParsedAssertion, STATUS_SUCCESS};

const REQUEST_TTL_SECONDS: u64 = 600;

/// Result of a validated assertion: the resolved (possibly just created)
/// user plus what the client asked to return to.
#[derive(Debug)]
pub struct AcsOutcome {
    pub user: User,
    pub provisioned: bool,
    pub session_index: Option<String>,
}

/// Inbound SLS transport. Redirect carries a detached query signature,
/// POST an enveloped XML one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlsBinding {
    Redirect,
    Post,
}

#[derive(Clone)]
pub struct SamlService {
    db: Database,
    challenges: Arc<dyn ChallengeStore>,
    base_url: String,
    /// PEM RSA key that signs outbound redirect-binding messages.
    sp_signing_key_pem: Arc<str>,
    clock_skew: Duration,
    /// Per-firm config cache, invalidated on admin writes.
    configs: Arc<DashMap<Uuid, SsoConfig>>,
}

impl SamlService {
    pub fn new(
        config: &SamlConfig,
        db: Database,
        challenges: Arc<dyn ChallengeStore>,
    ) -> Result<Self, anyhow::Error> {
        let sp_signing_key_pem = std::fs::read_to_string(&config.sp_private_key_path)
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to read SP signing key from {}: {}",
                    config.sp_private_key_path,
                    e
                )
            })?;
        openssl::pkey::PKey::private_key_from_pem(sp_signing_key_pem.as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to parse SP signing key: {}", e))?;

        Ok(Self {
            db,
            challenges,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            sp_signing_key_pem: sp_signing_key_pem.into(),
            clock_skew: Duration::seconds(config.clock_skew_seconds),
            configs: Arc::new(DashMap::new()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn sp_endpoints(&self, firm_id: Uuid) -> SpEndpoints {
        SpEndpoints::for_firm(&self.base_url, firm_id)
    }

    /// Load the firm's config, requiring SSO to be enabled. A firm with no
    /// stored config at all is distinguished from one that turned SSO off.
    pub async fn enabled_config(&self, firm_id: Uuid) -> Result<SsoConfig, ServiceError> {
        if let Some(cached) = self.configs.get(&firm_id) {
            let config = cached.clone();
            if config.enabled {
                return Ok(config);
            }
            return Err(ServiceError::SsoNotEnabled);
        }
        let config = self
            .db
            .find_sso_config(firm_id)
            .await?
            .ok_or(ServiceError::SsoNotConfigured)?;
        self.configs.insert(firm_id, config.clone());
        if !config.enabled {
            return Err(ServiceError::SsoNotEnabled);
        }
        Ok(config)
    }

    /// Admin write path: persist and refresh the cache entry.
    pub async fn store_config(&self, config: &SsoConfig) -> Result<(), ServiceError> {
        // Reject unparseable certificates at write time, not at login time.
        xmldsig::parse_certificate(&config.idp_certificate_pem)?;
        self.db.upsert_sso_config(config).await?;
        self.configs.insert(config.firm_id, config.clone());
        Ok(())
    }

    pub async fn find_config(&self, firm_id: Uuid) -> Result<Option<SsoConfig>, ServiceError> {
        self.db.find_sso_config(firm_id).await
    }

    // ==================== Metadata ====================

    /// SP metadata document for IdP-side setup.
    pub fn metadata_xml(&self, firm_id: Uuid) -> String {
        let sp = self.sp_endpoints(firm_id);
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{entity_id}">
  <md:SPSSODescriptor AuthnRequestsSigned="true" WantAssertionsSigned="true" protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
    <md:NameIDFormat>urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress</md:NameIDFormat>
    <md:AssertionConsumerService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="{acs_url}" index="0" isDefault="true"/>
    <md:SingleLogoutService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="{sls_url}"/>
    <md:SingleLogoutService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="{sls_url}"/>
  </md:SPSSODescriptor>
</md:EntityDescriptor>"#,
            entity_id = sp.entity_id,
            acs_url = sp.acs_url,
            sls_url = sp.sls_url,
        )
    }

    // ==================== Login ====================

    /// Build the IdP redirect that starts an SP-initiated login. The
    /// request id is parked in the challenge store so the ACS can match
    /// `InResponseTo` exactly once.
    pub async fn begin_login(
        &self,
        firm_id: Uuid,
        relay_state: Option<&str>,
    ) -> Result<String, ServiceError> {
        let config = self.enabled_config(firm_id).await?;
        let sp = self.sp_endpoints(firm_id);

        let request_id = format!("_{}", Uuid::new_v4().simple());
        let issue_instant = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        let authn_request = format!(
            r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{request_id}" Version="2.0" IssueInstant="{issue_instant}" Destination="{destination}" AssertionConsumerServiceURL="{acs_url}" ProtocolBinding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST"><saml:Issuer>{issuer}</saml:Issuer><samlp:NameIDPolicy Format="urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress" AllowCreate="true"/></samlp:AuthnRequest>"#,
            destination = config.idp_sso_url,
            acs_url = sp.acs_url,
            issuer = sp.entity_id,
        );

        self.challenges
            .put(
                &keys::saml_request(&request_id),
                &firm_id.to_string(),
                REQUEST_TTL_SECONDS,
            )
            .await?;

        self.signed_redirect_url(&config.idp_sso_url, &authn_request, relay_state)
    }

    /// Deflate, encode and sign an outbound redirect-binding message. The
    /// signature covers the URL-encoded `SAMLRequest[&RelayState]&SigAlg`
    /// octets exactly as they appear in the final query string.
    fn signed_redirect_url(
        &self,
        endpoint: &str,
        xml: &str,
        relay_state: Option<&str>,
    ) -> Result<String, ServiceError> {
        let encoded = message::encode_redirect_message(xml)?;
        let mut query = format!("SAMLRequest={}", urlencoding::encode(&encoded));
        if let Some(rs) = relay_state.filter(|rs| !rs.is_empty()) {
            query.push_str("&RelayState=");
            query.push_str(&urlencoding::encode(rs));
        }
        query.push_str("&SigAlg=");
        query.push_str(&urlencoding::encode(xmldsig::RSA_SHA256_URI));
        let signature = xmldsig::sign_redirect_message(&self.sp_signing_key_pem, &query)?;
        query.push_str("&Signature=");
        query.push_str(&urlencoding::encode(&signature));

        Ok(format!(
            "{}{}{}",
            endpoint,
            if endpoint.contains('?') { "&" } else { "?" },
            query
        ))
    }

    // ==================== Assertion Consumer ====================

    /// Validate a POST-binding response and resolve it to a user.
    ///
    /// Checks, in order: size and shape, status, issuer, enveloped
    /// signature, `InResponseTo` against a stored request id (consumed on
    /// use, so unsolicited and replayed responses both fail), time window
    /// with bounded clock skew, audience, and finally the email domain
    /// policy.
    pub async fn complete_acs(
        &self,
        firm_id: Uuid,
        encoded_response: &str,
    ) -> Result<AcsOutcome, ServiceError> {
        let config = self.enabled_config(firm_id).await?;
        let sp = self.sp_endpoints(firm_id);

        let xml = message::decode_post_message(encoded_response)?;
        let parsed = message::parse_response(&xml)?;

        if parsed.status_code != STATUS_SUCCESS {
            return Err(ServiceError::SamlInvalid(format!(
                "IdP reported failure: {}",
                parsed.status_code
            )));
        }
        if parsed.issuer != config.idp_entity_id {
            return Err(ServiceError::SamlInvalid("Unexpected issuer".to_string()));
        }

        xmldsig::verify_enveloped_signature(&xml, &config.idp_certificate_pem)?;

        let in_response_to = parsed
            .in_response_to
            .as_deref()
            .ok_or_else(|| ServiceError::SamlInvalid("Unsolicited response".to_string()))?;
        let stored_firm = self
            .challenges
            .take(&keys::saml_request(in_response_to))
            .await?
            .ok_or_else(|| ServiceError::SamlInvalid("Unknown request id".to_string()))?;
        if stored_firm != firm_id.to_string() {
            return Err(ServiceError::SamlInvalid(
                "Request belongs to another firm".to_string(),
            ));
        }

        let assertion = parsed
            .assertion
            .ok_or_else(|| ServiceError::SamlInvalid("No assertion".to_string()))?;
        self.check_conditions(&assertion, &sp)?;

        let email = assertion.name_id.trim().to_lowercase();
        if email.is_empty() {
            return Err(ServiceError::SamlInvalid("Empty NameID".to_string()));
        }
        if !config.domain_allowed(&email) {
            return Err(ServiceError::SsoDomainNotAllowed);
        }

        self.resolve_user(&config, &email, &assertion).await
    }

    fn check_conditions(
        &self,
        assertion: &ParsedAssertion,
        sp: &SpEndpoints,
    ) -> Result<(), ServiceError> {
        let now = Utc::now();
        if let Some(not_before) = assertion.not_before {
            if now + self.clock_skew < not_before {
                return Err(ServiceError::SamlInvalid(
                    "Assertion not yet valid".to_string(),
                ));
            }
        }
        if let Some(not_on_or_after) = assertion.not_on_or_after {
            if now - self.clock_skew >= not_on_or_after {
                return Err(ServiceError::SamlInvalid("Assertion expired".to_string()));
            }
        }
        if !assertion.audiences.is_empty()
            && !assertion.audiences.iter().any(|a| a == &sp.entity_id)
        {
            return Err(ServiceError::SamlInvalid(
                "Audience restriction mismatch".to_string(),
            ));
        }
        Ok(())
    }

    async fn resolve_user(
        &self,
        config: &SsoConfig,
        email: &str,
        assertion: &ParsedAssertion,
    ) -> Result<AcsOutcome, ServiceError> {
        let given_name = assertion.attribute(&["givenname", "given_name", "firstName"]);
        let surname = assertion.attribute(&["surname", "lastname", "lastName"]);

        if let Some(user) = self.db.find_user_by_email(email).await? {
            if !user.is_active() {
                return Err(ServiceError::AccountDisabled);
            }
            if user.firm_id != Some(config.firm_id) {
                return Err(ServiceError::SamlInvalid(
                    "Account belongs to another firm".to_string(),
                ));
            }
            self.db
                .update_user_profile_from_idp(
                    user.user_id,
                    given_name.as_deref(),
                    surname.as_deref(),
                )
                .await?;
            return Ok(AcsOutcome {
                user,
                provisioned: false,
                session_index: assertion.session_index.clone(),
            });
        }

        if !config.jit_provisioning {
            return Err(ServiceError::SsoProvisioningDisabled);
        }
        let role = UserRole::parse(&config.default_role_code).unwrap_or(UserRole::Lawyer);
        let user = User::provisioned(
            email.to_string(),
            config.firm_id,
            given_name,
            surname,
            role,
        );
        self.db.insert_user(&user).await?;
        tracing::info!(user_id = %user.user_id, firm_id = %config.firm_id, "Provisioned user from IdP assertion");
        Ok(AcsOutcome {
            user,
            provisioned: true,
            session_index: assertion.session_index.clone(),
        })
    }

    // ==================== Logout ====================

    /// Build the IdP redirect for SP-initiated single logout. Firms whose
    /// IdP has no SLO endpoint fall back to local logout only.
    pub async fn begin_logout(
        &self,
        firm_id: Uuid,
        name_id: &str,
        session_index: Option<&str>,
    ) -> Result<Option<String>, ServiceError> {
        let config = self.enabled_config(firm_id).await?;
        let Some(slo_url) = config.idp_slo_url.as_deref() else {
            return Ok(None);
        };
        let sp = self.sp_endpoints(firm_id);

        let request_id = format!("_{}", Uuid::new_v4().simple());
        let issue_instant = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        let session_index_xml = session_index
            .map(|si| format!("<samlp:SessionIndex>{si}</samlp:SessionIndex>"))
            .unwrap_or_default();
        let logout_request = format!(
            r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{request_id}" Version="2.0" IssueInstant="{issue_instant}" Destination="{slo_url}"><saml:Issuer>{issuer}</saml:Issuer><saml:NameID>{name_id}</saml:NameID>{session_index_xml}</samlp:LogoutRequest>"#,
            issuer = sp.entity_id,
        );

        self.signed_redirect_url(slo_url, &logout_request, None)
            .map(Some)
    }

    /// Handle an inbound SLS message. A redirect-binding signature covers
    /// the raw query octets; a POST-binding one is enveloped in the XML.
    /// Either way a present signature must verify. The resolved email (for
    /// LogoutRequest) is returned so the caller can terminate local
    /// sessions.
    #[allow(clippy::too_many_arguments)]
    pub async fn handle_sls(
        &self,
        firm_id: Uuid,
        binding: SlsBinding,
        encoded_message: &str,
        raw_query_message: &str,
        relay_state: Option<&str>,
        sig_alg: Option<&str>,
        signature: Option<&str>,
    ) -> Result<Option<String>, ServiceError> {
        let config = self.enabled_config(firm_id).await?;
        let xml = match binding {
            SlsBinding::Redirect => message::decode_redirect_message(encoded_message)?,
            SlsBinding::Post => message::decode_post_message(encoded_message)?,
        };
        let parsed = message::parse_logout_message(&xml)?;

        if parsed.issuer != config.idp_entity_id {
            return Err(ServiceError::SamlInvalid("Unexpected issuer".to_string()));
        }
        match binding {
            SlsBinding::Redirect => {
                if let (Some(sig_alg), Some(signature)) = (sig_alg, signature) {
                    let parameter = if parsed.is_request {
                        "SAMLRequest"
                    } else {
                        "SAMLResponse"
                    };
                    xmldsig::verify_redirect_signature(
                        parameter,
                        raw_query_message,
                        relay_state,
                        sig_alg,
                        signature,
                        &config.idp_certificate_pem,
                    )?;
                }
            }
            SlsBinding::Post => {
                if parsed.has_signature {
                    xmldsig::verify_enveloped_signature(&xml, &config.idp_certificate_pem)?;
                }
            }
        }

        if parsed.is_request {
            Ok(parsed.name_id.map(|n| n.trim().to_lowercase()))
        } else {
            Ok(None)
        }
    }
}
