//! SAML message encoding and parsing.
//!
//! Hard size limits apply before any inflate or parse step so a hostile
//! IdP response cannot balloon in memory.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashMap;
use std::io::{Read, Write};

use crate::services::error::ServiceError;

/// Encoded message ceiling (base64 text).
pub const MAX_ENCODED_BYTES: usize = 128 * 1024;
/// Inflated XML ceiling, guarding against deflate bombs.
pub const MAX_XML_BYTES: u64 = 512 * 1024;

pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";

/// Decode a POST-binding message (plain base64).
pub fn decode_post_message(encoded: &str) -> Result<String, ServiceError> {
    if encoded.len() > MAX_ENCODED_BYTES {
        return Err(ServiceError::SamlInvalid("Message too large".to_string()));
    }
    let raw = STANDARD
        .decode(encoded.trim().replace(['\n', '\r'], ""))
        .map_err(|e| ServiceError::SamlInvalid(format!("Bad base64: {e}")))?;
    if raw.len() as u64 > MAX_XML_BYTES {
        return Err(ServiceError::SamlInvalid("Message too large".to_string()));
    }
    String::from_utf8(raw).map_err(|e| ServiceError::SamlInvalid(format!("Bad UTF-8: {e}")))
}

/// Decode a redirect-binding message (base64 of raw-deflated XML).
pub fn decode_redirect_message(encoded: &str) -> Result<String, ServiceError> {
    if encoded.len() > MAX_ENCODED_BYTES {
        return Err(ServiceError::SamlInvalid("Message too large".to_string()));
    }
    let raw = STANDARD
        .decode(encoded.trim().replace(['\n', '\r'], ""))
        .map_err(|e| ServiceError::SamlInvalid(format!("Bad base64: {e}")))?;
    let mut decoder = DeflateDecoder::new(raw.as_slice()).take(MAX_XML_BYTES + 1);
    let mut xml = String::new();
    decoder
        .read_to_string(&mut xml)
        .map_err(|e| ServiceError::SamlInvalid(format!("Bad deflate stream: {e}")))?;
    if xml.len() as u64 > MAX_XML_BYTES {
        return Err(ServiceError::SamlInvalid("Message too large".to_string()));
    }
    Ok(xml)
}

/// Deflate and base64 an outbound message for the redirect binding.
pub fn encode_redirect_message(xml: &str) -> Result<String, ServiceError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(xml.as_bytes())
        .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Deflate failed: {e}")))?;
    let compressed = encoder
        .finish()
        .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Deflate failed: {e}")))?;
    Ok(STANDARD.encode(compressed))
}

/// Fields pulled out of a `<samlp:Response>`.
#[derive(Debug, Default)]
pub struct ParsedResponse {
    pub response_id: String,
    pub status_code: String,
    pub issuer: String,
    pub in_response_to: Option<String>,
    pub destination: Option<String>,
    pub assertion: Option<ParsedAssertion>,
}

#[derive(Debug, Default)]
pub struct ParsedAssertion {
    pub name_id: String,
    pub session_index: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub audiences: Vec<String>,
    /// Attribute name to values, friendly names as the IdP sent them.
    pub attributes: HashMap<String, Vec<String>>,
}

impl ParsedAssertion {
    pub fn attribute(&self, names: &[&str]) -> Option<String> {
        for name in names {
            if let Some(values) = self
                .attributes
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name) || k.ends_with(name))
                .map(|(_, v)| v)
            {
                if let Some(first) = values.first() {
                    if !first.is_empty() {
                        return Some(first.clone());
                    }
                }
            }
        }
        None
    }
}

fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Event-driven parse of a SAML response document.
pub fn parse_response(xml: &str) -> Result<ParsedResponse, ServiceError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut response = ParsedResponse::default();
    let mut assertion = ParsedAssertion::default();
    let mut saw_assertion = false;

    let mut in_assertion = false;
    let mut in_status = false;
    let mut in_issuer = false;
    let mut in_name_id = false;
    let mut in_audience = false;
    let mut current_attribute: Option<String> = None;
    let mut in_attribute_value = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| ServiceError::SamlInvalid(format!("XML parse error: {e}")))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let local = e.local_name();
                let name = std::str::from_utf8(local.as_ref()).unwrap_or("");
                let empty = matches!(event, Event::Empty(_));
                match name {
                    "Response" => {
                        for attr in e.attributes().flatten() {
                            let key = std::str::from_utf8(attr.key.as_ref()).unwrap_or("");
                            let value = attr.unescape_value().unwrap_or_default().to_string();
                            match key {
                                "ID" => response.response_id = value,
                                "InResponseTo" => response.in_response_to = Some(value),
                                "Destination" => response.destination = Some(value),
                                _ => {}
                            }
                        }
                    }
                    "Assertion" => {
                        if saw_assertion || in_assertion {
                            // A second assertion is an attack surface, not a
                            // configuration we support.
                            return Err(ServiceError::SamlInvalid(
                                "Multiple assertions".to_string(),
                            ));
                        }
                        in_assertion = true;
                        saw_assertion = true;
                    }
                    "Status" => in_status = true,
                    "StatusCode" if in_status => {
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"Value" {
                                response.status_code =
                                    attr.unescape_value().unwrap_or_default().to_string();
                            }
                        }
                    }
                    "Issuer" if !in_assertion && !empty => in_issuer = true,
                    "NameID" if in_assertion && !empty => in_name_id = true,
                    "Conditions" if in_assertion => {
                        for attr in e.attributes().flatten() {
                            let key = std::str::from_utf8(attr.key.as_ref()).unwrap_or("");
                            let value = attr.unescape_value().unwrap_or_default();
                            match key {
                                "NotBefore" => assertion.not_before = parse_instant(&value),
                                "NotOnOrAfter" => {
                                    assertion.not_on_or_after = parse_instant(&value)
                                }
                                _ => {}
                            }
                        }
                    }
                    "Audience" if in_assertion && !empty => in_audience = true,
                    "AuthnStatement" if in_assertion => {
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"SessionIndex" {
                                assertion.session_index =
                                    Some(attr.unescape_value().unwrap_or_default().to_string());
                            }
                        }
                    }
                    "Attribute" if in_assertion => {
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"Name" {
                                current_attribute =
                                    Some(attr.unescape_value().unwrap_or_default().to_string());
                            }
                        }
                    }
                    "AttributeValue" if in_assertion && !empty => in_attribute_value = true,
                    _ => {}
                }
            }
            Event::End(e) => {
                let local = e.local_name();
                let name = std::str::from_utf8(local.as_ref()).unwrap_or("");
                match name {
                    "Assertion" => in_assertion = false,
                    "Status" => in_status = false,
                    "Issuer" => in_issuer = false,
                    "NameID" => in_name_id = false,
                    "Audience" => in_audience = false,
                    "Attribute" => current_attribute = None,
                    "AttributeValue" => in_attribute_value = false,
                    _ => {}
                }
            }
            Event::Text(e) => {
                let text = e.unescape().unwrap_or_default().to_string();
                if in_issuer {
                    response.issuer.push_str(&text);
                } else if in_name_id {
                    assertion.name_id.push_str(&text);
                } else if in_audience {
                    assertion.audiences.push(text);
                } else if in_attribute_value {
                    if let Some(attr_name) = &current_attribute {
                        assertion
                            .attributes
                            .entry(attr_name.clone())
                            .or_default()
                            .push(text);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if saw_assertion {
        response.assertion = Some(assertion);
    }
    Ok(response)
}

/// Fields pulled out of a `<samlp:LogoutRequest>` or `<samlp:LogoutResponse>`.
#[derive(Debug, Default)]
pub struct ParsedLogoutMessage {
    pub message_id: String,
    pub issuer: String,
    pub name_id: Option<String>,
    pub is_request: bool,
    /// An XML-DSig element is embedded; the caller must verify it.
    pub has_signature: bool,
}

pub fn parse_logout_message(xml: &str) -> Result<ParsedLogoutMessage, ServiceError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut message = ParsedLogoutMessage::default();
    let mut in_issuer = false;
    let mut in_name_id = false;

    loop {
        match reader
            .read_event()
            .map_err(|e| ServiceError::SamlInvalid(format!("XML parse error: {e}")))?
        {
            Event::Start(e) => {
                let local = e.local_name();
                let name = std::str::from_utf8(local.as_ref()).unwrap_or("");
                match name {
                    "LogoutRequest" | "LogoutResponse" => {
                        message.is_request = name == "LogoutRequest";
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"ID" {
                                message.message_id =
                                    attr.unescape_value().unwrap_or_default().to_string();
                            }
                        }
                    }
                    "Issuer" => in_issuer = true,
                    "NameID" => in_name_id = true,
                    "Signature" => message.has_signature = true,
                    _ => {}
                }
            }
            Event::End(e) => {
                let local = e.local_name();
                match std::str::from_utf8(local.as_ref()).unwrap_or("") {
                    "Issuer" => in_issuer = false,
                    "NameID" => in_name_id = false,
                    _ => {}
                }
            }
            Event::Text(e) => {
                let text = e.unescape().unwrap_or_default().to_string();
                if in_issuer {
                    message.issuer.push_str(&text);
                } else if in_name_id {
                    message.name_id = Some(text);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RESPONSE: &str = r#"<?xml version="1.0"?>
<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_resp1" InResponseTo="_req1" Destination="https://sp.example/acs">
  <saml:Issuer>https://idp.example/</saml:Issuer>
  <samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status>
  <saml:Assertion ID="_a1" Version="2.0">
    <saml:Issuer>https://idp.example/</saml:Issuer>
    <saml:Subject><saml:NameID>nora@firm.example</saml:NameID></saml:Subject>
    <saml:Conditions NotBefore="2026-08-24T10:00:00Z" NotOnOrAfter="2026-08-24T10:05:00Z">
      <saml:AudienceRestriction><saml:Audience>https://sp.example/metadata</saml:Audience></saml:AudienceRestriction>
    </saml:Conditions>
    <saml:AuthnStatement SessionIndex="_si_9"/>
    <saml:AttributeStatement>
      <saml:Attribute Name="http://schemas.xmlsoap.org/ws/2005/05/identity/claims/givenname">
        <saml:AttributeValue>Nora</saml:AttributeValue>
      </saml:Attribute>
      <saml:Attribute Name="surname">
        <saml:AttributeValue>Hassan</saml:AttributeValue>
      </saml:Attribute>
    </saml:AttributeStatement>
  </saml:Assertion>
</samlp:Response>"#;

    #[test]
    fn full_response_parses() {
        let parsed = parse_response(SAMPLE_RESPONSE).unwrap();
        assert_eq!(parsed.status_code, STATUS_SUCCESS);
        assert_eq!(parsed.issuer, "https://idp.example/");
        assert_eq!(parsed.in_response_to.as_deref(), Some("_req1"));
        let assertion = parsed.assertion.unwrap();
        assert_eq!(assertion.name_id, "nora@firm.example");
        assert_eq!(assertion.session_index.as_deref(), Some("_si_9"));
        assert_eq!(assertion.audiences, vec!["https://sp.example/metadata"]);
        assert!(assertion.not_before.is_some());
        assert_eq!(assertion.attribute(&["givenname"]).as_deref(), Some("Nora"));
        assert_eq!(assertion.attribute(&["surname"]).as_deref(), Some("Hassan"));
        assert_eq!(assertion.attribute(&["missing"]), None);
    }

    #[test]
    fn duplicate_assertions_are_rejected() {
        let xml = r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_r">
            <saml:Assertion ID="_a1"><saml:Subject><saml:NameID>a@x</saml:NameID></saml:Subject></saml:Assertion>
            <saml:Assertion ID="_a2"><saml:Subject><saml:NameID>b@x</saml:NameID></saml:Subject></saml:Assertion>
        </samlp:Response>"#;
        assert!(parse_response(xml).is_err());
    }

    #[test]
    fn redirect_encoding_round_trips() {
        let xml = "<samlp:AuthnRequest ID=\"_x\"/>";
        let encoded = encode_redirect_message(xml).unwrap();
        let decoded = decode_redirect_message(&encoded).unwrap();
        assert_eq!(decoded, xml);
    }

    #[test]
    fn oversized_message_is_rejected() {
        let huge = "A".repeat(MAX_ENCODED_BYTES + 1);
        assert!(decode_post_message(&huge).is_err());
        assert!(decode_redirect_message(&huge).is_err());
    }

    #[test]
    fn deflate_bomb_is_rejected() {
        // 8 MiB of zeros compresses to a few KiB but must not inflate.
        let zeros = vec![0u8; 8 * 1024 * 1024];
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(&zeros).unwrap();
        let bomb = STANDARD.encode(encoder.finish().unwrap());
        assert!(bomb.len() < MAX_ENCODED_BYTES);
        assert!(decode_redirect_message(&bomb).is_err());
    }

    #[test]
    fn logout_request_parses() {
        let xml = r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_lr1">
            <saml:Issuer>https://idp.example/</saml:Issuer>
            <saml:NameID>nora@firm.example</saml:NameID>
        </samlp:LogoutRequest>"#;
        let parsed = parse_logout_message(xml).unwrap();
        assert!(parsed.is_request);
        assert_eq!(parsed.message_id, "_lr1");
        assert_eq!(parsed.name_id.as_deref(), Some("nora@firm.example"));
        assert!(!parsed.has_signature);
    }

    #[test]
    fn embedded_logout_signature_is_noticed() {
        let xml = r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" xmlns:ds="http://www.w3.org/2000/09/xmldsig#" ID="_lr2">
            <saml:Issuer>https://idp.example/</saml:Issuer>
            <ds:Signature><ds:SignatureValue>abc</ds:SignatureValue></ds:Signature>
            <saml:NameID>nora@firm.example</saml:NameID>
        </samlp:LogoutRequest>"#;
        assert!(parse_logout_message(xml).unwrap().has_signature);
    }
}
