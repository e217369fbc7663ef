//! XML-DSig verification for SAML messages.
//!
//! Supports the enveloped-signature profile IdPs use for POST-binding
//! responses, and the detached query-string signature of the redirect
//! binding.

use base64::{engine::general_purpose::STANDARD, Engine};
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::{Signer, Verifier};
use openssl::x509::X509;
use quick_xml::events::Event;
use quick_xml::Reader;

use super::c14n::canonicalize;
use crate::services::error::ServiceError;

/// Parse an X.509 certificate, accepting PEM with or without headers.
pub fn parse_certificate(pem: &str) -> Result<X509, ServiceError> {
    let pem_data = if pem.contains("-----BEGIN CERTIFICATE-----") {
        pem.to_string()
    } else {
        format!(
            "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----",
            pem.trim()
        )
    };
    X509::from_pem(pem_data.as_bytes())
        .map_err(|e| ServiceError::SamlInvalid(format!("Invalid IdP certificate: {e}")))
}

struct SignatureInfo {
    signed_info: String,
    signature_value: String,
    signature_method: String,
    reference_uri: String,
    digest_value: String,
}

fn digest_for_algorithm(algorithm: &str) -> Result<MessageDigest, ServiceError> {
    match algorithm {
        "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256" => Ok(MessageDigest::sha256()),
        "http://www.w3.org/2000/09/xmldsig#rsa-sha1" => Ok(MessageDigest::sha1()),
        "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384" => Ok(MessageDigest::sha384()),
        "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512" => Ok(MessageDigest::sha512()),
        other => Err(ServiceError::SamlInvalid(format!(
            "Unsupported signature algorithm: {other}"
        ))),
    }
}

/// Verify the enveloped signature of the element carrying `Signature`.
///
/// Both halves of the check run: the reference digest over the signed
/// element with the signature removed, and the RSA signature over the
/// canonicalized `SignedInfo`.
pub fn verify_enveloped_signature(xml: &str, cert_pem: &str) -> Result<(), ServiceError> {
    let cert = parse_certificate(cert_pem)?;
    let public_key = cert
        .public_key()
        .map_err(|e| ServiceError::SamlInvalid(format!("Invalid certificate key: {e}")))?;

    let sig = extract_signature_info(xml)?;
    verify_reference_digest(xml, &sig)?;

    let canonical_signed_info = canonicalize(&sig.signed_info)?;
    let signature_bytes = STANDARD
        .decode(sig.signature_value.replace(['\n', '\r', ' '], ""))
        .map_err(|e| ServiceError::SamlInvalid(format!("Bad signature encoding: {e}")))?;

    let digest = digest_for_algorithm(&sig.signature_method)?;
    let mut verifier = Verifier::new(digest, &public_key)
        .map_err(|e| ServiceError::SamlInvalid(format!("Verifier creation failed: {e}")))?;
    verifier
        .update(canonical_signed_info.as_bytes())
        .map_err(|e| ServiceError::SamlInvalid(format!("Signature update failed: {e}")))?;
    let valid = verifier
        .verify(&signature_bytes)
        .map_err(|e| ServiceError::SamlInvalid(format!("Signature verification failed: {e}")))?;
    if valid {
        Ok(())
    } else {
        Err(ServiceError::SamlInvalid("Signature mismatch".to_string()))
    }
}

/// Verify a redirect-binding signature. Per the SAML bindings spec the
/// signed octets are the still-URL-encoded query string in parameter
/// order: `SAML{Request,Response}`, optional `RelayState`, `SigAlg`.
pub fn verify_redirect_signature(
    parameter_name: &str,
    encoded_message: &str,
    relay_state: Option<&str>,
    sig_alg: &str,
    signature: &str,
    cert_pem: &str,
) -> Result<(), ServiceError> {
    let cert = parse_certificate(cert_pem)?;
    let public_key = cert
        .public_key()
        .map_err(|e| ServiceError::SamlInvalid(format!("Invalid certificate key: {e}")))?;

    let mut signed_data = format!("{parameter_name}={encoded_message}");
    if let Some(rs) = relay_state {
        if !rs.is_empty() {
            signed_data.push_str("&RelayState=");
            signed_data.push_str(rs);
        }
    }
    signed_data.push_str("&SigAlg=");
    signed_data.push_str(sig_alg);

    let decoded_alg = urlencoding::decode(sig_alg)
        .map_err(|e| ServiceError::SamlInvalid(format!("Bad SigAlg encoding: {e}")))?;
    let digest = digest_for_algorithm(decoded_alg.as_ref())?;

    let signature_bytes = STANDARD
        .decode(signature)
        .map_err(|e| ServiceError::SamlInvalid(format!("Bad signature encoding: {e}")))?;

    let mut verifier = Verifier::new(digest, &public_key)
        .map_err(|e| ServiceError::SamlInvalid(format!("Verifier creation failed: {e}")))?;
    verifier
        .update(signed_data.as_bytes())
        .map_err(|e| ServiceError::SamlInvalid(format!("Signature update failed: {e}")))?;
    let valid = verifier
        .verify(&signature_bytes)
        .map_err(|e| ServiceError::SamlInvalid(format!("Signature verification failed: {e}")))?;
    if valid {
        Ok(())
    } else {
        Err(ServiceError::SamlInvalid("Signature mismatch".to_string()))
    }
}

/// RSA-SHA256 signature URI used for outbound redirect-binding messages.
pub const RSA_SHA256_URI: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";

/// Sign the still-URL-encoded redirect-binding query octets with the SP
/// key. Returns the base64 `Signature` parameter value.
pub fn sign_redirect_message(
    private_key_pem: &str,
    signed_data: &str,
) -> Result<String, ServiceError> {
    let key = PKey::private_key_from_pem(private_key_pem.as_bytes())
        .map_err(|e| ServiceError::SamlInvalid(format!("Invalid SP signing key: {e}")))?;
    let mut signer = Signer::new(MessageDigest::sha256(), &key)
        .map_err(|e| ServiceError::SamlInvalid(format!("Signer creation failed: {e}")))?;
    signer
        .update(signed_data.as_bytes())
        .map_err(|e| ServiceError::SamlInvalid(format!("Signature update failed: {e}")))?;
    let signature = signer
        .sign_to_vec()
        .map_err(|e| ServiceError::SamlInvalid(format!("Signing failed: {e}")))?;
    Ok(STANDARD.encode(signature))
}

fn extract_signature_info(xml: &str) -> Result<SignatureInfo, ServiceError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut in_signed_info = false;
    let mut in_signature_value = false;
    let mut in_digest_value = false;
    let mut signed_info = String::new();
    let mut signature_value = String::new();
    let mut signature_method = String::new();
    let mut digest_value = String::new();
    let mut reference_uri = String::new();

    loop {
        match reader
            .read_event()
            .map_err(|e| ServiceError::SamlInvalid(format!("XML parse error: {e}")))?
        {
            Event::Start(e) => {
                let local = e.local_name();
                let name = std::str::from_utf8(local.as_ref()).unwrap_or("");
                if name == "SignedInfo" {
                    in_signed_info = true;
                }
                if in_signed_info {
                    let full = std::str::from_utf8(&e).unwrap_or("");
                    signed_info.push('<');
                    signed_info.push_str(full);
                    signed_info.push('>');
                }
                match name {
                    "SignatureValue" => in_signature_value = true,
                    "DigestValue" => in_digest_value = true,
                    _ => {}
                }
                if name == "Reference" || name == "SignatureMethod" {
                    for attr in e.attributes().flatten() {
                        let key = std::str::from_utf8(attr.key.as_ref()).unwrap_or("");
                        let value = attr.unescape_value().unwrap_or_default().to_string();
                        match (name, key) {
                            ("Reference", "URI") => reference_uri = value,
                            ("SignatureMethod", "Algorithm") => signature_method = value,
                            _ => {}
                        }
                    }
                }
            }
            Event::Empty(e) => {
                let local = e.local_name();
                let name = std::str::from_utf8(local.as_ref()).unwrap_or("");
                if in_signed_info {
                    let full = std::str::from_utf8(&e).unwrap_or("");
                    signed_info.push('<');
                    signed_info.push_str(full);
                    signed_info.push_str("/>");
                }
                if name == "Reference" || name == "SignatureMethod" {
                    for attr in e.attributes().flatten() {
                        let key = std::str::from_utf8(attr.key.as_ref()).unwrap_or("");
                        let value = attr.unescape_value().unwrap_or_default().to_string();
                        match (name, key) {
                            ("Reference", "URI") => reference_uri = value,
                            ("SignatureMethod", "Algorithm") => signature_method = value,
                            _ => {}
                        }
                    }
                }
            }
            Event::End(e) => {
                let local = e.local_name();
                let name = std::str::from_utf8(local.as_ref()).unwrap_or("");
                if in_signed_info {
                    let qname = e.name();
                    let full = std::str::from_utf8(qname.as_ref()).unwrap_or("");
                    signed_info.push_str("</");
                    signed_info.push_str(full);
                    signed_info.push('>');
                }
                match name {
                    "SignedInfo" => in_signed_info = false,
                    "SignatureValue" => in_signature_value = false,
                    "DigestValue" => in_digest_value = false,
                    _ => {}
                }
            }
            Event::Text(e) => {
                let text = e.unescape().unwrap_or_default();
                // DigestValue sits inside SignedInfo; its text belongs to
                // both captures.
                if in_digest_value {
                    digest_value.push_str(&text);
                }
                if in_signed_info {
                    signed_info.push_str(&text);
                } else if in_signature_value {
                    signature_value.push_str(&text);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if signed_info.is_empty() {
        return Err(ServiceError::SamlInvalid(
            "No SignedInfo element found".to_string(),
        ));
    }
    if signature_value.is_empty() {
        return Err(ServiceError::SamlInvalid(
            "No SignatureValue element found".to_string(),
        ));
    }
    if signature_method.is_empty() {
        signature_method =
            "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256".to_string();
    }

    Ok(SignatureInfo {
        signed_info,
        signature_value,
        signature_method,
        reference_uri,
        digest_value,
    })
}

fn verify_reference_digest(xml: &str, sig: &SignatureInfo) -> Result<(), ServiceError> {
    let element_id = sig.reference_uri.trim_start_matches('#');

    let signed_element = if element_id.is_empty() {
        xml.to_string()
    } else {
        extract_element_by_id(xml, element_id)?
    };

    let without_signature = remove_signature_element(&signed_element);
    let canonical = canonicalize(&without_signature)?;
    let digest = openssl::hash::hash(MessageDigest::sha256(), canonical.as_bytes())
        .map_err(|e| ServiceError::SamlInvalid(format!("Hash failed: {e}")))?;
    let computed = STANDARD.encode(digest);

    let expected = sig.digest_value.replace(['\n', '\r', ' '], "");
    if computed != expected {
        return Err(ServiceError::SamlInvalid("Digest mismatch".to_string()));
    }
    Ok(())
}

/// Extract the full element whose `ID` attribute matches, including its
/// closing tag.
fn extract_element_by_id(xml: &str, element_id: &str) -> Result<String, ServiceError> {
    let id_pattern = format!("ID=\"{element_id}\"");
    let id_pos = xml.find(&id_pattern).ok_or_else(|| {
        ServiceError::SamlInvalid(format!("Referenced element not found: {element_id}"))
    })?;
    let open_start = xml[..id_pos].rfind('<').unwrap_or(0);
    let tag_name = xml[open_start..]
        .trim_start_matches('<')
        .split([' ', '>', '\t', '\n'])
        .next()
        .unwrap_or("")
        .to_string();

    let close_tag = format!("</{tag_name}>");
    let close_pos = xml[open_start..]
        .find(&close_tag)
        .map(|p| open_start + p + close_tag.len())
        .ok_or_else(|| ServiceError::SamlInvalid("Cannot find element end".to_string()))?;
    Ok(xml[open_start..close_pos].to_string())
}

/// Enveloped-signature transform: drop the `Signature` element.
fn remove_signature_element(xml: &str) -> String {
    for (open, close) in [
        ("<ds:Signature", "</ds:Signature>"),
        ("<Signature", "</Signature>"),
    ] {
        if let (Some(start), Some(end)) = (xml.find(open), xml.find(close)) {
            let mut result = String::with_capacity(xml.len());
            result.push_str(&xml[..start]);
            result.push_str(&xml[end + close.len()..]);
            return result;
        }
    }
    xml.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_element_is_removed() {
        let xml = r#"<Assertion ID="a1"><ds:Signature>sig</ds:Signature><Subject>s</Subject></Assertion>"#;
        let out = remove_signature_element(xml);
        assert!(!out.contains("Signature"));
        assert!(out.contains("<Subject>s</Subject>"));
    }

    #[test]
    fn element_extraction_finds_boundaries() {
        let xml = r#"<Response><saml:Assertion ID="a1" Version="2.0"><Subject>x</Subject></saml:Assertion></Response>"#;
        let element = extract_element_by_id(xml, "a1").unwrap();
        assert!(element.starts_with("<saml:Assertion"));
        assert!(element.ends_with("</saml:Assertion>"));
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        assert!(digest_for_algorithm("http://example.com/md5").is_err());
        assert!(digest_for_algorithm("http://www.w3.org/2001/04/xmldsig-more#rsa-sha256").is_ok());
    }
}
