//! End-to-end XML-DSig checks against a locally generated IdP certificate.

use base64::{engine::general_purpose::STANDARD, Engine};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::sign::Signer;
use openssl::x509::{X509NameBuilder, X509};

use identity_service::services::saml::c14n::canonicalize;
use identity_service::services::saml::xmldsig::{
    sign_redirect_message, verify_enveloped_signature, verify_redirect_signature, RSA_SHA256_URI,
};

/// Self-signed certificate standing in for a firm's IdP.
fn idp_identity() -> (PKey<Private>, String) {
    let rsa = Rsa::generate(2048).unwrap();
    let pkey = PKey::from_rsa(rsa).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "idp.firm.test").unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&pkey).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(365).unwrap())
        .unwrap();
    builder.sign(&pkey, MessageDigest::sha256()).unwrap();
    let cert = builder.build();

    let cert_pem = String::from_utf8(cert.to_pem().unwrap()).unwrap();
    (pkey, cert_pem)
}

const RESPONSE_ID: &str = "_resp-integration-1";

fn unsigned_response() -> String {
    format!(
        r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{RESPONSE_ID}" Version="2.0" IssueInstant="2026-08-24T10:00:00Z"><saml:Issuer>https://idp.firm.test</saml:Issuer><samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status><saml:Assertion ID="_a1" Version="2.0" IssueInstant="2026-08-24T10:00:00Z"><saml:Issuer>https://idp.firm.test</saml:Issuer><saml:Subject><saml:NameID Format="urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress">user@firm.test</saml:NameID></saml:Subject></saml:Assertion></samlp:Response>"#
    )
}

/// Produce a response whose enveloped signature covers the whole document.
fn signed_response(pkey: &PKey<Private>) -> String {
    let unsigned = unsigned_response();

    let canonical = canonicalize(&unsigned).unwrap();
    let digest = openssl::hash::hash(MessageDigest::sha256(), canonical.as_bytes()).unwrap();
    let digest_value = STANDARD.encode(digest);

    let signed_info = format!(
        r##"<ds:SignedInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:CanonicalizationMethod Algorithm="http://www.w3.org/2001/10/xml-exc-c14n#"/><ds:SignatureMethod Algorithm="http://www.w3.org/2001/04/xmldsig-more#rsa-sha256"/><ds:Reference URI="#{RESPONSE_ID}"><ds:Transforms><ds:Transform Algorithm="http://www.w3.org/2000/09/xmldsig#enveloped-signature"/><ds:Transform Algorithm="http://www.w3.org/2001/10/xml-exc-c14n#"/></ds:Transforms><ds:DigestMethod Algorithm="http://www.w3.org/2001/04/xmlenc#sha256"/><ds:DigestValue>{digest_value}</ds:DigestValue></ds:Reference></ds:SignedInfo>"##
    );

    let canonical_signed_info = canonicalize(&signed_info).unwrap();
    let mut signer = Signer::new(MessageDigest::sha256(), pkey).unwrap();
    signer.update(canonical_signed_info.as_bytes()).unwrap();
    let signature_value = STANDARD.encode(signer.sign_to_vec().unwrap());

    let signature_block = format!(
        r#"<ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#">{signed_info}<ds:SignatureValue>{signature_value}</ds:SignatureValue></ds:Signature>"#
    );

    // Enveloped: the signature sits inside the element it covers.
    let issuer_end = "</saml:Issuer>";
    let insert_at = unsigned.find(issuer_end).unwrap() + issuer_end.len();
    format!(
        "{}{}{}",
        &unsigned[..insert_at],
        signature_block,
        &unsigned[insert_at..]
    )
}

#[test]
fn valid_enveloped_signature_verifies() {
    let (pkey, cert_pem) = idp_identity();
    let xml = signed_response(&pkey);
    verify_enveloped_signature(&xml, &cert_pem).unwrap();
}

#[test]
fn modified_content_fails_the_digest() {
    let (pkey, cert_pem) = idp_identity();
    let xml = signed_response(&pkey).replace("user@firm.test", "attacker@evil.test");
    assert!(verify_enveloped_signature(&xml, &cert_pem).is_err());
}

#[test]
fn signature_from_another_key_is_rejected() {
    let (pkey, _) = idp_identity();
    let (_, other_cert_pem) = idp_identity();
    let xml = signed_response(&pkey);
    assert!(verify_enveloped_signature(&xml, &other_cert_pem).is_err());
}

#[test]
fn unsigned_document_is_rejected() {
    let (_, cert_pem) = idp_identity();
    assert!(verify_enveloped_signature(&unsigned_response(), &cert_pem).is_err());
}

#[test]
fn bare_base64_certificates_are_accepted() {
    let (pkey, cert_pem) = idp_identity();
    let bare: String = cert_pem
        .lines()
        .filter(|l| !l.starts_with("-----"))
        .collect::<Vec<_>>()
        .join("\n");
    let xml = signed_response(&pkey);
    verify_enveloped_signature(&xml, &bare).unwrap();
}

#[test]
fn redirect_binding_signature_round_trips() {
    let (pkey, cert_pem) = idp_identity();

    let encoded_message = urlencoding::encode("fVLBbtswDP0VQ3fHdpM").into_owned();
    let relay_state = urlencoding::encode("/cases/42").into_owned();
    let sig_alg = urlencoding::encode("http://www.w3.org/2001/04/xmldsig-more#rsa-sha256")
        .into_owned();

    let signed_data =
        format!("SAMLRequest={encoded_message}&RelayState={relay_state}&SigAlg={sig_alg}");
    let mut signer = Signer::new(MessageDigest::sha256(), &pkey).unwrap();
    signer.update(signed_data.as_bytes()).unwrap();
    let signature = STANDARD.encode(signer.sign_to_vec().unwrap());

    verify_redirect_signature(
        "SAMLRequest",
        &encoded_message,
        Some(&relay_state),
        &sig_alg,
        &signature,
        &cert_pem,
    )
    .unwrap();

    // Any change to the relayed state invalidates the signature.
    assert!(verify_redirect_signature(
        "SAMLRequest",
        &encoded_message,
        Some("%2Fother"),
        &sig_alg,
        &signature,
        &cert_pem,
    )
    .is_err());
}

#[test]
fn outbound_redirect_signing_verifies_against_the_certificate() {
    let (pkey, cert_pem) = idp_identity();
    let key_pem = String::from_utf8(pkey.private_key_to_pem_pkcs8().unwrap()).unwrap();

    let encoded_message = urlencoding::encode("fZJNb9swDIb").into_owned();
    let sig_alg = urlencoding::encode(RSA_SHA256_URI).into_owned();
    let signed_data = format!("SAMLRequest={encoded_message}&SigAlg={sig_alg}");

    let signature = sign_redirect_message(&key_pem, &signed_data).unwrap();

    verify_redirect_signature(
        "SAMLRequest",
        &encoded_message,
        None,
        &sig_alg,
        &signature,
        &cert_pem,
    )
    .unwrap();
}
