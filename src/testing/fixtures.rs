//! Pre-built test data: RSA keys, a self-signed SSO authority and
//! correctly signed SAML messages

use crate::crypto::CryptoEngine;
use crate::saml::signature::{canonicalize, digest_of_element};
use crate::saml::SsoProfile;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Duration, Utc};
use flate2::write::DeflateEncoder;
use flate2::Compression;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::{X509Builder, X509NameBuilder};
use std::io::Write;
use std::sync::Arc;

const SIGNATURE_SLOT: &str = "__SIGNATURE__";

/// Generate a fresh RSA keypair as PEM strings.
///
/// # Panics
///
/// Panics on key generation failure (test-only code).
#[must_use]
pub fn rsa_keypair() -> (String, String) {
    let rsa = Rsa::generate(2048).expect("key generation");
    let private_pem =
        String::from_utf8(rsa.private_key_to_pem().expect("private pem")).expect("utf-8");
    let public_pem =
        String::from_utf8(rsa.public_key_to_pem().expect("public pem")).expect("utf-8");
    (private_pem, public_pem)
}

/// Content knobs for a signed test response.
pub struct ResponseOptions {
    pub response_id: String,
    pub destination: String,
    pub audience: Option<String>,
    pub name_id: String,
    pub session_index: String,
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
}

impl ResponseOptions {
    /// A response that validates cleanly against `profile` at `now`.
    #[must_use]
    pub fn valid_for(profile: &SsoProfile, now: DateTime<Utc>, session_index: &str) -> Self {
        Self {
            response_id: format!("_resp{}", uuid::Uuid::new_v4().simple()),
            destination: profile.acs_url.clone(),
            audience: Some(profile.entity_id.clone()),
            name_id: "user@example.com".to_string(),
            session_index: session_index.to_string(),
            not_before: Some(now - Duration::minutes(5)),
            not_on_or_after: Some(now + Duration::minutes(5)),
        }
    }
}

/// Content knobs for a signed test logout request.
pub struct LogoutOptions {
    pub request_id: String,
    pub destination: String,
    pub name_id: String,
    pub session_index: String,
    pub not_on_or_after: Option<DateTime<Utc>>,
}

impl LogoutOptions {
    #[must_use]
    pub fn valid_for(profile: &SsoProfile, now: DateTime<Utc>, session_index: &str) -> Self {
        Self {
            request_id: format!("_req{}", uuid::Uuid::new_v4().simple()),
            destination: profile.logout_url.clone(),
            name_id: "user@example.com".to_string(),
            session_index: session_index.to_string(),
            not_on_or_after: Some(now + Duration::minutes(5)),
        }
    }
}

/// A self-signed identity authority that can mint signed SAML messages.
pub struct SsoAuthority {
    pub crypto: Arc<CryptoEngine>,
    pub certificate_pem: String,
}

impl SsoAuthority {
    /// Generate a keypair and matching self-signed certificate.
    ///
    /// # Panics
    ///
    /// Panics on openssl failures (test-only code).
    #[must_use]
    pub fn generate() -> Self {
        let rsa = Rsa::generate(2048).expect("key generation");
        let private_pem =
            String::from_utf8(rsa.private_key_to_pem().expect("private pem")).expect("utf-8");
        let pkey = PKey::from_rsa(rsa).expect("pkey");

        let mut name = X509NameBuilder::new().expect("name builder");
        name.append_entry_by_text("CN", "test-authority").expect("cn");
        let name = name.build();

        let mut builder = X509Builder::new().expect("x509 builder");
        builder.set_version(2).expect("version");
        let serial = BigNum::from_u32(1)
            .and_then(|bn| bn.to_asn1_integer())
            .expect("serial");
        builder.set_serial_number(&serial).expect("serial");
        builder.set_subject_name(&name).expect("subject");
        builder.set_issuer_name(&name).expect("issuer");
        builder
            .set_not_before(&Asn1Time::days_from_now(0).expect("time"))
            .expect("not before");
        builder
            .set_not_after(&Asn1Time::days_from_now(365).expect("time"))
            .expect("not after");
        builder.set_pubkey(&pkey).expect("pubkey");
        builder.sign(&pkey, MessageDigest::sha256()).expect("sign");
        let certificate_pem =
            String::from_utf8(builder.build().to_pem().expect("cert pem")).expect("utf-8");

        Self {
            crypto: Arc::new(CryptoEngine::new(&private_pem, None).expect("crypto engine")),
            certificate_pem,
        }
    }

    /// The SSO profile a relying party would configure for this authority.
    #[must_use]
    pub fn profile(&self) -> SsoProfile {
        SsoProfile {
            entity_id: "https://sp.example".to_string(),
            authority_certificate: self.certificate_pem.clone(),
            acs_url: "https://sp.example/auth/sso/acs".to_string(),
            logout_url: "https://sp.example/auth/sso/logout".to_string(),
            login_url: "https://idp.example/sso".to_string(),
        }
    }

    /// A signed, base64-encoded POST-binding response.
    ///
    /// # Panics
    ///
    /// Panics on signing failures (test-only code).
    #[must_use]
    pub fn signed_response(&self, options: &ResponseOptions) -> String {
        let conditions = conditions_attrs(options.not_before, options.not_on_or_after);
        let audience = options.audience.as_ref().map_or_else(String::new, |a| {
            format!("<saml:AudienceRestriction><saml:Audience>{a}</saml:Audience></saml:AudienceRestriction>")
        });
        let template = format!(
            concat!(
                "<samlp:Response",
                " xmlns:samlp=\"urn:oasis:names:tc:SAML:2.0:protocol\"",
                " xmlns:saml=\"urn:oasis:names:tc:SAML:2.0:assertion\"",
                " ID=\"{id}\" Version=\"2.0\" Destination=\"{destination}\">",
                "__SIGNATURE__",
                "<saml:Assertion ID=\"{id}-a\">",
                "<saml:Subject><saml:NameID>{name_id}</saml:NameID></saml:Subject>",
                "<saml:Conditions{conditions}>{audience}</saml:Conditions>",
                "<saml:AuthnStatement SessionIndex=\"{session_index}\"/>",
                "</saml:Assertion>",
                "</samlp:Response>"
            ),
            id = options.response_id,
            destination = options.destination,
            name_id = options.name_id,
            conditions = conditions,
            audience = audience,
            session_index = options.session_index,
        );
        let signed = self.sign_template(&template, &options.response_id);
        STANDARD.encode(signed)
    }

    /// A signed, deflated, base64-encoded redirect-binding logout request.
    ///
    /// # Panics
    ///
    /// Panics on signing or compression failures (test-only code).
    #[must_use]
    pub fn signed_logout_request(&self, options: &LogoutOptions) -> String {
        let expiry = options.not_on_or_after.map_or_else(String::new, |t| {
            format!(" NotOnOrAfter=\"{}\"", t.format("%Y-%m-%dT%H:%M:%SZ"))
        });
        let template = format!(
            concat!(
                "<samlp:LogoutRequest",
                " xmlns:samlp=\"urn:oasis:names:tc:SAML:2.0:protocol\"",
                " xmlns:saml=\"urn:oasis:names:tc:SAML:2.0:assertion\"",
                " ID=\"{id}\" Version=\"2.0\" Destination=\"{destination}\"{expiry}>",
                "__SIGNATURE__",
                "<saml:NameID>{name_id}</saml:NameID>",
                "<samlp:SessionIndex>{session_index}</samlp:SessionIndex>",
                "</samlp:LogoutRequest>"
            ),
            id = options.request_id,
            destination = options.destination,
            expiry = expiry,
            name_id = options.name_id,
            session_index = options.session_index,
        );
        let signed = self.sign_template(&template, &options.request_id);

        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(signed.as_bytes()).expect("deflate");
        STANDARD.encode(encoder.finish().expect("deflate"))
    }

    /// Fill the signature slot of `template` with a valid enveloped
    /// signature over the document.
    fn sign_template(&self, template: &str, reference_id: &str) -> String {
        let unsigned = template.replace(SIGNATURE_SLOT, "");
        let digest = digest_of_element(&unsigned, None).expect("digest");

        let signed_info = format!(
            concat!(
                "<SignedInfo xmlns=\"http://www.w3.org/2000/09/xmldsig#\">",
                "<CanonicalizationMethod Algorithm=\"http://www.w3.org/2001/10/xml-exc-c14n#\"/>",
                "<SignatureMethod Algorithm=\"http://www.w3.org/2001/04/xmldsig-more#rsa-sha256\"/>",
                "<Reference URI=\"#{id}\">",
                "<Transforms>",
                "<Transform Algorithm=\"http://www.w3.org/2000/09/xmldsig#enveloped-signature\"/>",
                "<Transform Algorithm=\"http://www.w3.org/2001/10/xml-exc-c14n#\"/>",
                "</Transforms>",
                "<DigestMethod Algorithm=\"http://www.w3.org/2001/04/xmlenc#sha256\"/>",
                "<DigestValue>{digest}</DigestValue>",
                "</Reference>",
                "</SignedInfo>"
            ),
            id = reference_id,
            digest = digest,
        );
        let canonical = canonicalize(&signed_info).expect("canonicalize");
        let signature = STANDARD.encode(self.crypto.sign(canonical.as_bytes()).expect("sign"));

        let block = format!(
            "<Signature xmlns=\"http://www.w3.org/2000/09/xmldsig#\">{signed_info}<SignatureValue>{signature}</SignatureValue></Signature>"
        );
        template.replace(SIGNATURE_SLOT, &block)
    }
}

fn conditions_attrs(
    not_before: Option<DateTime<Utc>>,
    not_on_or_after: Option<DateTime<Utc>>,
) -> String {
    let mut attrs = String::new();
    if let Some(t) = not_before {
        attrs.push_str(&format!(" NotBefore=\"{}\"", t.format("%Y-%m-%dT%H:%M:%SZ")));
    }
    if let Some(t) = not_on_or_after {
        attrs.push_str(&format!(
            " NotOnOrAfter=\"{}\"",
            t.format("%Y-%m-%dT%H:%M:%SZ")
        ));
    }
    attrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::signature::verify_embedded_signature;

    #[test]
    fn generated_response_signature_verifies() {
        let authority = SsoAuthority::generate();
        let profile = authority.profile();
        let options = ResponseOptions::valid_for(&profile, Utc::now(), "_sess1");
        let encoded = authority.signed_response(&options);
        let xml = crate::saml::document::decode_post_message(&encoded).unwrap();
        verify_embedded_signature(&xml, &authority.certificate_pem).unwrap();
    }

    #[test]
    fn tampered_response_fails_verification() {
        let authority = SsoAuthority::generate();
        let profile = authority.profile();
        let options = ResponseOptions::valid_for(&profile, Utc::now(), "_sess1");
        let encoded = authority.signed_response(&options);
        let xml = crate::saml::document::decode_post_message(&encoded)
            .unwrap()
            .replace("user@example.com", "admin@example.com");
        assert!(verify_embedded_signature(&xml, &authority.certificate_pem).is_err());
    }

    #[test]
    fn foreign_certificate_fails_verification() {
        let authority = SsoAuthority::generate();
        let other = SsoAuthority::generate();
        let profile = authority.profile();
        let options = ResponseOptions::valid_for(&profile, Utc::now(), "_sess1");
        let encoded = authority.signed_response(&options);
        let xml = crate::saml::document::decode_post_message(&encoded).unwrap();
        assert!(verify_embedded_signature(&xml, &other.certificate_pem).is_err());
    }
}
