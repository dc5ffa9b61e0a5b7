//! Outbound AuthnRequest construction, HTTP-Redirect binding
//!
//! The request asks for a persistent NameID (AllowCreate) and a HTTP-POST
//! response to the configured ACS URL. Delivery is redirect binding:
//! deflate, base64, urlencode, with a detached RSA-SHA256 signature over
//! the query string in the order the binding specification fixes.

use crate::crypto::{generate_xml_id, CryptoEngine};
use crate::saml::{SamlError, SsoProfile};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::Write;
use std::sync::Arc;

const SIG_ALG_RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
const NAME_ID_PERSISTENT: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:persistent";
const BINDING_HTTP_POST: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST";

pub struct AuthnRequestBuilder {
    profile: SsoProfile,
    crypto: Arc<CryptoEngine>,
}

impl AuthnRequestBuilder {
    #[must_use]
    pub fn new(profile: SsoProfile, crypto: Arc<CryptoEngine>) -> Self {
        Self { profile, crypto }
    }

    /// Build the signed redirect URL that starts an SSO login.
    ///
    /// # Errors
    ///
    /// `SamlError::Malformed` if compression fails, `SignatureInvalid` if
    /// signing fails.
    pub fn redirect_url(
        &self,
        relay_state: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<String, SamlError> {
        let xml = self.build_xml(now);
        let encoded = deflate_and_encode(&xml)?;

        let mut signed_data = format!("SAMLRequest={}", urlencoding::encode(&encoded));
        if let Some(state) = relay_state.filter(|s| !s.is_empty()) {
            signed_data.push_str("&RelayState=");
            signed_data.push_str(&urlencoding::encode(state));
        }
        signed_data.push_str("&SigAlg=");
        signed_data.push_str(&urlencoding::encode(SIG_ALG_RSA_SHA256));

        let signature = self
            .crypto
            .sign(signed_data.as_bytes())
            .map_err(|e| SamlError::SignatureInvalid(format!("request signing: {e}")))?;
        let signature_param = urlencoding::encode(&STANDARD.encode(signature)).into_owned();

        let separator = if self.profile.login_url.contains('?') { '&' } else { '?' };
        Ok(format!(
            "{}{}{}&Signature={}",
            self.profile.login_url, separator, signed_data, signature_param
        ))
    }

    fn build_xml(&self, now: DateTime<Utc>) -> String {
        let id = generate_xml_id();
        let instant = now.format("%Y-%m-%dT%H:%M:%SZ");
        format!(
            concat!(
                "<samlp:AuthnRequest",
                " xmlns:samlp=\"urn:oasis:names:tc:SAML:2.0:protocol\"",
                " xmlns:saml=\"urn:oasis:names:tc:SAML:2.0:assertion\"",
                " ID=\"{id}\" Version=\"2.0\" IssueInstant=\"{instant}\"",
                " Destination=\"{destination}\"",
                " AssertionConsumerServiceURL=\"{acs}\"",
                " ProtocolBinding=\"{binding}\">",
                "<saml:Issuer>{issuer}</saml:Issuer>",
                "<samlp:NameIDPolicy Format=\"{format}\" AllowCreate=\"true\"/>",
                "</samlp:AuthnRequest>"
            ),
            id = id,
            instant = instant,
            destination = xml_escape(&self.profile.login_url),
            acs = xml_escape(&self.profile.acs_url),
            binding = BINDING_HTTP_POST,
            issuer = xml_escape(&self.profile.entity_id),
            format = NAME_ID_PERSISTENT,
        )
    }
}

fn deflate_and_encode(xml: &str) -> Result<String, SamlError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(xml.as_bytes())
        .and_then(|()| encoder.finish())
        .map(|compressed| STANDARD.encode(compressed))
        .map_err(|e| SamlError::Malformed(format!("deflate: {e}")))
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
