//! XML-DSig verification for enveloped SAML signatures
//!
//! Two checks, both required: the reference digest over the signed element
//! (with the Signature element removed and the content exclusively
//! canonicalized), and the RSA signature over the canonicalized SignedInfo
//! block. The algorithms come from the DigestMethod and SignatureMethod
//! URIs in the document, restricted to the RSA/SHA family.

use crate::saml::SamlError;
use base64::{engine::general_purpose::STANDARD, Engine};
use once_cell::sync::Lazy;
use openssl::hash::MessageDigest;
use openssl::sign::Verifier;
use openssl::x509::X509;
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use xml_canonicalization::Canonicalizer;

static SIGNATURE_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<(?:\w+:)?Signature[\s>]").unwrap_or_else(|_| unreachable!()));
static SIGNATURE_CLOSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"</(?:\w+:)?Signature>").unwrap_or_else(|_| unreachable!()));

/// Components lifted out of the `<Signature>` element.
struct SignatureInfo {
    signed_info: String,
    signature_value: String,
    digest_value: String,
    reference_uri: String,
    signature_algorithm: Option<String>,
    digest_algorithm: Option<String>,
}

/// Verify the enveloped signature of `xml` against the authority
/// certificate.
///
/// # Errors
///
/// `SamlError::SignatureInvalid` on any missing component, digest
/// mismatch, unsupported algorithm or failed RSA verification.
pub fn verify_embedded_signature(xml: &str, certificate: &str) -> Result<(), SamlError> {
    let cert = parse_certificate(certificate)?;
    let public_key = cert
        .public_key()
        .map_err(|e| SamlError::SignatureInvalid(format!("certificate key: {e}")))?;

    let info = extract_signature_info(xml)?;
    verify_reference_digest(xml, &info)?;

    let canonical_signed_info = canonicalize(&info.signed_info)?;
    let signature = STANDARD
        .decode(info.signature_value.replace(['\n', '\r', ' '], ""))
        .map_err(|e| SamlError::SignatureInvalid(format!("signature base64: {e}")))?;

    let digest = signature_digest(info.signature_algorithm.as_deref())?;
    let mut verifier = Verifier::new(digest, &public_key)
        .map_err(|e| SamlError::SignatureInvalid(format!("verifier: {e}")))?;
    verifier
        .update(canonical_signed_info.as_bytes())
        .map_err(|e| SamlError::SignatureInvalid(format!("verifier: {e}")))?;
    let valid = verifier.verify(&signature).unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(SamlError::SignatureInvalid(
            "SignedInfo signature does not verify".to_string(),
        ))
    }
}

/// Exclusive C14N without comments.
pub(crate) fn canonicalize(xml: &str) -> Result<String, SamlError> {
    let mut output = Vec::new();
    Canonicalizer::read_from_str(xml)
        .write_to_writer(&mut output)
        .canonicalize(false)
        .map_err(|e| SamlError::SignatureInvalid(format!("canonicalization: {e}")))?;
    String::from_utf8(output).map_err(|e| SamlError::SignatureInvalid(format!("utf-8: {e}")))
}

/// Remove the first `<Signature>` element (enveloped-signature transform).
pub(crate) fn strip_signature(xml: &str) -> String {
    let Some(open) = SIGNATURE_OPEN.find(xml) else {
        return xml.to_string();
    };
    let Some(close) = SIGNATURE_CLOSE.find_at(xml, open.start()) else {
        return xml.to_string();
    };
    let mut result = String::with_capacity(xml.len());
    result.push_str(&xml[..open.start()]);
    result.push_str(&xml[close.end()..]);
    result
}

/// Canonicalize `element`, hash it, and return the base64 digest.
pub(crate) fn digest_of_element(
    element: &str,
    algorithm: Option<&str>,
) -> Result<String, SamlError> {
    let canonical = canonicalize(element)?;
    let digest = reference_digest(algorithm)?;
    let hashed = openssl::hash::hash(digest, canonical.as_bytes())
        .map_err(|e| SamlError::SignatureInvalid(format!("hash: {e}")))?;
    Ok(STANDARD.encode(hashed))
}

fn verify_reference_digest(xml: &str, info: &SignatureInfo) -> Result<(), SamlError> {
    let element = referenced_element(xml, &info.reference_uri)?;
    let without_signature = strip_signature(&element);
    let computed = digest_of_element(&without_signature, info.digest_algorithm.as_deref())?;
    let expected = info.digest_value.replace(['\n', '\r', ' '], "");
    if computed == expected {
        Ok(())
    } else {
        Err(SamlError::SignatureInvalid(
            "reference digest mismatch".to_string(),
        ))
    }
}

/// Resolve a same-document reference. An empty URI signs the whole
/// document; `#id` points at the element carrying that ID attribute.
fn referenced_element(xml: &str, uri: &str) -> Result<String, SamlError> {
    let id = uri.trim_start_matches('#');
    if id.is_empty() {
        return Ok(xml.to_string());
    }
    let marker = format!("ID=\"{id}\"");
    let id_at = xml.find(&marker).ok_or_else(|| {
        SamlError::SignatureInvalid(format!("referenced element not found: {id}"))
    })?;
    let open = xml[..id_at].rfind('<').unwrap_or(0);
    let tag = xml[open..]
        .trim_start_matches('<')
        .split([' ', '\t', '\n', '>'])
        .next()
        .unwrap_or_default()
        .to_string();
    let close = format!("</{tag}>");
    let end = xml[open..]
        .find(&close)
        .map(|pos| open + pos + close.len())
        .ok_or_else(|| {
            SamlError::SignatureInvalid(format!("unterminated element: {tag}"))
        })?;
    Ok(xml[open..end].to_string())
}

/// Single-pass extraction of the Signature components.
fn extract_signature_info(xml: &str) -> Result<SignatureInfo, SamlError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut in_signed_info = false;
    let mut capture: Option<&str> = None;
    let mut signed_info = String::new();
    let mut signature_value = String::new();
    let mut digest_value = String::new();
    let mut reference_uri = String::new();
    let mut signature_algorithm = None;
    let mut digest_algorithm = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = local(&e);
                if name == "SignedInfo" {
                    in_signed_info = true;
                }
                if in_signed_info {
                    // keep the raw tag so namespace declarations survive
                    // into canonicalization
                    signed_info.push('<');
                    signed_info.push_str(std::str::from_utf8(&e).unwrap_or_default());
                    signed_info.push('>');
                    record_signed_info_attrs(
                        &e,
                        &name,
                        &mut reference_uri,
                        &mut signature_algorithm,
                        &mut digest_algorithm,
                    );
                }
                if name == "SignatureValue" {
                    capture = Some("SignatureValue");
                } else if name == "DigestValue" {
                    capture = Some("DigestValue");
                }
            }
            Ok(Event::Empty(e)) => {
                if in_signed_info {
                    signed_info.push('<');
                    signed_info.push_str(std::str::from_utf8(&e).unwrap_or_default());
                    signed_info.push_str("/>");
                    let name = local(&e);
                    record_signed_info_attrs(
                        &e,
                        &name,
                        &mut reference_uri,
                        &mut signature_algorithm,
                        &mut digest_algorithm,
                    );
                }
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().unwrap_or_default();
                if in_signed_info {
                    signed_info.push_str(&text);
                }
                match capture {
                    Some("SignatureValue") => signature_value.push_str(&text),
                    Some("DigestValue") => digest_value.push_str(&text),
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                let local_name = e.local_name();
                let name = std::str::from_utf8(local_name.as_ref()).unwrap_or_default();
                if in_signed_info {
                    signed_info.push_str("</");
                    signed_info.push_str(std::str::from_utf8(e.name().as_ref()).unwrap_or_default());
                    signed_info.push('>');
                    if name == "SignedInfo" {
                        in_signed_info = false;
                    }
                }
                if name == "SignatureValue" || name == "DigestValue" {
                    capture = None;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SamlError::SignatureInvalid(format!("xml: {e}"))),
            _ => {}
        }
    }

    if signed_info.is_empty() {
        return Err(SamlError::SignatureInvalid("no SignedInfo element".to_string()));
    }
    if signature_value.is_empty() {
        return Err(SamlError::SignatureInvalid("no SignatureValue element".to_string()));
    }
    if digest_value.is_empty() {
        return Err(SamlError::SignatureInvalid("no DigestValue element".to_string()));
    }
    Ok(SignatureInfo {
        signed_info,
        signature_value,
        digest_value,
        reference_uri,
        signature_algorithm,
        digest_algorithm,
    })
}

fn record_signed_info_attrs(
    e: &quick_xml::events::BytesStart<'_>,
    name: &str,
    reference_uri: &mut String,
    signature_algorithm: &mut Option<String>,
    digest_algorithm: &mut Option<String>,
) {
    match name {
        "Reference" => {
            if let Some(uri) = attr_value(e, "URI") {
                *reference_uri = uri;
            }
        }
        "SignatureMethod" => *signature_algorithm = attr_value(e, "Algorithm"),
        "DigestMethod" => *digest_algorithm = attr_value(e, "Algorithm"),
        _ => {}
    }
}

fn local(e: &quick_xml::events::BytesStart<'_>) -> String {
    std::str::from_utf8(e.local_name().as_ref())
        .unwrap_or_default()
        .to_string()
}

fn attr_value(e: &quick_xml::events::BytesStart<'_>, key: &str) -> Option<String> {
    e.attributes().flatten().find_map(|attr| {
        if attr.key.as_ref() == key.as_bytes() {
            attr.unescape_value().ok().map(|v| v.to_string())
        } else {
            None
        }
    })
}

fn signature_digest(algorithm: Option<&str>) -> Result<MessageDigest, SamlError> {
    match algorithm {
        None | Some("http://www.w3.org/2001/04/xmldsig-more#rsa-sha256") => {
            Ok(MessageDigest::sha256())
        }
        Some("http://www.w3.org/2000/09/xmldsig#rsa-sha1") => Ok(MessageDigest::sha1()),
        Some("http://www.w3.org/2001/04/xmldsig-more#rsa-sha384") => Ok(MessageDigest::sha384()),
        Some("http://www.w3.org/2001/04/xmldsig-more#rsa-sha512") => Ok(MessageDigest::sha512()),
        Some(other) => Err(SamlError::SignatureInvalid(format!(
            "unsupported signature algorithm: {other}"
        ))),
    }
}

fn reference_digest(algorithm: Option<&str>) -> Result<MessageDigest, SamlError> {
    match algorithm {
        None | Some("http://www.w3.org/2001/04/xmlenc#sha256") => Ok(MessageDigest::sha256()),
        Some("http://www.w3.org/2000/09/xmldsig#sha1") => Ok(MessageDigest::sha1()),
        Some("http://www.w3.org/2001/04/xmlenc#sha512") => Ok(MessageDigest::sha512()),
        Some(other) => Err(SamlError::SignatureInvalid(format!(
            "unsupported digest algorithm: {other}"
        ))),
    }
}

/// Accept PEM certificates with or without armor lines.
pub(crate) fn parse_certificate(certificate: &str) -> Result<X509, SamlError> {
    let pem = if certificate.contains("-----BEGIN CERTIFICATE-----") {
        certificate.to_string()
    } else {
        format!(
            "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----",
            certificate.trim()
        )
    };
    X509::from_pem(pem.as_bytes())
        .map_err(|e| SamlError::SignatureInvalid(format!("certificate: {e}")))
}
