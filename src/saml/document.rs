//! SAML message decoding and structural parsing
//!
//! Messages arrive base64 encoded (POST binding) or deflated then base64
//! encoded (redirect binding). Parsing is a single quick-xml event pass;
//! DOCTYPE declarations are rejected outright and entities are never
//! resolved, so entity-expansion tricks cannot reach the validators.

use crate::saml::SamlError;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use flate2::read::DeflateDecoder;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashMap;
use std::io::Read;

/// Upper bound on a decoded SAML document.
const MAX_DOCUMENT_SIZE: usize = 256 * 1024;

/// A parsed `<Response>`, keeping the raw XML for signature verification.
#[derive(Debug, Clone)]
pub struct ResponseDocument {
    pub xml: String,
    pub destination: Option<String>,
    pub assertions: Vec<AssertionDocument>,
}

/// One `<Assertion>` inside a response.
#[derive(Debug, Clone, Default)]
pub struct AssertionDocument {
    pub name_id: Option<String>,
    pub session_index: Option<String>,
    pub audiences: Vec<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub attributes: HashMap<String, Vec<String>>,
}

/// A parsed `<LogoutRequest>`.
#[derive(Debug, Clone)]
pub struct LogoutRequestDocument {
    pub xml: String,
    pub destination: Option<String>,
    pub name_id: Option<String>,
    pub session_indexes: Vec<String>,
    pub not_on_or_after: Option<DateTime<Utc>>,
}

/// Decode a POST-binding message: base64 only.
///
/// # Errors
///
/// `SamlError::Malformed` for bad base64, oversized content or non-UTF-8.
pub fn decode_post_message(encoded: &str) -> Result<String, SamlError> {
    let stripped: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    if stripped.len() > MAX_DOCUMENT_SIZE * 2 {
        return Err(SamlError::Malformed("message exceeds size limit".to_string()));
    }
    let bytes = STANDARD
        .decode(stripped)
        .map_err(|e| SamlError::Malformed(format!("base64: {e}")))?;
    if bytes.len() > MAX_DOCUMENT_SIZE {
        return Err(SamlError::Malformed("message exceeds size limit".to_string()));
    }
    String::from_utf8(bytes).map_err(|e| SamlError::Malformed(format!("utf-8: {e}")))
}

/// Decode a redirect-binding message: base64, then raw deflate.
///
/// # Errors
///
/// `SamlError::Malformed` for bad base64, bad deflate data or content
/// exceeding the size limit after inflation.
pub fn decode_redirect_message(encoded: &str) -> Result<String, SamlError> {
    let stripped: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD
        .decode(stripped)
        .map_err(|e| SamlError::Malformed(format!("base64: {e}")))?;
    let mut decoder = DeflateDecoder::new(bytes.as_slice()).take(MAX_DOCUMENT_SIZE as u64 + 1);
    let mut xml = String::new();
    decoder
        .read_to_string(&mut xml)
        .map_err(|e| SamlError::Malformed(format!("deflate: {e}")))?;
    if xml.len() > MAX_DOCUMENT_SIZE {
        return Err(SamlError::Malformed("message exceeds size limit".to_string()));
    }
    Ok(xml)
}

/// Which leaf element's text is being collected.
#[derive(PartialEq)]
enum Capture {
    None,
    NameId,
    Audience,
    AttributeValue,
    SessionIndex,
}

/// Parse a `<Response>` document.
///
/// # Errors
///
/// `SamlError::Malformed` for XML errors, DOCTYPE declarations or a root
/// element that is not a Response.
pub fn parse_response(xml: &str) -> Result<ResponseDocument, SamlError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut destination = None;
    let mut assertions: Vec<AssertionDocument> = Vec::new();
    let mut in_assertion = false;
    let mut saw_response = false;
    let mut capture = Capture::None;
    let mut current_attribute: Option<String> = None;
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::DocType(_)) => {
                return Err(SamlError::Malformed(
                    "document type declarations are not accepted".to_string(),
                ));
            }
            Ok(Event::Start(e) | Event::Empty(e)) => {
                let name = local_name(&e);
                match name.as_str() {
                    "Response" if !saw_response => {
                        saw_response = true;
                        destination = attribute(&e, "Destination");
                    }
                    "Assertion" => {
                        in_assertion = true;
                        assertions.push(AssertionDocument::default());
                    }
                    "NameID" if in_assertion => capture = Capture::NameId,
                    "Audience" if in_assertion => capture = Capture::Audience,
                    "AuthnStatement" if in_assertion => {
                        if let (Some(current), Some(index)) =
                            (assertions.last_mut(), attribute(&e, "SessionIndex"))
                        {
                            current.session_index = Some(index);
                        }
                    }
                    "Conditions" if in_assertion => {
                        if let Some(current) = assertions.last_mut() {
                            current.not_before =
                                parse_instant(attribute(&e, "NotBefore"), "NotBefore")?;
                            current.not_on_or_after =
                                parse_instant(attribute(&e, "NotOnOrAfter"), "NotOnOrAfter")?;
                        }
                    }
                    "Attribute" if in_assertion => {
                        current_attribute = attribute(&e, "Name");
                    }
                    "AttributeValue" if in_assertion && current_attribute.is_some() => {
                        capture = Capture::AttributeValue;
                    }
                    _ => {}
                }
                text.clear();
            }
            Ok(Event::Text(e)) => {
                if capture != Capture::None {
                    text.push_str(
                        &e.unescape()
                            .map_err(|err| SamlError::Malformed(format!("text: {err}")))?,
                    );
                }
            }
            Ok(Event::End(e)) => {
                let name = std::str::from_utf8(e.local_name().as_ref())
                    .unwrap_or_default()
                    .to_string();
                match name.as_str() {
                    "Assertion" => in_assertion = false,
                    "NameID" if capture == Capture::NameId => {
                        if let Some(current) = assertions.last_mut() {
                            current.name_id = Some(text.clone());
                        }
                        capture = Capture::None;
                    }
                    "Audience" if capture == Capture::Audience => {
                        if let Some(current) = assertions.last_mut() {
                            current.audiences.push(text.clone());
                        }
                        capture = Capture::None;
                    }
                    "AttributeValue" if capture == Capture::AttributeValue => {
                        if let (Some(current), Some(attr)) =
                            (assertions.last_mut(), current_attribute.as_ref())
                        {
                            current
                                .attributes
                                .entry(attr.clone())
                                .or_default()
                                .push(text.clone());
                        }
                        capture = Capture::None;
                    }
                    "Attribute" => current_attribute = None,
                    _ => {}
                }
                text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SamlError::Malformed(format!("xml: {e}"))),
            _ => {}
        }
    }

    if !saw_response {
        return Err(SamlError::Malformed("root element is not a Response".to_string()));
    }
    Ok(ResponseDocument {
        xml: xml.to_string(),
        destination,
        assertions,
    })
}

/// Parse a `<LogoutRequest>` document.
///
/// # Errors
///
/// `SamlError::Malformed` for XML errors, DOCTYPE declarations or a root
/// element that is not a LogoutRequest.
pub fn parse_logout_request(xml: &str) -> Result<LogoutRequestDocument, SamlError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut saw_request = false;
    let mut destination = None;
    let mut not_on_or_after = None;
    let mut name_id = None;
    let mut session_indexes = Vec::new();
    let mut capture = Capture::None;
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::DocType(_)) => {
                return Err(SamlError::Malformed(
                    "document type declarations are not accepted".to_string(),
                ));
            }
            Ok(Event::Start(e) | Event::Empty(e)) => {
                match local_name(&e).as_str() {
                    "LogoutRequest" if !saw_request => {
                        saw_request = true;
                        destination = attribute(&e, "Destination");
                        not_on_or_after =
                            parse_instant(attribute(&e, "NotOnOrAfter"), "NotOnOrAfter")?;
                    }
                    "NameID" => capture = Capture::NameId,
                    "SessionIndex" => capture = Capture::SessionIndex,
                    _ => {}
                }
                text.clear();
            }
            Ok(Event::Text(e)) => {
                if capture != Capture::None {
                    text.push_str(
                        &e.unescape()
                            .map_err(|err| SamlError::Malformed(format!("text: {err}")))?,
                    );
                }
            }
            Ok(Event::End(e)) => {
                match std::str::from_utf8(e.local_name().as_ref()).unwrap_or_default() {
                    "NameID" if capture == Capture::NameId => {
                        name_id = Some(text.clone());
                        capture = Capture::None;
                    }
                    "SessionIndex" if capture == Capture::SessionIndex => {
                        session_indexes.push(text.clone());
                        capture = Capture::None;
                    }
                    _ => {}
                }
                text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SamlError::Malformed(format!("xml: {e}"))),
            _ => {}
        }
    }

    if !saw_request {
        return Err(SamlError::Malformed(
            "root element is not a LogoutRequest".to_string(),
        ));
    }
    Ok(LogoutRequestDocument {
        xml: xml.to_string(),
        destination,
        name_id,
        session_indexes,
        not_on_or_after,
    })
}

fn local_name(e: &quick_xml::events::BytesStart<'_>) -> String {
    std::str::from_utf8(e.local_name().as_ref())
        .unwrap_or_default()
        .to_string()
}

fn attribute(e: &quick_xml::events::BytesStart<'_>, key: &str) -> Option<String> {
    e.attributes().flatten().find_map(|attr| {
        let attr_key = std::str::from_utf8(attr.key.as_ref()).unwrap_or_default();
        // match both plain and namespaced attribute names
        if attr_key == key || attr_key.ends_with(&format!(":{key}")) {
            attr.unescape_value().ok().map(|v| v.to_string())
        } else {
            None
        }
    })
}

fn parse_instant(
    value: Option<String>,
    field: &str,
) -> Result<Option<DateTime<Utc>>, SamlError> {
    value
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| SamlError::Malformed(format!("{field}: {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use std::io::Write;

    const RESPONSE_XML: &str = r#"<?xml version="1.0"?>
<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" Destination="https://sp.example/acs" ID="_resp1">
  <saml:Assertion ID="_a1">
    <saml:Subject><saml:NameID Format="urn:oasis:names:tc:SAML:2.0:nameid-format:persistent">user@example.com</saml:NameID></saml:Subject>
    <saml:Conditions NotBefore="2026-08-29T10:00:00Z" NotOnOrAfter="2026-08-29T10:05:00Z">
      <saml:AudienceRestriction><saml:Audience>https://sp.example</saml:Audience></saml:AudienceRestriction>
    </saml:Conditions>
    <saml:AuthnStatement SessionIndex="_sess42"/>
    <saml:AttributeStatement>
      <saml:Attribute Name="role"><saml:AttributeValue>admin</saml:AttributeValue><saml:AttributeValue>editor</saml:AttributeValue></saml:Attribute>
    </saml:AttributeStatement>
  </saml:Assertion>
</samlp:Response>"#;

    #[test]
    fn parses_response_fields() {
        let doc = parse_response(RESPONSE_XML).unwrap();
        assert_eq!(doc.destination.as_deref(), Some("https://sp.example/acs"));
        assert_eq!(doc.assertions.len(), 1);
        let assertion = &doc.assertions[0];
        assert_eq!(assertion.name_id.as_deref(), Some("user@example.com"));
        assert_eq!(assertion.session_index.as_deref(), Some("_sess42"));
        assert_eq!(assertion.audiences, vec!["https://sp.example"]);
        assert!(assertion.not_before.is_some());
        assert!(assertion.not_on_or_after.is_some());
        assert_eq!(
            assertion.attributes.get("role").map(Vec::as_slice),
            Some(["admin".to_string(), "editor".to_string()].as_slice())
        );
    }

    #[test]
    fn doctype_is_rejected() {
        let xml = "<!DOCTYPE foo [<!ENTITY bar \"x\">]><samlp:Response xmlns:samlp=\"urn:oasis:names:tc:SAML:2.0:protocol\"/>";
        assert!(matches!(parse_response(xml), Err(SamlError::Malformed(_))));
    }

    #[test]
    fn non_response_root_is_rejected() {
        assert!(parse_response("<Other/>").is_err());
    }

    #[test]
    fn bad_timestamp_is_rejected() {
        let xml = RESPONSE_XML.replace("2026-08-29T10:00:00Z", "yesterday");
        assert!(parse_response(&xml).is_err());
    }

    #[test]
    fn parses_logout_request() {
        let xml = r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" Destination="https://sp.example/logout" NotOnOrAfter="2026-08-29T10:05:00Z">
            <saml:NameID>user@example.com</saml:NameID>
            <samlp:SessionIndex>_sess42</samlp:SessionIndex>
        </samlp:LogoutRequest>"#;
        let doc = parse_logout_request(xml).unwrap();
        assert_eq!(doc.destination.as_deref(), Some("https://sp.example/logout"));
        assert_eq!(doc.name_id.as_deref(), Some("user@example.com"));
        assert_eq!(doc.session_indexes, vec!["_sess42"]);
        assert!(doc.not_on_or_after.is_some());
    }

    #[test]
    fn post_binding_round_trip() {
        let encoded = STANDARD.encode(RESPONSE_XML);
        assert_eq!(decode_post_message(&encoded).unwrap(), RESPONSE_XML);
        assert!(decode_post_message("!!!not base64!!!").is_err());
    }

    #[test]
    fn redirect_binding_round_trip() {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(RESPONSE_XML.as_bytes()).unwrap();
        let encoded = STANDARD.encode(encoder.finish().unwrap());
        assert_eq!(decode_redirect_message(&encoded).unwrap(), RESPONSE_XML);
    }
}
