//! Validation pipeline for inbound SAML responses
//!
//! Stage order is fixed and short-circuiting: decode/parse, signature,
//! assertions present, audience, validity window, destination, replay.
//! The session index is registered only after every other stage has
//! passed, and registration doubles as the replay check so two
//! concurrent logins with one index cannot both succeed.

use crate::models::SamlAssertion;
use crate::saml::document::{self, AssertionDocument, ResponseDocument};
use crate::saml::signature::verify_embedded_signature;
use crate::saml::{SamlError, SsoProfile};
use crate::store::{Registration, ReplayStore};
use chrono::{DateTime, Utc};
use log::debug;
use std::sync::Arc;

pub struct ResponseValidator {
    profile: SsoProfile,
    replay: Arc<dyn ReplayStore>,
}

impl ResponseValidator {
    #[must_use]
    pub fn new(profile: SsoProfile, replay: Arc<dyn ReplayStore>) -> Self {
        Self { profile, replay }
    }

    /// Validate a POST-binding `SAMLResponse` value and extract the
    /// assertion.
    ///
    /// # Errors
    ///
    /// The first failing stage's [`SamlError`]; replays surface as
    /// `SamlError::Replayed` after all content checks have passed.
    pub async fn validate(
        &self,
        encoded_response: &str,
        now: DateTime<Utc>,
    ) -> Result<SamlAssertion, SamlError> {
        let xml = document::decode_post_message(encoded_response)?;
        let doc = document::parse_response(&xml)?;
        verify_embedded_signature(&doc.xml, &self.profile.authority_certificate)?;
        self.check_content(&doc, now)?;

        let primary = primary_assertion(&doc)?;
        let session_index = primary
            .session_index
            .clone()
            .unwrap_or_else(String::new);
        let name_id = primary.name_id.clone().unwrap_or_else(String::new);

        match self.replay.check_and_register(&session_index, now).await? {
            Registration::Replayed => Err(SamlError::Replayed(session_index)),
            Registration::First => {
                debug!("accepted SSO assertion for session {session_index}");
                Ok(SamlAssertion {
                    name_id,
                    session_index,
                    attributes: primary.attributes.clone(),
                })
            }
        }
    }

    fn check_content(&self, doc: &ResponseDocument, now: DateTime<Utc>) -> Result<(), SamlError> {
        if doc.assertions.is_empty() {
            return Err(SamlError::NoAssertions);
        }

        for assertion in &doc.assertions {
            if !assertion.audiences.is_empty()
                && !assertion.audiences.contains(&self.profile.entity_id)
            {
                return Err(SamlError::AudienceMismatch {
                    expected: self.profile.entity_id.clone(),
                });
            }
        }

        for assertion in &doc.assertions {
            if let Some(not_before) = assertion.not_before {
                if now < not_before {
                    return Err(SamlError::OutsideWindow(format!(
                        "assertion not valid before {not_before}"
                    )));
                }
            }
            // the window is half-open: NotOnOrAfter itself is invalid
            if let Some(not_on_or_after) = assertion.not_on_or_after {
                if now >= not_on_or_after {
                    return Err(SamlError::OutsideWindow(format!(
                        "assertion expired at {not_on_or_after}"
                    )));
                }
            }
        }

        let actual = doc.destination.clone().unwrap_or_default();
        if actual != self.profile.acs_url {
            return Err(SamlError::DestinationMismatch {
                expected: self.profile.acs_url.clone(),
                actual,
            });
        }
        Ok(())
    }
}

/// The assertion carrying the subject and session index.
fn primary_assertion(doc: &ResponseDocument) -> Result<&AssertionDocument, SamlError> {
    doc.assertions
        .iter()
        .find(|a| a.name_id.is_some() && a.session_index.is_some())
        .ok_or_else(|| {
            SamlError::Malformed("no assertion with subject and session index".to_string())
        })
}
