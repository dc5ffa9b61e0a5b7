//! Validation pipeline for authority-initiated logout requests
//!
//! Shorter than the response pipeline: signature, expiry, destination,
//! then equality between the request's session index and the one recorded
//! at login. A mismatched index is a rejection; accepting it would let
//! one stale request log out a newer session.

use crate::saml::document::{self, LogoutRequestDocument};
use crate::saml::signature::verify_embedded_signature;
use crate::saml::{SamlError, SsoProfile};
use chrono::{DateTime, Utc};

/// A validated logout request.
#[derive(Debug, Clone)]
pub struct LogoutEvent {
    pub name_id: Option<String>,
    pub session_index: String,
}

pub struct LogoutRequestValidator {
    profile: SsoProfile,
}

impl LogoutRequestValidator {
    #[must_use]
    pub fn new(profile: SsoProfile) -> Self {
        Self { profile }
    }

    /// Validate a redirect-binding `SAMLRequest` logout message against
    /// the session index recorded for the user.
    ///
    /// # Errors
    ///
    /// The first failing stage's [`SamlError`].
    pub fn validate(
        &self,
        encoded_request: &str,
        recorded_session_index: &str,
        now: DateTime<Utc>,
    ) -> Result<LogoutEvent, SamlError> {
        let xml = document::decode_redirect_message(encoded_request)?;
        let doc = document::parse_logout_request(&xml)?;
        verify_embedded_signature(&doc.xml, &self.profile.authority_certificate)?;
        self.check_content(&doc, recorded_session_index, now)?;
        Ok(LogoutEvent {
            name_id: doc.name_id,
            session_index: recorded_session_index.to_string(),
        })
    }

    fn check_content(
        &self,
        doc: &LogoutRequestDocument,
        recorded_session_index: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SamlError> {
        if let Some(not_on_or_after) = doc.not_on_or_after {
            if now >= not_on_or_after {
                return Err(SamlError::OutsideWindow(format!(
                    "logout request expired at {not_on_or_after}"
                )));
            }
        }

        let actual = doc.destination.clone().unwrap_or_default();
        if actual != self.profile.logout_url {
            return Err(SamlError::DestinationMismatch {
                expected: self.profile.logout_url.clone(),
                actual,
            });
        }

        if recorded_session_index.is_empty()
            || !doc
                .session_indexes
                .iter()
                .any(|index| index == recorded_session_index)
        {
            return Err(SamlError::SessionIndexMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn validator() -> LogoutRequestValidator {
        LogoutRequestValidator::new(SsoProfile {
            entity_id: "https://sp.example".to_string(),
            authority_certificate: String::new(),
            acs_url: "https://sp.example/acs".to_string(),
            logout_url: "https://sp.example/logout".to_string(),
            login_url: "https://idp.example/sso".to_string(),
        })
    }

    fn doc(now: DateTime<Utc>) -> LogoutRequestDocument {
        LogoutRequestDocument {
            xml: String::new(),
            destination: Some("https://sp.example/logout".to_string()),
            name_id: Some("user@example.com".to_string()),
            session_indexes: vec!["_sess1".to_string()],
            not_on_or_after: Some(now + Duration::minutes(5)),
        }
    }

    #[test]
    fn valid_logout_passes() {
        let now = Utc::now();
        assert!(validator().check_content(&doc(now), "_sess1", now).is_ok());
    }

    #[test]
    fn expired_logout_is_rejected() {
        let now = Utc::now();
        let mut d = doc(now);
        d.not_on_or_after = Some(now);
        assert!(matches!(
            validator().check_content(&d, "_sess1", now),
            Err(SamlError::OutsideWindow(_))
        ));
    }

    #[test]
    fn wrong_destination_is_rejected() {
        let now = Utc::now();
        let mut d = doc(now);
        d.destination = Some("https://sp.example/acs".to_string());
        assert!(matches!(
            validator().check_content(&d, "_sess1", now),
            Err(SamlError::DestinationMismatch { .. })
        ));
    }

    #[test]
    fn session_index_mismatch_is_rejected() {
        let now = Utc::now();
        let d = doc(now);
        assert!(matches!(
            validator().check_content(&d, "_other", now),
            Err(SamlError::SessionIndexMismatch)
        ));
        // a user with no recorded session cannot be logged out remotely
        assert!(matches!(
            validator().check_content(&d, "", now),
            Err(SamlError::SessionIndexMismatch)
        ));
    }
}
