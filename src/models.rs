//! Core domain types shared across the authentication modalities

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An authentication request issued to the assertion engine.
///
/// Immutable once created; a superseding login attempt creates a fresh
/// request with a new id rather than mutating this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub username: String,
    /// `true` for a full session login, `false` for a transactional check
    pub session_request: bool,
    pub auth_request_id: String,
}

/// The engine's terminal decision for one [`AuthRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub auth_request_id: String,
    pub user_hash: String,
    pub user_push_id: Option<String>,
    pub device_id: Option<String>,
    pub authorized: bool,
    pub organization_user_id: Option<String>,
}

/// Authority-initiated revocation, decoupled from any auth request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeOrbitCallback {
    #[serde(
        rename = "engine_time",
        serialize_with = "wire_time::serialize",
        deserialize_with = "wire_time::deserialize"
    )]
    pub de_orbit_time: DateTime<Utc>,
    pub user_hash: String,
}

/// Tri-state authorization verdict for a user session.
///
/// `Pending` means a decision has not arrived yet and must never be
/// treated as either allow or deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    #[default]
    Pending,
    Authorized,
    Denied,
}

impl Decision {
    #[must_use]
    pub fn is_denied(self) -> bool {
        matches!(self, Self::Denied)
    }
}

/// Fields extracted from a fully validated SAML assertion.
///
/// Derived per validation, never cached beyond the request that
/// produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamlAssertion {
    pub name_id: String,
    pub session_index: String,
    pub attributes: HashMap<String, Vec<String>>,
}

/// Per-user authorization state driven by the reconciler.
///
/// Keyed by the local user id in the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserAuthState {
    /// Engine-side username; replaced by the push id after first pairing
    pub external_username: Option<String>,
    pub pending_auth_request_id: Option<String>,
    pub authorized: Decision,
    pub external_user_hash: Option<String>,
    pub sso_session_index: Option<String>,
}

/// `GET /v1/ping` payload: engine clock plus the current public key and
/// the timestamp it was issued at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingResponse {
    pub engine_time: DateTime<Utc>,
    pub public_key: String,
    pub key_time_stamp: DateTime<Utc>,
}

/// Result of white-label user creation: the pairing QR code and the
/// manual pairing code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhiteLabelUser {
    #[serde(rename = "qrcode")]
    pub qr_code_url: String,
    pub code: String,
}

/// Engine wire timestamps are `YYYY-MM-DD HH:MM:SS` in UTC.
pub mod wire_time {
    use super::{DateTime, NaiveDateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    /// Parse an engine timestamp string.
    ///
    /// # Errors
    ///
    /// Returns a `chrono` parse error for anything not matching the
    /// fixed format.
    pub fn parse(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        NaiveDateTime::parse_from_str(value, FORMAT).map(|naive| naive.and_utc())
    }

    #[must_use]
    pub fn format(value: &DateTime<Utc>) -> String {
        value.format(FORMAT).to_string()
    }

    /// # Errors
    ///
    /// Propagates serializer failures.
    pub fn serialize<S: Serializer>(
        value: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(value))
    }

    /// # Errors
    ///
    /// Rejects non-string values and strings not in the wire format.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_defaults_to_pending() {
        assert_eq!(Decision::default(), Decision::Pending);
        assert!(!Decision::Pending.is_denied());
        assert!(Decision::Denied.is_denied());
    }

    #[test]
    fn de_orbit_callback_parses_wire_time() {
        let callback: DeOrbitCallback = serde_json::from_str(
            r#"{"engine_time": "2016-03-18 14:04:49", "user_hash": "abc123"}"#,
        )
        .unwrap();
        assert_eq!(callback.user_hash, "abc123");
        assert_eq!(wire_time::format(&callback.de_orbit_time), "2016-03-18 14:04:49");
    }

    #[test]
    fn de_orbit_callback_rejects_bad_time() {
        let result: Result<DeOrbitCallback, _> = serde_json::from_str(
            r#"{"engine_time": "2016-03-18T14:04:49Z", "user_hash": "abc123"}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn white_label_user_reads_qrcode_field() {
        let user: WhiteLabelUser =
            serde_json::from_str(r#"{"qrcode": "https://img.example/qr", "code": "ABC1234"}"#)
                .unwrap();
        assert_eq!(user.qr_code_url, "https://img.example/qr");
        assert_eq!(user.code, "ABC1234");
    }
}
