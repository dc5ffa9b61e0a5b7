//! Engine error taxonomy and message-code classification
//!
//! Engine error bodies carry a numeric `message_code`. The last three
//! digits select the failure class regardless of the operation prefix, so
//! classification is a table over that suffix. Deployments can extend the
//! table through configuration for codes the engine adds later; anything
//! unmapped lands in the catch-all `Engine` variant.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message code the poll endpoint returns while the end user has not yet
/// responded. Callers treat it as "still pending", not as a failure.
pub const PENDING_RESPONSE_CODE: u64 = 70_403;

/// Unified error for all engine interactions.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Network failure, timeout or unreachable engine
    #[error("engine communication failure: {0}")]
    Communication(String),

    /// Credentials or application identity rejected by the engine
    #[error("invalid credentials (engine code {code}): {message}")]
    InvalidCredentials { code: u64, message: String },

    /// The engine understood the request but refused its content
    #[error("invalid request (engine code {code}): {message}")]
    InvalidRequest { code: u64, message: String },

    #[error("user has no paired devices")]
    NoPairedDevices,

    #[error("no such user known to the engine")]
    NoSuchUser,

    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// The auth request aged out before the user answered
    #[error("auth request expired")]
    ExpiredAuthRequest,

    /// Engine-side failure without a more specific classification
    #[error("engine error (code {code}): {message}")]
    Engine { code: u64, message: String },

    /// A success response whose body could not be interpreted
    #[error("invalid engine response: {0}")]
    InvalidResponse(String),

    /// A callback carrying neither a de-orbit nor an auth package
    #[error("unknown callback action: {0}")]
    UnknownCallbackAction(String),
}

impl ApiError {
    /// The engine message code, when the variant carries one.
    #[must_use]
    pub fn code(&self) -> Option<u64> {
        match self {
            Self::InvalidCredentials { code, .. }
            | Self::InvalidRequest { code, .. }
            | Self::Engine { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// `true` for the poll endpoint's "user has not answered yet" code.
    #[must_use]
    pub fn is_pending_sentinel(&self) -> bool {
        self.code() == Some(PENDING_RESPONSE_CODE)
    }
}

/// Failure classes a message code can map to. Deserialized from the
/// `[authority.error_code_overrides]` settings table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorKind {
    InvalidCredentials,
    InvalidRequest,
    NoPairedDevices,
    NoSuchUser,
    RateLimitExceeded,
    ExpiredAuthRequest,
    Engine,
}

impl ApiErrorKind {
    fn into_error(self, code: u64, message: String) -> ApiError {
        match self {
            Self::InvalidCredentials => ApiError::InvalidCredentials { code, message },
            Self::InvalidRequest => ApiError::InvalidRequest { code, message },
            Self::NoPairedDevices => ApiError::NoPairedDevices,
            Self::NoSuchUser => ApiError::NoSuchUser,
            Self::RateLimitExceeded => ApiError::RateLimitExceeded,
            Self::ExpiredAuthRequest => ApiError::ExpiredAuthRequest,
            Self::Engine => ApiError::Engine { code, message },
        }
    }
}

/// Suffix table over the last three digits of the message code.
const SUFFIX_TABLE: &[(u64, ApiErrorKind)] = &[
    (401, ApiErrorKind::InvalidRequest),    // signature rejected
    (402, ApiErrorKind::ExpiredAuthRequest),
    (403, ApiErrorKind::InvalidRequest),    // includes the pending sentinel
    (422, ApiErrorKind::InvalidCredentials),
    (423, ApiErrorKind::InvalidCredentials), // app identifier unknown
    (424, ApiErrorKind::NoPairedDevices),
    (425, ApiErrorKind::InvalidCredentials), // app identifier malformed
    (426, ApiErrorKind::NoSuchUser),
    (428, ApiErrorKind::InvalidCredentials), // key mismatch
    (435, ApiErrorKind::InvalidCredentials), // application disabled
    (436, ApiErrorKind::RateLimitExceeded),
];

/// Map an engine `message_code` + message to an [`ApiError`].
///
/// `overrides` are exact-code mappings from configuration and win over the
/// built-in suffix table.
#[must_use]
pub fn classify_engine_code(
    code: u64,
    message: &str,
    overrides: &[(u64, ApiErrorKind)],
) -> ApiError {
    let kind = overrides
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, k)| *k)
        .or_else(|| {
            let suffix = code % 1000;
            SUFFIX_TABLE
                .iter()
                .find(|(s, _)| *s == suffix)
                .map(|(_, k)| *k)
        })
        .unwrap_or(ApiErrorKind::Engine);
    kind.into_error(code, message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_suffixes_classify() {
        assert!(matches!(
            classify_engine_code(40_422, "bad secret", &[]),
            ApiError::InvalidCredentials { code: 40_422, .. }
        ));
        assert!(matches!(
            classify_engine_code(40_424, "", &[]),
            ApiError::NoPairedDevices
        ));
        assert!(matches!(
            classify_engine_code(40_426, "", &[]),
            ApiError::NoSuchUser
        ));
        assert!(matches!(
            classify_engine_code(40_436, "", &[]),
            ApiError::RateLimitExceeded
        ));
        assert!(matches!(
            classify_engine_code(70_402, "", &[]),
            ApiError::ExpiredAuthRequest
        ));
        assert!(matches!(
            classify_engine_code(50_435, "", &[]),
            ApiError::InvalidCredentials { .. }
        ));
    }

    #[test]
    fn prefix_does_not_matter() {
        for prefix in [40_000u64, 50_000, 60_000, 70_000] {
            assert!(matches!(
                classify_engine_code(prefix + 424, "", &[]),
                ApiError::NoPairedDevices
            ));
        }
    }

    #[test]
    fn unmapped_codes_fall_through_to_engine() {
        let err = classify_engine_code(50_999, "boom", &[]);
        assert!(matches!(err, ApiError::Engine { code: 50_999, .. }));
    }

    #[test]
    fn overrides_win_over_suffix_table() {
        let overrides = [(40_424, ApiErrorKind::RateLimitExceeded)];
        assert!(matches!(
            classify_engine_code(40_424, "", &overrides),
            ApiError::RateLimitExceeded
        ));
        // other codes with the same suffix still use the table
        assert!(matches!(
            classify_engine_code(50_424, "", &overrides),
            ApiError::NoPairedDevices
        ));
    }

    #[test]
    fn pending_sentinel_is_invalid_request_with_marker_code() {
        let err = classify_engine_code(PENDING_RESPONSE_CODE, "pending", &[]);
        assert!(matches!(err, ApiError::InvalidRequest { .. }));
        assert!(err.is_pending_sentinel());
    }
}
