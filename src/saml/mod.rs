//! SAML2 SSO: message parsing, signature verification and the
//! validation pipelines for responses and logout requests

pub mod authn_request;
pub mod document;
pub mod request;
pub mod response;
pub mod signature;

use crate::store::StoreError;
use thiserror::Error;

pub use authn_request::AuthnRequestBuilder;
pub use request::{LogoutEvent, LogoutRequestValidator};
pub use response::ResponseValidator;

/// Static configuration for one SSO authority relationship.
#[derive(Debug, Clone)]
pub struct SsoProfile {
    /// Our own entity id, matched against audience restrictions
    pub entity_id: String,
    /// X.509 certificate (PEM or bare base64) the authority signs with
    pub authority_certificate: String,
    /// Assertion consumer URL responses must be addressed to
    pub acs_url: String,
    /// Our logout endpoint, matched against LogoutRequest destinations
    pub logout_url: String,
    /// Authority single-sign-on URL for outbound AuthnRequests
    pub login_url: String,
}

/// Validation failures, ordered by pipeline stage. Every variant is a
/// hard rejection; the pipelines short-circuit on the first failure.
#[derive(Debug, Error)]
pub enum SamlError {
    /// Undecodable, oversized or structurally broken message
    #[error("malformed SAML message: {0}")]
    Malformed(String),

    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("response carries no assertions")]
    NoAssertions,

    #[error("audience restriction does not include {expected}")]
    AudienceMismatch { expected: String },

    /// Assertion evaluated outside its validity window
    #[error("assertion not valid at evaluation time: {0}")]
    OutsideWindow(String),

    #[error("destination mismatch: expected {expected}, got {actual}")]
    DestinationMismatch { expected: String, actual: String },

    /// Session index already consumed by an earlier login
    #[error("session index replayed: {0}")]
    Replayed(String),

    /// Logout named a session other than the one on record
    #[error("logout session index does not match the recorded session")]
    SessionIndexMismatch,

    #[error(transparent)]
    Storage(#[from] StoreError),
}
