//! Auth request lifecycle against the engine
//!
//! An auth request moves from `Initiated` to exactly one of authorized,
//! denied, expired or errored. The service never blocks waiting for the
//! decision; [`crate::auth::poll`] owns the waiting.

use crate::api::{ApiError, ApiTransport};
use crate::api::transport::LogAction;
use crate::crypto::CryptoEngine;
use crate::models::{AuthRequest, AuthResponse, DeOrbitCallback};
use base64::{engine::general_purpose::STANDARD, Engine};
use log::{debug, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of a single poll round.
#[derive(Debug, Clone)]
pub enum PollStatus {
    /// The user has not answered yet
    Pending,
    /// Terminal decision arrived
    Complete(AuthResponse),
}

/// A validated engine callback, dispatched on its query parameters.
#[derive(Debug, Clone)]
pub enum CallbackEvent {
    Auth(AuthResponse),
    DeOrbit(DeOrbitCallback),
}

/// Inner JSON of the RSA-encrypted `auth` package.
#[derive(Debug, Deserialize)]
struct AuthPackage {
    auth_request: String,
    response: String,
    device_id: Option<String>,
}

/// Issues auth requests and interprets engine decisions and callbacks.
pub struct AuthProtocolService {
    transport: Arc<ApiTransport>,
    crypto: Arc<CryptoEngine>,
}

impl AuthProtocolService {
    #[must_use]
    pub fn new(transport: Arc<ApiTransport>, crypto: Arc<CryptoEngine>) -> Self {
        Self { transport, crypto }
    }

    /// Open a transactional (non-session) auth request. Returns
    /// immediately; the decision arrives later via poll or callback.
    ///
    /// # Errors
    ///
    /// Classified engine errors: no paired devices, no such user, rate
    /// limit, invalid credentials, communication failure.
    pub async fn authorize(&self, username: &str) -> Result<AuthRequest, ApiError> {
        self.open_request(username, false).await
    }

    /// Open a session auth request.
    ///
    /// # Errors
    ///
    /// Same as [`authorize`](Self::authorize).
    pub async fn authenticate(&self, username: &str) -> Result<AuthRequest, ApiError> {
        self.open_request(username, true).await
    }

    async fn open_request(&self, username: &str, session: bool) -> Result<AuthRequest, ApiError> {
        let auth_request_id = self.transport.auth(username, session).await?;
        debug!("opened auth request {auth_request_id} (session={session})");
        Ok(AuthRequest {
            username: username.to_string(),
            session_request: session,
            auth_request_id,
        })
    }

    /// Poll the engine once for the decision on `auth_request_id`.
    ///
    /// The engine's "not answered yet" sentinel maps to
    /// `PollStatus::Pending`; every other engine error propagates. When
    /// the decision is an authorization, an `Authenticate` audit record is
    /// sent back to the engine.
    ///
    /// # Errors
    ///
    /// `InvalidResponse` when the decrypted package does not belong to
    /// `auth_request_id`, otherwise classified engine errors.
    pub async fn get_status(&self, auth_request_id: &str) -> Result<PollStatus, ApiError> {
        let envelope = match self.transport.poll(auth_request_id).await {
            Ok(envelope) => envelope,
            Err(err) if err.is_pending_sentinel() => return Ok(PollStatus::Pending),
            Err(err) => return Err(err),
        };

        let package = self.decrypt_auth_package(&envelope.auth)?;
        if package.auth_request != auth_request_id {
            return Err(ApiError::InvalidResponse(
                "decision package does not match the polled auth request".to_string(),
            ));
        }

        let authorized = package.response == "true";
        if authorized {
            // Audit failure must not undo a completed authentication
            if let Err(err) = self
                .transport
                .log(auth_request_id, LogAction::Authenticate, true)
                .await
            {
                warn!("authenticate audit log failed for {auth_request_id}: {err}");
            }
        }

        Ok(PollStatus::Complete(AuthResponse {
            auth_request_id: package.auth_request,
            user_hash: envelope.user_hash,
            user_push_id: envelope.user_push_id,
            device_id: package.device_id,
            authorized,
            organization_user_id: envelope.organization_user_id,
        }))
    }

    /// Revoke an auth request at the engine. Safe to repeat: revoking an
    /// already-revoked request is a no-op on the engine side.
    ///
    /// # Errors
    ///
    /// Classified engine errors or transport failures.
    pub async fn de_orbit(&self, auth_request_id: &str) -> Result<(), ApiError> {
        self.transport
            .log(auth_request_id, LogAction::Revoke, true)
            .await
    }

    /// Dispatch an engine callback on its query parameters.
    ///
    /// A `deorbit` + `signature` pair is a revocation: the signature is
    /// verified against the engine public key before the payload is
    /// trusted. An `auth` + `auth_request` + `user_hash` triple is a
    /// decision package; its decrypted inner auth request id must equal
    /// the outer parameter. Anything else is `UnknownCallbackAction`.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for bad signatures or mismatched packages,
    /// `UnknownCallbackAction` for unrecognized parameter sets.
    pub async fn handle_callback(
        &self,
        query: &HashMap<String, String>,
    ) -> Result<CallbackEvent, ApiError> {
        if let (Some(deorbit), Some(signature)) = (query.get("deorbit"), query.get("signature")) {
            return self.handle_de_orbit(deorbit, signature).await;
        }
        if let (Some(auth), Some(auth_request), Some(user_hash)) = (
            query.get("auth"),
            query.get("auth_request"),
            query.get("user_hash"),
        ) {
            return self.handle_auth_callback(auth, auth_request, user_hash, query);
        }
        let keys: Vec<&str> = query.keys().map(String::as_str).collect();
        Err(ApiError::UnknownCallbackAction(keys.join(",")))
    }

    async fn handle_de_orbit(
        &self,
        deorbit: &str,
        signature: &str,
    ) -> Result<CallbackEvent, ApiError> {
        let public_key = self.transport.public_key().await?;
        let signature_bytes = STANDARD.decode(signature).map_err(|e| {
            ApiError::InvalidRequest {
                code: 0,
                message: format!("de-orbit signature base64: {e}"),
            }
        })?;
        let valid = self
            .crypto
            .verify(&signature_bytes, deorbit.as_bytes(), &public_key)
            .unwrap_or(false);
        if !valid {
            return Err(ApiError::InvalidRequest {
                code: 0,
                message: "de-orbit signature verification failed".to_string(),
            });
        }
        let callback: DeOrbitCallback = serde_json::from_str(deorbit).map_err(|e| {
            ApiError::InvalidRequest {
                code: 0,
                message: format!("de-orbit payload: {e}"),
            }
        })?;
        Ok(CallbackEvent::DeOrbit(callback))
    }

    fn handle_auth_callback(
        &self,
        auth: &str,
        auth_request: &str,
        user_hash: &str,
        query: &HashMap<String, String>,
    ) -> Result<CallbackEvent, ApiError> {
        let package = self.decrypt_auth_package(auth)?;
        if package.auth_request != auth_request {
            return Err(ApiError::InvalidRequest {
                code: 0,
                message: "callback package does not match the auth_request parameter".to_string(),
            });
        }
        Ok(CallbackEvent::Auth(AuthResponse {
            authorized: package.response == "true",
            auth_request_id: package.auth_request,
            user_hash: user_hash.to_string(),
            user_push_id: query.get("user_push_id").cloned().filter(|s| !s.is_empty()),
            device_id: package.device_id,
            organization_user_id: query
                .get("organization_user")
                .cloned()
                .filter(|s| !s.is_empty()),
        }))
    }

    fn decrypt_auth_package(&self, auth: &str) -> Result<AuthPackage, ApiError> {
        let ciphertext = STANDARD
            .decode(auth)
            .map_err(|e| ApiError::InvalidResponse(format!("auth package base64: {e}")))?;
        let plaintext = self
            .crypto
            .decrypt_asymmetric(&ciphertext)
            .map_err(|e| ApiError::InvalidResponse(format!("auth package: {e}")))?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| ApiError::InvalidResponse(format!("auth package JSON: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_package_parses_decision_fields() {
        let package: AuthPackage = serde_json::from_str(
            r#"{"auth_request": "req-1", "response": "true", "device_id": "dev-9"}"#,
        )
        .unwrap();
        assert_eq!(package.auth_request, "req-1");
        assert_eq!(package.response, "true");
        assert_eq!(package.device_id.as_deref(), Some("dev-9"));
    }

    #[test]
    fn auth_package_tolerates_missing_device() {
        let package: AuthPackage =
            serde_json::from_str(r#"{"auth_request": "req-1", "response": "false"}"#).unwrap();
        assert!(package.device_id.is_none());
    }
}
