//! Scripted stand-in for the native auth protocol

use crate::api::ApiError;
use crate::auth::AwaitError;
use crate::models::{AuthRequest, AuthResponse};
use crate::reconciler::AuthDriver;
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

/// Answers `authenticate` with a fixed request id and `await_decision`
/// from a queue of scripted outcomes. Revoked ids are recorded for
/// assertion.
pub struct ScriptedAuthDriver {
    auth_request_id: String,
    outcomes: Mutex<Vec<Result<AuthResponse, AwaitError>>>,
    revoked: Mutex<Vec<String>>,
}

impl ScriptedAuthDriver {
    #[must_use]
    pub fn new(auth_request_id: &str, outcomes: Vec<Result<AuthResponse, AwaitError>>) -> Self {
        Self {
            auth_request_id: auth_request_id.to_string(),
            outcomes: Mutex::new(outcomes),
            revoked: Mutex::new(Vec::new()),
        }
    }

    /// Auth request ids revoked so far, in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned (test-only code).
    #[must_use]
    pub fn revoked(&self) -> Vec<String> {
        self.revoked.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuthDriver for ScriptedAuthDriver {
    async fn authenticate(&self, username: &str) -> Result<AuthRequest, ApiError> {
        Ok(AuthRequest {
            username: username.to_string(),
            session_request: true,
            auth_request_id: self.auth_request_id.clone(),
        })
    }

    async fn await_decision(
        &self,
        _auth_request_id: &str,
        _ceiling: Duration,
    ) -> Result<AuthResponse, AwaitError> {
        self.outcomes.lock().unwrap().remove(0)
    }

    async fn de_orbit(&self, auth_request_id: &str) -> Result<(), ApiError> {
        self.revoked
            .lock()
            .unwrap()
            .push(auth_request_id.to_string());
        Ok(())
    }
}
