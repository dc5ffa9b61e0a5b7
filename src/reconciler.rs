//! Per-user authorization state machine
//!
//! The reconciler owns [`UserAuthState`] and tolerates decisions arriving
//! out of band: engine callbacks, heartbeat polls and page loads all
//! converge on the same stored tri-state. This is the only layer that
//! translates raw failures into user-facing denial reasons; everything
//! below it propagates typed errors.

use crate::api::ApiError;
use crate::auth::{AuthProtocolService, AwaitError};
use crate::models::{AuthRequest, AuthResponse, DeOrbitCallback, Decision, SamlAssertion, UserAuthState};
use crate::store::{StoreError, UserStateStore};
use async_trait::async_trait;
use log::{error, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Seam between the reconciler and the native auth protocol.
#[async_trait]
pub trait AuthDriver: Send + Sync {
    /// Open a session auth request.
    ///
    /// # Errors
    ///
    /// Classified engine errors.
    async fn authenticate(&self, username: &str) -> Result<AuthRequest, ApiError>;

    /// Wait for the decision on an open request.
    ///
    /// # Errors
    ///
    /// Timeout at the ceiling, or a terminal engine error.
    async fn await_decision(
        &self,
        auth_request_id: &str,
        ceiling: Duration,
    ) -> Result<AuthResponse, AwaitError>;

    /// Revoke an auth request.
    ///
    /// # Errors
    ///
    /// Classified engine errors.
    async fn de_orbit(&self, auth_request_id: &str) -> Result<(), ApiError>;
}

#[async_trait]
impl AuthDriver for AuthProtocolService {
    async fn authenticate(&self, username: &str) -> Result<AuthRequest, ApiError> {
        AuthProtocolService::authenticate(self, username).await
    }

    async fn await_decision(
        &self,
        auth_request_id: &str,
        ceiling: Duration,
    ) -> Result<AuthResponse, AwaitError> {
        AuthProtocolService::await_decision(self, auth_request_id, ceiling).await
    }

    async fn de_orbit(&self, auth_request_id: &str) -> Result<(), ApiError> {
        AuthProtocolService::de_orbit(self, auth_request_id).await
    }
}

/// User-facing login denial reasons. Raw engine errors never reach the
/// login surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginDenial {
    /// The user answered "deny"
    Denied,
    NoPairedDevices,
    NoSuchUser,
    RateLimited,
    /// No answer before the polling ceiling, or the request expired
    TimedOut,
    EngineFailure,
}

impl LoginDenial {
    #[must_use]
    pub fn user_message(self) -> &'static str {
        match self {
            Self::Denied => "Authentication was denied from your device",
            Self::NoPairedDevices => "No devices are paired with this account",
            Self::NoSuchUser => "This account is not known to the authentication service",
            Self::RateLimited => "Too many attempts, try again shortly",
            Self::TimedOut => "The login request was not answered in time",
            Self::EngineFailure => "The authentication service is unavailable",
        }
    }
}

/// Heartbeat verdict for an established session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionVerdict {
    Active,
    Revoked,
}

#[derive(Debug, Error)]
pub enum UnpairError {
    /// The local account has no password; unpairing would lock it out
    #[error("cannot unpair an account without a usable local password")]
    PasswordRequired,
    #[error(transparent)]
    Storage(#[from] StoreError),
}

pub struct SessionReconciler {
    driver: Arc<dyn AuthDriver>,
    states: Arc<dyn UserStateStore>,
    poll_ceiling: Duration,
}

impl SessionReconciler {
    #[must_use]
    pub fn new(
        driver: Arc<dyn AuthDriver>,
        states: Arc<dyn UserStateStore>,
        poll_ceiling: Duration,
    ) -> Self {
        Self {
            driver,
            states,
            poll_ceiling,
        }
    }

    /// Full native login: open the auth request, record it as pending,
    /// then wait for the decision.
    ///
    /// # Errors
    ///
    /// A [`LoginDenial`] describing why the login did not complete. The
    /// underlying cause is logged here and not propagated.
    pub async fn native_login(
        &self,
        user_id: &str,
        external_username: &str,
    ) -> Result<(), LoginDenial> {
        let request = self
            .driver
            .authenticate(external_username)
            .await
            .map_err(|err| self.translate_api_error(user_id, err))?;

        let mut state = self.load_or_default(user_id).await.map_err(|err| {
            error!("state load failed for {user_id}: {err}");
            LoginDenial::EngineFailure
        })?;
        state.external_username = Some(external_username.to_string());
        state.pending_auth_request_id = Some(request.auth_request_id.clone());
        state.authorized = Decision::Pending;
        self.save(user_id, &state).await?;

        match self
            .driver
            .await_decision(&request.auth_request_id, self.poll_ceiling)
            .await
        {
            Ok(response) if response.authorized => {
                self.apply_auth_response(&response).await.map_err(|err| {
                    error!("state update after login failed for {user_id}: {err}");
                    LoginDenial::EngineFailure
                })?;
                Ok(())
            }
            Ok(response) => {
                self.apply_auth_response(&response).await.map_err(|err| {
                    error!("state update after denial failed for {user_id}: {err}");
                    LoginDenial::EngineFailure
                })?;
                Err(LoginDenial::Denied)
            }
            Err(AwaitError::Timeout) => Err(LoginDenial::TimedOut),
            Err(AwaitError::Api(err)) => Err(self.translate_api_error(user_id, err)),
        }
    }

    /// Record a decision that arrived via callback or poll. The user is
    /// located by the pending auth request id; a decision for a
    /// superseded id matches nobody and is dropped.
    ///
    /// # Errors
    ///
    /// `StoreError` on storage failure.
    pub async fn apply_auth_response(&self, response: &AuthResponse) -> Result<(), StoreError> {
        let Some((user_id, mut state)) = self
            .states
            .find_by_pending_auth_request(&response.auth_request_id)
            .await?
        else {
            warn!(
                "decision for unknown auth request {} dropped",
                response.auth_request_id
            );
            return Ok(());
        };

        state.authorized = if response.authorized {
            Decision::Authorized
        } else {
            Decision::Denied
        };
        state.external_user_hash = Some(response.user_hash.clone());
        // pairing reveals the push id; store it in place of the username
        // so the username never has to be persisted again
        if let Some(push_id) = &response.user_push_id {
            state.external_username = Some(push_id.clone());
        }
        self.states.save(&user_id, &state).await
    }

    /// Apply an authority-initiated revocation: deny the session and
    /// revoke the recorded auth request. Repeating the same de-orbit is
    /// harmless; the state is already denied and revocation is a no-op.
    ///
    /// # Errors
    ///
    /// `StoreError` on storage failure.
    pub async fn apply_de_orbit(&self, callback: &DeOrbitCallback) -> Result<(), StoreError> {
        let Some((user_id, mut state)) =
            self.states.find_by_user_hash(&callback.user_hash).await?
        else {
            warn!("de-orbit for unknown user hash dropped");
            return Ok(());
        };

        state.authorized = Decision::Denied;
        self.states.save(&user_id, &state).await?;

        if let Some(auth_request_id) = &state.pending_auth_request_id {
            if let Err(err) = self.driver.de_orbit(auth_request_id).await {
                warn!("revoke of {auth_request_id} failed: {err}");
            }
        }
        Ok(())
    }

    /// Record a validated SSO login.
    ///
    /// # Errors
    ///
    /// `StoreError` on storage failure.
    pub async fn apply_sso_login(
        &self,
        user_id: &str,
        assertion: &SamlAssertion,
    ) -> Result<(), StoreError> {
        let mut state = self.load_or_default(user_id).await?;
        state.authorized = Decision::Authorized;
        state.sso_session_index = Some(assertion.session_index.clone());
        state.external_username = Some(assertion.name_id.clone());
        self.states.save(user_id, &state).await
    }

    /// Record a validated SSO logout: the session index is cleared and
    /// the session denied so the next heartbeat forces a local logout.
    ///
    /// # Errors
    ///
    /// `StoreError` on storage failure.
    pub async fn apply_sso_logout(&self, user_id: &str) -> Result<(), StoreError> {
        let mut state = self.load_or_default(user_id).await?;
        state.authorized = Decision::Denied;
        state.sso_session_index = None;
        self.states.save(user_id, &state).await
    }

    /// The SSO session index recorded at login, if any.
    ///
    /// # Errors
    ///
    /// `StoreError` on storage failure.
    pub async fn recorded_session_index(
        &self,
        user_id: &str,
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .states
            .load(user_id)
            .await?
            .and_then(|state| state.sso_session_index))
    }

    /// Heartbeat/page-load check. A denied state forces a local logout
    /// and is then reset; pending and authorized states leave the
    /// session alone.
    ///
    /// # Errors
    ///
    /// `StoreError` on storage failure.
    pub async fn verify_session(&self, user_id: &str) -> Result<SessionVerdict, StoreError> {
        let Some(mut state) = self.states.load(user_id).await? else {
            return Ok(SessionVerdict::Active);
        };
        if state.authorized.is_denied() {
            state.authorized = Decision::Pending;
            state.pending_auth_request_id = None;
            self.states.save(user_id, &state).await?;
            return Ok(SessionVerdict::Revoked);
        }
        Ok(SessionVerdict::Active)
    }

    /// Remove the pairing. Refused when the local account has no usable
    /// password, which would otherwise lock the user out entirely.
    ///
    /// # Errors
    ///
    /// `UnpairError::PasswordRequired` or a storage failure.
    pub async fn unpair(&self, user_id: &str, has_local_password: bool) -> Result<(), UnpairError> {
        if !has_local_password {
            return Err(UnpairError::PasswordRequired);
        }
        self.states.save(user_id, &UserAuthState::default()).await?;
        Ok(())
    }

    async fn load_or_default(&self, user_id: &str) -> Result<UserAuthState, StoreError> {
        Ok(self.states.load(user_id).await?.unwrap_or_default())
    }

    async fn save(&self, user_id: &str, state: &UserAuthState) -> Result<(), LoginDenial> {
        self.states.save(user_id, state).await.map_err(|err| {
            error!("state save failed for {user_id}: {err}");
            LoginDenial::EngineFailure
        })
    }

    fn translate_api_error(&self, user_id: &str, err: ApiError) -> LoginDenial {
        let denial = match &err {
            ApiError::NoPairedDevices => LoginDenial::NoPairedDevices,
            ApiError::NoSuchUser => LoginDenial::NoSuchUser,
            ApiError::RateLimitExceeded => LoginDenial::RateLimited,
            ApiError::ExpiredAuthRequest => LoginDenial::TimedOut,
            _ => LoginDenial::EngineFailure,
        };
        error!("login for {user_id} failed: {err}");
        denial
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryUserStateStore;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted driver: answers authenticate with a fixed id and
    /// await_decision from a queue.
    struct ScriptedDriver {
        auth_request_id: String,
        outcomes: Mutex<Vec<Result<AuthResponse, AwaitError>>>,
        revoked: Mutex<Vec<String>>,
    }

    impl ScriptedDriver {
        fn new(auth_request_id: &str, outcomes: Vec<Result<AuthResponse, AwaitError>>) -> Self {
            Self {
                auth_request_id: auth_request_id.to_string(),
                outcomes: Mutex::new(outcomes),
                revoked: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AuthDriver for ScriptedDriver {
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
            self.revoked.lock().unwrap().push(auth_request_id.to_string());
            Ok(())
        }
    }

    fn response(authorized: bool) -> AuthResponse {
        AuthResponse {
            auth_request_id: "req-1".to_string(),
            user_hash: "hash-1".to_string(),
            user_push_id: Some("push-1".to_string()),
            device_id: None,
            authorized,
            organization_user_id: None,
        }
    }

    fn reconciler(
        driver: Arc<ScriptedDriver>,
    ) -> (SessionReconciler, Arc<InMemoryUserStateStore>) {
        let states = Arc::new(InMemoryUserStateStore::new());
        (
            SessionReconciler::new(driver, Arc::clone(&states) as _, Duration::from_secs(60)),
            states,
        )
    }

    #[tokio::test]
    async fn authorized_login_records_hash_and_push_id() {
        let driver = Arc::new(ScriptedDriver::new("req-1", vec![Ok(response(true))]));
        let (reconciler, states) = reconciler(driver);

        reconciler.native_login("7", "alice").await.unwrap();

        let state = states.load("7").await.unwrap().unwrap();
        assert_eq!(state.authorized, Decision::Authorized);
        assert_eq!(state.external_user_hash.as_deref(), Some("hash-1"));
        // the push id replaces the username after pairing
        assert_eq!(state.external_username.as_deref(), Some("push-1"));
    }

    #[tokio::test]
    async fn user_denial_is_reported_and_recorded() {
        let driver = Arc::new(ScriptedDriver::new("req-1", vec![Ok(response(false))]));
        let (reconciler, states) = reconciler(driver);

        let result = reconciler.native_login("7", "alice").await;
        assert_eq!(result.unwrap_err(), LoginDenial::Denied);
        let state = states.load("7").await.unwrap().unwrap();
        assert_eq!(state.authorized, Decision::Denied);
    }

    #[tokio::test]
    async fn timeout_leaves_state_pending() {
        let driver = Arc::new(ScriptedDriver::new("req-1", vec![Err(AwaitError::Timeout)]));
        let (reconciler, states) = reconciler(driver);

        let result = reconciler.native_login("7", "alice").await;
        assert_eq!(result.unwrap_err(), LoginDenial::TimedOut);
        let state = states.load("7").await.unwrap().unwrap();
        assert_eq!(state.authorized, Decision::Pending);
    }

    #[tokio::test]
    async fn stale_decision_matches_nobody() {
        let driver = Arc::new(ScriptedDriver::new("req-1", vec![]));
        let (reconciler, states) = reconciler(driver);
        // no user is waiting on req-9
        reconciler.apply_auth_response(&AuthResponse {
            auth_request_id: "req-9".to_string(),
            ..response(true)
        })
        .await
        .unwrap();
        assert!(states.load("7").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn de_orbit_denies_and_revokes() {
        let driver = Arc::new(ScriptedDriver::new("req-1", vec![Ok(response(true))]));
        let (reconciler, states) = reconciler(Arc::clone(&driver));
        reconciler.native_login("7", "alice").await.unwrap();

        let callback = DeOrbitCallback {
            de_orbit_time: chrono::Utc::now(),
            user_hash: "hash-1".to_string(),
        };
        reconciler.apply_de_orbit(&callback).await.unwrap();
        assert_eq!(
            states.load("7").await.unwrap().unwrap().authorized,
            Decision::Denied
        );
        assert_eq!(driver.revoked.lock().unwrap().as_slice(), ["req-1"]);

        // applying the same de-orbit again is harmless
        reconciler.apply_de_orbit(&callback).await.unwrap();
        assert_eq!(
            states.load("7").await.unwrap().unwrap().authorized,
            Decision::Denied
        );
    }

    #[tokio::test]
    async fn heartbeat_revokes_exactly_once() {
        let driver = Arc::new(ScriptedDriver::new("req-1", vec![Ok(response(true))]));
        let (reconciler, _) = reconciler(driver);
        reconciler.native_login("7", "alice").await.unwrap();

        assert_eq!(
            reconciler.verify_session("7").await.unwrap(),
            SessionVerdict::Active
        );

        let callback = DeOrbitCallback {
            de_orbit_time: chrono::Utc::now(),
            user_hash: "hash-1".to_string(),
        };
        reconciler.apply_de_orbit(&callback).await.unwrap();

        assert_eq!(
            reconciler.verify_session("7").await.unwrap(),
            SessionVerdict::Revoked
        );
        // the revocation was consumed; the reset state is not a deny
        assert_eq!(
            reconciler.verify_session("7").await.unwrap(),
            SessionVerdict::Active
        );
    }

    #[tokio::test]
    async fn pending_is_never_a_deny() {
        let driver = Arc::new(ScriptedDriver::new("req-1", vec![Err(AwaitError::Timeout)]));
        let (reconciler, _) = reconciler(driver);
        let _ = reconciler.native_login("7", "alice").await;
        assert_eq!(
            reconciler.verify_session("7").await.unwrap(),
            SessionVerdict::Active
        );
    }

    #[tokio::test]
    async fn sso_lifecycle() {
        let driver = Arc::new(ScriptedDriver::new("req-1", vec![]));
        let (reconciler, states) = reconciler(driver);
        let assertion = SamlAssertion {
            name_id: "user@example.com".to_string(),
            session_index: "_sess1".to_string(),
            attributes: HashMap::new(),
        };
        reconciler.apply_sso_login("7", &assertion).await.unwrap();
        let state = states.load("7").await.unwrap().unwrap();
        assert_eq!(state.authorized, Decision::Authorized);
        assert_eq!(state.sso_session_index.as_deref(), Some("_sess1"));

        reconciler.apply_sso_logout("7").await.unwrap();
        let state = states.load("7").await.unwrap().unwrap();
        assert_eq!(state.authorized, Decision::Denied);
        assert!(state.sso_session_index.is_none());
    }

    #[tokio::test]
    async fn unpair_requires_local_password() {
        let driver = Arc::new(ScriptedDriver::new("req-1", vec![Ok(response(true))]));
        let (reconciler, states) = reconciler(driver);
        reconciler.native_login("7", "alice").await.unwrap();

        assert!(matches!(
            reconciler.unpair("7", false).await,
            Err(UnpairError::PasswordRequired)
        ));
        reconciler.unpair("7", true).await.unwrap();
        assert_eq!(
            states.load("7").await.unwrap().unwrap(),
            UserAuthState::default()
        );
    }
}
