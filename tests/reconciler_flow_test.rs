//! Full session lifecycles through the reconciler with a scripted
//! protocol driver and in-memory state.

use launchgate::api::ApiError;
use launchgate::auth::AwaitError;
use launchgate::models::{AuthResponse, DeOrbitCallback, Decision, SamlAssertion};
use launchgate::reconciler::{LoginDenial, SessionReconciler, SessionVerdict};
use launchgate::store::{InMemoryUserStateStore, UserStateStore};
use launchgate::testing::ScriptedAuthDriver;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

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
    driver: Arc<ScriptedAuthDriver>,
) -> (SessionReconciler, Arc<InMemoryUserStateStore>) {
    let states = Arc::new(InMemoryUserStateStore::new());
    (
        SessionReconciler::new(driver, Arc::clone(&states) as _, Duration::from_secs(60)),
        states,
    )
}

#[tokio::test]
async fn login_de_orbit_and_heartbeat_lifecycle() {
    let driver = Arc::new(ScriptedAuthDriver::new("req-1", vec![Ok(response(true))]));
    let (reconciler, states) = reconciler(Arc::clone(&driver));

    reconciler.native_login("7", "alice").await.unwrap();
    let state = states.load("7").await.unwrap().unwrap();
    assert_eq!(state.authorized, Decision::Authorized);
    assert_eq!(state.external_user_hash.as_deref(), Some("hash-1"));
    assert_eq!(
        reconciler.verify_session("7").await.unwrap(),
        SessionVerdict::Active
    );

    reconciler
        .apply_de_orbit(&DeOrbitCallback {
            de_orbit_time: chrono::Utc::now(),
            user_hash: "hash-1".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(driver.revoked(), ["req-1"]);

    // the revocation forces exactly one logout, then the slate is clean
    assert_eq!(
        reconciler.verify_session("7").await.unwrap(),
        SessionVerdict::Revoked
    );
    assert_eq!(
        reconciler.verify_session("7").await.unwrap(),
        SessionVerdict::Active
    );
}

#[tokio::test]
async fn engine_denials_translate_to_user_facing_reasons() {
    let driver = Arc::new(ScriptedAuthDriver::new(
        "req-1",
        vec![
            Err(AwaitError::Api(ApiError::NoPairedDevices)),
            Err(AwaitError::Api(ApiError::RateLimitExceeded)),
            Err(AwaitError::Api(ApiError::ExpiredAuthRequest)),
        ],
    ));
    let (reconciler, _) = reconciler(driver);

    assert_eq!(
        reconciler.native_login("7", "alice").await.unwrap_err(),
        LoginDenial::NoPairedDevices
    );
    assert_eq!(
        reconciler.native_login("7", "alice").await.unwrap_err(),
        LoginDenial::RateLimited
    );
    assert_eq!(
        reconciler.native_login("7", "alice").await.unwrap_err(),
        LoginDenial::TimedOut
    );
}

#[tokio::test]
async fn timed_out_login_can_be_retried() {
    let driver = Arc::new(ScriptedAuthDriver::new(
        "req-1",
        vec![Err(AwaitError::Timeout), Ok(response(true))],
    ));
    let (reconciler, states) = reconciler(driver);

    assert_eq!(
        reconciler.native_login("7", "alice").await.unwrap_err(),
        LoginDenial::TimedOut
    );
    // the pending state never counts as a deny
    assert_eq!(
        reconciler.verify_session("7").await.unwrap(),
        SessionVerdict::Active
    );

    reconciler.native_login("7", "alice").await.unwrap();
    assert_eq!(
        states.load("7").await.unwrap().unwrap().authorized,
        Decision::Authorized
    );
}

#[tokio::test]
async fn denied_login_revokes_the_session_once() {
    let driver = Arc::new(ScriptedAuthDriver::new("req-1", vec![Ok(response(false))]));
    let (reconciler, _) = reconciler(driver);

    assert_eq!(
        reconciler.native_login("7", "alice").await.unwrap_err(),
        LoginDenial::Denied
    );
    assert_eq!(
        reconciler.verify_session("7").await.unwrap(),
        SessionVerdict::Revoked
    );
    assert_eq!(
        reconciler.verify_session("7").await.unwrap(),
        SessionVerdict::Active
    );
}

#[tokio::test]
async fn sso_login_records_the_index_a_remote_logout_consumes() {
    let driver = Arc::new(ScriptedAuthDriver::new("req-1", vec![]));
    let (reconciler, _) = reconciler(driver);

    let assertion = SamlAssertion {
        name_id: "user@example.com".to_string(),
        session_index: "_sess1".to_string(),
        attributes: HashMap::new(),
    };
    reconciler.apply_sso_login("7", &assertion).await.unwrap();
    assert_eq!(
        reconciler.recorded_session_index("7").await.unwrap().as_deref(),
        Some("_sess1")
    );

    reconciler.apply_sso_logout("7").await.unwrap();
    assert!(reconciler
        .recorded_session_index("7")
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        reconciler.verify_session("7").await.unwrap(),
        SessionVerdict::Revoked
    );
}
