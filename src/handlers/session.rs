//! Session endpoints: native login, heartbeat and health

use crate::handlers::{server_error, AppState};
use crate::reconciler::SessionVerdict;
use actix_web::{web, HttpResponse};
use log::error;
use serde::Deserialize;
use serde_json::json;

#[derive(Deserialize)]
pub struct NativeLoginRequest {
    pub user: String,
    pub username: String,
}

#[derive(Deserialize)]
pub struct HeartbeatQuery {
    pub user: String,
}

/// Drive a full native login: open the auth request and wait for the
/// decision. The response carries only the translated outcome.
pub async fn native_login(
    state: web::Data<AppState>,
    body: web::Json<NativeLoginRequest>,
) -> HttpResponse {
    match state
        .reconciler
        .native_login(&body.user, &body.username)
        .await
    {
        Ok(()) => HttpResponse::Ok().json(json!({"authorized": true})),
        Err(denial) => HttpResponse::Forbidden().json(json!({
            "authorized": false,
            "reason": denial.user_message(),
        })),
    }
}

/// Still-authenticated check the host application calls from its own
/// session machinery.
pub async fn heartbeat(
    state: web::Data<AppState>,
    query: web::Query<HeartbeatQuery>,
) -> HttpResponse {
    match state.reconciler.verify_session(&query.user).await {
        Ok(SessionVerdict::Active) => HttpResponse::Ok().json(json!({"authorized": "active"})),
        Ok(SessionVerdict::Revoked) => {
            HttpResponse::Ok().json(json!({"authorized": "revoked"}))
        }
        Err(err) => {
            error!("heartbeat lookup failed: {err}");
            server_error()
        }
    }
}

pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({"status": "healthy"}))
}
