//! HTTP surface: engine callback, SSO endpoints, OAuth callback,
//! heartbeat and health

pub mod engine;
pub mod oauth;
pub mod session;
pub mod sso;

use crate::auth::AuthProtocolService;
use crate::oauth::OAuthExchange;
use crate::reconciler::SessionReconciler;
use crate::saml::{AuthnRequestBuilder, LogoutRequestValidator, ResponseValidator};
use actix_web::{web, HttpResponse};
use std::sync::Arc;

/// Shared application state handed to every handler.
pub struct AppState {
    pub auth: Arc<AuthProtocolService>,
    pub reconciler: Arc<SessionReconciler>,
    pub sso_response_validator: Option<Arc<ResponseValidator>>,
    pub sso_logout_validator: Option<Arc<LogoutRequestValidator>>,
    pub sso_authn_builder: Option<Arc<AuthnRequestBuilder>>,
    pub oauth: Option<Arc<OAuthExchange>>,
}

/// Route table. The SSO and OAuth endpoints are always mounted; they
/// answer 404 when their modality is not configured.
pub fn configure_services(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(session::health))
        .route("/engine/callback", web::get().to(engine::callback))
        .route("/engine/callback", web::post().to(engine::callback))
        .route("/auth/native/login", web::post().to(session::native_login))
        .route("/auth/heartbeat", web::get().to(session::heartbeat))
        .route("/auth/sso/login", web::get().to(sso::login))
        .route("/auth/sso/acs", web::get().to(sso::acs_query))
        .route("/auth/sso/acs", web::post().to(sso::acs_form))
        .route("/auth/sso/logout", web::get().to(sso::logout))
        .route("/auth/oauth/callback", web::get().to(oauth::callback));
}

/// Callback failures never leak internals; both bodies are fixed.
pub(crate) fn invalid_request() -> HttpResponse {
    HttpResponse::BadRequest()
        .content_type("text/plain")
        .body("invalid request")
}

pub(crate) fn server_error() -> HttpResponse {
    HttpResponse::InternalServerError()
        .content_type("text/plain")
        .body("server error")
}

pub(crate) fn not_configured() -> HttpResponse {
    HttpResponse::NotFound()
        .content_type("text/plain")
        .body("modality not configured")
}
