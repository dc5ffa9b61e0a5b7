//! SSO endpoints: login redirect, assertion consumer, logout consumer

use crate::handlers::{invalid_request, not_configured, server_error, AppState};
use crate::saml::SamlError;
use actix_web::{web, HttpResponse};
use chrono::Utc;
use log::{debug, error, info};
use serde::Deserialize;

#[derive(Deserialize)]
pub struct AcsMessage {
    #[serde(rename = "SAMLResponse")]
    saml_response: String,
    #[serde(rename = "RelayState")]
    relay_state: Option<String>,
}

#[derive(Deserialize)]
pub struct LogoutMessage {
    #[serde(rename = "SAMLRequest")]
    saml_request: String,
}

/// Start an SSO login: redirect the browser to the authority with a
/// signed AuthnRequest.
pub async fn login(state: web::Data<AppState>) -> HttpResponse {
    let Some(builder) = &state.sso_authn_builder else {
        return not_configured();
    };
    match builder.redirect_url(None, Utc::now()) {
        Ok(url) => HttpResponse::Found()
            .append_header(("Location", url))
            .finish(),
        Err(err) => {
            error!("authn request construction failed: {err}");
            server_error()
        }
    }
}

pub async fn acs_form(state: web::Data<AppState>, form: web::Form<AcsMessage>) -> HttpResponse {
    consume_response(&state, &form).await
}

pub async fn acs_query(state: web::Data<AppState>, query: web::Query<AcsMessage>) -> HttpResponse {
    consume_response(&state, &query).await
}

async fn consume_response(state: &AppState, message: &AcsMessage) -> HttpResponse {
    let Some(validator) = &state.sso_response_validator else {
        return not_configured();
    };
    let assertion = match validator.validate(&message.saml_response, Utc::now()).await {
        Ok(assertion) => assertion,
        Err(SamlError::Storage(err)) => {
            error!("assertion validation hit storage failure: {err}");
            return server_error();
        }
        Err(err) => {
            debug!("assertion rejected: {err}");
            return invalid_request();
        }
    };

    // the subject identifier keys the local session state
    if let Err(err) = state
        .reconciler
        .apply_sso_login(&assertion.name_id, &assertion)
        .await
    {
        error!("SSO login state update failed: {err}");
        return server_error();
    }
    info!("SSO login accepted for session {}", assertion.session_index);

    let location = message
        .relay_state
        .clone()
        .filter(|s| s.starts_with('/'))
        .unwrap_or_else(|| "/".to_string());
    HttpResponse::Found()
        .append_header(("Location", location))
        .finish()
}

pub async fn logout(
    state: web::Data<AppState>,
    query: web::Query<LogoutMessage>,
) -> HttpResponse {
    let Some(validator) = &state.sso_logout_validator else {
        return not_configured();
    };

    // peek at the subject to find the recorded session index
    let parsed = crate::saml::document::decode_redirect_message(&query.saml_request)
        .and_then(|xml| crate::saml::document::parse_logout_request(&xml));
    let name_id = match parsed {
        Ok(doc) => doc.name_id.unwrap_or_default(),
        Err(err) => {
            debug!("logout request rejected: {err}");
            return invalid_request();
        }
    };
    let recorded = match state.reconciler.recorded_session_index(&name_id).await {
        Ok(index) => index.unwrap_or_default(),
        Err(err) => {
            error!("logout state lookup failed: {err}");
            return server_error();
        }
    };

    match validator.validate(&query.saml_request, &recorded, Utc::now()) {
        Ok(event) => {
            if let Err(err) = state.reconciler.apply_sso_logout(&name_id).await {
                error!("SSO logout state update failed: {err}");
                return server_error();
            }
            info!("SSO logout accepted for session {}", event.session_index);
            HttpResponse::Ok().content_type("text/plain").body("ok")
        }
        Err(err) => {
            debug!("logout request rejected: {err}");
            invalid_request()
        }
    }
}
