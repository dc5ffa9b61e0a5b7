//! OAuth callback endpoint

use crate::handlers::{invalid_request, not_configured, server_error, AppState};
use crate::oauth::{OAuthError, OAuthExchange};
use actix_web::{web, HttpResponse};
use log::{debug, error};
use serde::Deserialize;
use serde_json::json;

#[derive(Deserialize)]
pub struct CallbackQuery {
    code: Option<String>,
    error: Option<String>,
}

/// Validate the callback code and exchange it for tokens. The token set
/// is returned to the host application as JSON; cookie or session
/// transport is its concern, not ours.
pub async fn callback(
    state: web::Data<AppState>,
    query: web::Query<CallbackQuery>,
) -> HttpResponse {
    let Some(exchange) = &state.oauth else {
        return not_configured();
    };
    if let Some(err) = &query.error {
        debug!("authority returned callback error: {err}");
        return invalid_request();
    }
    let Some(code) = &query.code else {
        return invalid_request();
    };
    // shape gate runs before any token-endpoint traffic
    if OAuthExchange::validate_code(code).is_err() {
        debug!("callback code failed the shape check");
        return invalid_request();
    }

    match exchange.exchange_code(code).await {
        Ok(tokens) => HttpResponse::Ok().json(json!({
            "user": tokens.user,
            "access_token": tokens.access_token,
            "refresh_token": tokens.refresh_token,
            "expires_in": tokens.expires_in,
        })),
        Err(err @ (OAuthError::InvalidCode | OAuthError::InvalidTokenResponse(_))) => {
            debug!("token exchange rejected: {err}");
            invalid_request()
        }
        Err(err) => {
            error!("token exchange failed: {err}");
            server_error()
        }
    }
}
