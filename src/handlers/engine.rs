//! Engine callback endpoint
//!
//! Decisions and de-orbits arrive here server-to-server. Validation
//! failures answer 400 and unexpected failures 500, both with fixed
//! bodies so the engine (or anyone probing the endpoint) learns nothing
//! about internal state.

use crate::api::ApiError;
use crate::auth::CallbackEvent;
use crate::handlers::{invalid_request, server_error, AppState};
use actix_web::{web, HttpResponse};
use log::{debug, error};
use std::collections::HashMap;

pub async fn callback(
    state: web::Data<AppState>,
    query: web::Query<HashMap<String, String>>,
) -> HttpResponse {
    let event = match state.auth.handle_callback(&query).await {
        Ok(event) => event,
        Err(err @ (ApiError::InvalidRequest { .. } | ApiError::UnknownCallbackAction(_))) => {
            debug!("callback rejected: {err}");
            return invalid_request();
        }
        Err(err) => {
            error!("callback processing failed: {err}");
            return server_error();
        }
    };

    let applied = match event {
        CallbackEvent::Auth(response) => state.reconciler.apply_auth_response(&response).await,
        CallbackEvent::DeOrbit(de_orbit) => state.reconciler.apply_de_orbit(&de_orbit).await,
    };
    match applied {
        Ok(()) => HttpResponse::Ok().content_type("text/plain").body("ok"),
        Err(err) => {
            error!("callback state update failed: {err}");
            server_error()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[test]
    fn fixed_bodies_leak_nothing() {
        let bad = invalid_request();
        assert_eq!(bad.status(), 400);
        let body = futures_body(bad);
        assert_eq!(body, "invalid request");

        let boom = server_error();
        assert_eq!(boom.status(), 500);
        assert_eq!(futures_body(boom), "server error");
    }

    fn futures_body(response: HttpResponse) -> String {
        let bytes = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(to_bytes(response.into_body()))
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }
}
