//! OAuth2 modality: authorization redirect, code exchange, refresh,
//! validity probe and remote logout
//!
//! The callback `code` is shape-checked before any network call: the
//! authority issues exactly 64 alphanumeric characters, and anything else
//! is rejected locally so malformed input never reaches the token
//! endpoint.

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

static CODE_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]{64}$").unwrap_or_else(|_| unreachable!()));

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum OAuthError {
    /// Callback code is not 64 alphanumeric characters
    #[error("authorization code has an invalid shape")]
    InvalidCode,
    #[error("token endpoint error: {0}")]
    Exchange(String),
    /// Token response missing one of the required fields
    #[error("invalid token response: {0}")]
    InvalidTokenResponse(String),
    #[error("authority communication failure: {0}")]
    Communication(String),
}

/// A complete token response. Responses missing any of these fields are
/// rejected as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenSet {
    pub user: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
}

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub authority_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

pub struct OAuthExchange {
    config: OAuthConfig,
    client: Client,
}

impl OAuthExchange {
    /// # Errors
    ///
    /// `OAuthError::Communication` if the HTTP client cannot be built.
    pub fn new(config: OAuthConfig) -> Result<Self, OAuthError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| OAuthError::Communication(format!("client construction: {e}")))?;
        Ok(Self { config, client })
    }

    /// The URL end users are redirected to for authorization.
    #[must_use]
    pub fn authorize_url(&self) -> String {
        format!(
            "{}/authorize?client_id={}&redirect_uri={}",
            self.config.authority_url,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(&self.config.redirect_uri),
        )
    }

    /// Shape-check a callback code.
    ///
    /// # Errors
    ///
    /// `OAuthError::InvalidCode` for anything but 64 alphanumerics.
    pub fn validate_code(code: &str) -> Result<(), OAuthError> {
        if CODE_SHAPE.is_match(code) {
            Ok(())
        } else {
            Err(OAuthError::InvalidCode)
        }
    }

    /// Exchange a validated authorization code for tokens.
    ///
    /// # Errors
    ///
    /// `InvalidCode` before any network call for malformed codes, then
    /// `Exchange`/`InvalidTokenResponse`/`Communication`.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenSet, OAuthError> {
        Self::validate_code(code)?;
        self.token_request(&[("code", code), ("grant_type", "authorization_code")])
            .await
    }

    /// Trade a refresh token for a fresh token set.
    ///
    /// # Errors
    ///
    /// `Exchange`/`InvalidTokenResponse`/`Communication`.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, OAuthError> {
        self.token_request(&[
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ])
        .await
    }

    /// Probe whether an access token is still honored by the authority.
    ///
    /// # Errors
    ///
    /// `Communication` on transport failure; an authority rejection is a
    /// normal `Ok(false)`.
    pub async fn is_access_token_valid(&self, access_token: &str) -> Result<bool, OAuthError> {
        let url = format!(
            "{}/resource/ping?access_token={}",
            self.config.authority_url,
            urlencoding::encode(access_token),
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| OAuthError::Communication(e.to_string()))?;
        Ok(response.status().is_success())
    }

    /// Terminate the authority-side session for an access token. Called
    /// on local logout so the token cannot be replayed afterwards.
    ///
    /// # Errors
    ///
    /// `Communication` on transport failure.
    pub async fn remote_logout(&self, access_token: &str) -> Result<(), OAuthError> {
        let url = format!(
            "{}/logout?access_token={}",
            self.config.authority_url,
            urlencoding::encode(access_token),
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| OAuthError::Communication(e.to_string()))?;
        debug!("remote logout -> {}", response.status());
        Ok(())
    }

    async fn token_request(&self, grant: &[(&str, &str)]) -> Result<TokenSet, OAuthError> {
        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
            ("redirect_uri", &self.config.redirect_uri),
        ];
        form.extend_from_slice(grant);

        let url = format!("{}/access_token", self.config.authority_url);
        let response = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| OAuthError::Communication(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| OAuthError::Communication(e.to_string()))?;
        if !status.is_success() {
            return Err(OAuthError::Exchange(format!("HTTP {status}")));
        }
        parse_token_response(&text)
    }
}

fn parse_token_response(body: &str) -> Result<TokenSet, OAuthError> {
    serde_json::from_str(body).map_err(|e| OAuthError::InvalidTokenResponse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange() -> OAuthExchange {
        OAuthExchange::new(OAuthConfig {
            authority_url: "https://oauth.example".to_string(),
            client_id: "1234567890".to_string(),
            client_secret: "secret".to_string(),
            redirect_uri: "https://sp.example/auth/oauth/callback".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn authorize_url_encodes_redirect() {
        let url = exchange().authorize_url();
        assert_eq!(
            url,
            "https://oauth.example/authorize?client_id=1234567890&redirect_uri=https%3A%2F%2Fsp.example%2Fauth%2Foauth%2Fcallback"
        );
    }

    #[test]
    fn code_shape_is_enforced() {
        let valid = "a".repeat(64);
        assert!(OAuthExchange::validate_code(&valid).is_ok());
        assert!(OAuthExchange::validate_code(&"a".repeat(63)).is_err());
        assert!(OAuthExchange::validate_code(&"a".repeat(65)).is_err());
        let mut injected = "a".repeat(63);
        injected.push('&');
        assert!(OAuthExchange::validate_code(&injected).is_err());
        assert!(OAuthExchange::validate_code("").is_err());
    }

    #[test]
    fn complete_token_response_parses() {
        let tokens = parse_token_response(
            r#"{"user": "u-1", "access_token": "at", "refresh_token": "rt", "expires_in": 3600}"#,
        )
        .unwrap();
        assert_eq!(tokens.user, "u-1");
        assert_eq!(tokens.expires_in, 3600);
    }

    #[test]
    fn partial_token_responses_are_rejected() {
        for missing in [
            r#"{"access_token": "at", "refresh_token": "rt", "expires_in": 3600}"#,
            r#"{"user": "u-1", "refresh_token": "rt", "expires_in": 3600}"#,
            r#"{"user": "u-1", "access_token": "at", "expires_in": 3600}"#,
            r#"{"user": "u-1", "access_token": "at", "refresh_token": "rt"}"#,
        ] {
            assert!(matches!(
                parse_token_response(missing),
                Err(OAuthError::InvalidTokenResponse(_))
            ));
        }
    }
}
