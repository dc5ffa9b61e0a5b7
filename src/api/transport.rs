//! Signed REST transport for the assertion engine
//!
//! Every authenticated call carries three credential parameters: the app
//! key, the RSA-OAEP-encrypted secret key package (computed once per
//! process against the engine's published public key) and an RSA signature
//! over that encrypted package. The engine public key comes from
//! `GET /v1/ping` and is cached with a TTL because the engine rotates it.

use crate::api::error::{classify_engine_code, ApiError, ApiErrorKind};
use crate::crypto::{CryptoEngine, AES_BLOCK_SIZE};
use crate::models::{wire_time, PingResponse, WhiteLabelUser};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::debug;
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP verbs the engine API uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
}

/// Audit log actions accepted by `PUT /v1/logs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogAction {
    Authenticate,
    Revoke,
}

impl LogAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authenticate => "Authenticate",
            Self::Revoke => "Revoke",
        }
    }
}

/// Credentials and endpoint configuration for one engine deployment.
#[derive(Debug, Clone)]
pub struct EngineCredentials {
    pub base_url: String,
    pub app_key: String,
    pub secret_key: String,
    pub public_key_ttl_secs: i64,
    pub error_code_overrides: Vec<(u64, ApiErrorKind)>,
}

/// Raw poll envelope before the `auth` package is decrypted.
#[derive(Debug, Clone)]
pub struct PollEnvelope {
    /// RSA-encrypted JSON decision package, base64 encoded
    pub auth: String,
    pub user_hash: String,
    pub user_push_id: Option<String>,
    pub organization_user_id: Option<String>,
}

struct CachedKey {
    key: String,
    fetched: DateTime<Utc>,
}

enum Payload<'a> {
    Empty,
    Form(&'a [(&'static str, String)]),
    Json(&'a Value),
}

/// Signed engine REST client.
pub struct ApiTransport {
    client: Client,
    credentials: EngineCredentials,
    crypto: Arc<CryptoEngine>,
    public_key_cache: RwLock<Option<CachedKey>>,
    encrypted_secret: OnceCell<String>,
}

impl ApiTransport {
    /// # Errors
    ///
    /// Returns `ApiError::Communication` if the HTTP client cannot be
    /// constructed.
    pub fn new(
        credentials: EngineCredentials,
        crypto: Arc<CryptoEngine>,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Communication(format!("client construction: {e}")))?;
        Ok(Self {
            client,
            credentials,
            crypto,
            public_key_cache: RwLock::new(None),
            encrypted_secret: OnceCell::new(),
        })
    }

    /// `GET /v1/ping`: engine clock and current public key.
    ///
    /// # Errors
    ///
    /// `Communication` on transport failure, `InvalidResponse` on a body
    /// missing the expected fields.
    pub async fn ping(&self) -> Result<PingResponse, ApiError> {
        let body = self
            .dispatch(HttpMethod::Get, "/v1/ping", Payload::Empty, &[])
            .await?;
        parse_ping(&body)
    }

    /// The engine's public key, refreshed from ping when the cached copy
    /// is older than the configured TTL.
    ///
    /// # Errors
    ///
    /// Propagates ping failures.
    pub async fn public_key(&self) -> Result<String, ApiError> {
        let ttl = ChronoDuration::seconds(self.credentials.public_key_ttl_secs);
        if let Some(cached) = self.public_key_cache.read().await.as_ref() {
            if Utc::now() - cached.fetched < ttl {
                return Ok(cached.key.clone());
            }
        }
        let ping = self.ping().await?;
        let mut guard = self.public_key_cache.write().await;
        *guard = Some(CachedKey {
            key: ping.public_key.clone(),
            fetched: Utc::now(),
        });
        Ok(ping.public_key)
    }

    /// `POST /v1/auths`: open an auth request for `username`.
    ///
    /// Returns the engine-assigned auth request id.
    ///
    /// # Errors
    ///
    /// Classified engine errors (no paired devices, no such user, rate
    /// limit, invalid credentials) or transport failures.
    pub async fn auth(&self, username: &str, session: bool) -> Result<String, ApiError> {
        let mut params = self.credential_params().await?;
        params.push(("username", username.to_string()));
        params.push(("session", if session { "1" } else { "0" }.to_string()));
        params.push(("user_push_id", "1".to_string()));
        let body = self
            .dispatch(HttpMethod::Post, "/v1/auths", Payload::Form(&params), &[])
            .await?;
        require_str(&body, "auth_request").map(ToString::to_string)
    }

    /// `POST /v1/poll` (with the `METHOD=GET` tunnel): fetch the decision
    /// envelope for an auth request.
    ///
    /// # Errors
    ///
    /// While the user has not answered, the engine returns the pending
    /// sentinel code; callers detect it with
    /// [`ApiError::is_pending_sentinel`].
    pub async fn poll(&self, auth_request: &str) -> Result<PollEnvelope, ApiError> {
        let mut params = self.credential_params().await?;
        params.push(("auth_request", auth_request.to_string()));
        let query = [("METHOD", "GET".to_string())];
        let body = self
            .dispatch(HttpMethod::Post, "/v1/poll", Payload::Form(&params), &query)
            .await?;
        Ok(PollEnvelope {
            auth: require_str(&body, "auth")?.to_string(),
            user_hash: require_str(&body, "user_hash")?.to_string(),
            user_push_id: optional_str(&body, "user_push_id"),
            organization_user_id: optional_str(&body, "organization_user"),
        })
    }

    /// `PUT /v1/logs`: record an `Authenticate` or `Revoke` outcome.
    ///
    /// # Errors
    ///
    /// Classified engine errors or transport failures.
    pub async fn log(
        &self,
        auth_request: &str,
        action: LogAction,
        status: bool,
    ) -> Result<(), ApiError> {
        let mut params = self.credential_params().await?;
        params.push(("auth_request", auth_request.to_string()));
        params.push(("action", action.as_str().to_string()));
        params.push(("status", if status { "True" } else { "False" }.to_string()));
        self.dispatch(HttpMethod::Put, "/v1/logs", Payload::Form(&params), &[])
            .await?;
        Ok(())
    }

    /// `POST /v1/users`: create a white-label user for pairing.
    ///
    /// The JSON body is signed and the signature travels in the query
    /// string. The response is an encrypted envelope: `cipher` is an
    /// RSA-OAEP package holding the AES key and IV, `data` the AES-CBC
    /// payload with the QR code URL and manual pairing code.
    ///
    /// # Errors
    ///
    /// Classified engine errors, or `InvalidResponse` when the envelope
    /// cannot be decrypted.
    pub async fn create_white_label_user(
        &self,
        identifier: &str,
    ) -> Result<WhiteLabelUser, ApiError> {
        let encrypted_secret = self.encrypted_secret_key().await?;
        let body = json!({
            "app_key": self.credentials.app_key,
            "secret_key": encrypted_secret,
            "identifier": identifier,
        });
        let serialized = body.to_string();
        let signature = STANDARD.encode(
            self.crypto
                .sign(serialized.as_bytes())
                .map_err(|e| ApiError::Communication(format!("request signing: {e}")))?,
        );
        let query = [("signature", signature)];
        let response = self
            .dispatch(HttpMethod::Post, "/v1/users", Payload::Json(&body), &query)
            .await?;
        self.decode_user_envelope(&response)
    }

    fn decode_user_envelope(&self, body: &Map<String, Value>) -> Result<WhiteLabelUser, ApiError> {
        let cipher = STANDARD
            .decode(require_str(body, "cipher")?)
            .map_err(|e| ApiError::InvalidResponse(format!("cipher base64: {e}")))?;
        let package = self
            .crypto
            .decrypt_asymmetric(&cipher)
            .map_err(|e| ApiError::InvalidResponse(format!("cipher package: {e}")))?;
        if package.len() <= AES_BLOCK_SIZE {
            return Err(ApiError::InvalidResponse(
                "cipher package shorter than one AES block".to_string(),
            ));
        }
        let (key, iv) = package.split_at(package.len() - AES_BLOCK_SIZE);

        let data = STANDARD
            .decode(require_str(body, "data")?)
            .map_err(|e| ApiError::InvalidResponse(format!("data base64: {e}")))?;
        let plaintext = self
            .crypto
            .decrypt_symmetric(&data, key, iv)
            .map_err(|e| ApiError::InvalidResponse(format!("data payload: {e}")))?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| ApiError::InvalidResponse(format!("user payload: {e}")))
    }

    /// The credential triple for form-encoded calls.
    async fn credential_params(&self) -> Result<Vec<(&'static str, String)>, ApiError> {
        let encrypted = self.encrypted_secret_key().await?;
        let signature = STANDARD.encode(
            self.crypto
                .sign(encrypted.as_bytes())
                .map_err(|e| ApiError::Communication(format!("request signing: {e}")))?,
        );
        Ok(vec![
            ("app_key", self.credentials.app_key.clone()),
            ("secret_key", encrypted),
            ("signature", signature),
        ])
    }

    /// The secret key package, encrypted against the engine public key and
    /// stamped with the engine clock. Computed once per process.
    async fn encrypted_secret_key(&self) -> Result<String, ApiError> {
        self.encrypted_secret
            .get_or_try_init(|| async {
                let ping = self.ping().await?;
                let package = json!({
                    "secret": self.credentials.secret_key,
                    "stamped": wire_time::format(&ping.engine_time),
                });
                let encrypted = self
                    .crypto
                    .encrypt_asymmetric(package.to_string().as_bytes(), &ping.public_key)
                    .map_err(|e| {
                        ApiError::Communication(format!("secret key encryption: {e}"))
                    })?;
                Ok(STANDARD.encode(encrypted))
            })
            .await
            .cloned()
    }

    async fn dispatch(
        &self,
        method: HttpMethod,
        path: &str,
        payload: Payload<'_>,
        query: &[(&str, String)],
    ) -> Result<Map<String, Value>, ApiError> {
        let url = format!("{}{}", self.credentials.base_url, path);
        let mut request = match method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url),
            HttpMethod::Put => self.client.put(&url),
        };
        if !query.is_empty() {
            request = request.query(query);
        }
        request = match payload {
            Payload::Empty => request,
            Payload::Form(params) => request.form(params),
            Payload::Json(value) => request.json(value),
        };

        debug!("engine request: {method:?} {path}");
        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Communication(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ApiError::Communication(e.to_string()))?;
        debug!("engine response: {path} -> {status}");

        if status.is_success() {
            let value: Value = serde_json::from_str(&text).map_err(|_| {
                ApiError::InvalidResponse(format!("non-JSON body from {path}"))
            })?;
            unwrap_response_envelope(value, path)
        } else {
            Err(classify_error_body(
                status.as_u16(),
                &text,
                &self.credentials.error_code_overrides,
            ))
        }
    }
}

/// Success bodies may wrap the useful object in `{"response": …}`.
fn unwrap_response_envelope(value: Value, path: &str) -> Result<Map<String, Value>, ApiError> {
    let Value::Object(map) = value else {
        return Err(ApiError::InvalidResponse(format!(
            "non-object body from {path}"
        )));
    };
    match map.get("response") {
        Some(Value::Object(inner)) => Ok(inner.clone()),
        _ => Ok(map),
    }
}

/// Error bodies carry `message_code` and `message`; anything else is an
/// invalid request tagged with the HTTP status.
fn classify_error_body(
    http_status: u16,
    body: &str,
    overrides: &[(u64, ApiErrorKind)],
) -> ApiError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let Some(Value::Object(map)) = parsed else {
        return ApiError::InvalidRequest {
            code: u64::from(http_status),
            message: format!("HTTP {http_status} with non-JSON body"),
        };
    };
    let Some(code) = map.get("message_code").and_then(Value::as_u64) else {
        return ApiError::InvalidRequest {
            code: u64::from(http_status),
            message: format!("HTTP {http_status} without message_code"),
        };
    };
    let message = match map.get("message") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    classify_engine_code(code, &message, overrides)
}

fn parse_ping(body: &Map<String, Value>) -> Result<PingResponse, ApiError> {
    let engine_time = wire_time::parse(require_str(body, "engine_time")?)
        .map_err(|e| ApiError::InvalidResponse(format!("engine_time: {e}")))?;
    let key_time_stamp = wire_time::parse(require_str(body, "date_stamp")?)
        .map_err(|e| ApiError::InvalidResponse(format!("date_stamp: {e}")))?;
    Ok(PingResponse {
        engine_time,
        public_key: require_str(body, "key")?.to_string(),
        key_time_stamp,
    })
}

fn require_str<'a>(map: &'a Map<String, Value>, field: &str) -> Result<&'a str, ApiError> {
    map.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::InvalidResponse(format!("missing field: {field}")))
}

fn optional_str(map: &Map<String, Value>, field: &str) -> Option<String> {
    map.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}
