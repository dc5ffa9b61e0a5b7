#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

/// Version of the launchgate application
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod api;
pub mod auth;
pub mod crypto;
pub mod handlers;
pub mod models;
pub mod oauth;
pub mod reconciler;
pub mod saml;
pub mod secrets;
pub mod settings;
pub mod store;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Re-export commonly used items
pub use api::{ApiError, ApiTransport};
pub use auth::AuthProtocolService;
pub use crypto::CryptoEngine;
pub use models::{AuthRequest, AuthResponse, Decision, SamlAssertion, UserAuthState};
pub use reconciler::SessionReconciler;
pub use settings::LaunchGateSettings;
