#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use actix_web::{middleware::Logger, web, App, HttpServer};
use launchgate::{
    auth::AuthProtocolService,
    handlers::{configure_services, AppState},
    oauth::OAuthExchange,
    reconciler::SessionReconciler,
    saml::{AuthnRequestBuilder, LogoutRequestValidator, ResponseValidator},
    settings::LaunchGateSettings,
    store::{self, ReplayStore, SqliteReplayStore, SqliteUserStateStore, UserStateStore},
    ApiTransport, CryptoEngine,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load configuration from Settings.toml and environment variables
    // This also loads .env file and initializes the logger
    let settings = LaunchGateSettings::load()
        .map_err(|e| std::io::Error::other(format!("Failed to load settings: {e}")))?;

    let state = build_state(&settings)
        .await
        .map_err(|e| std::io::Error::other(format!("Failed to initialize services: {e}")))?;

    start_server(state, &settings).await
}

/// Wire the service graph: decode the configured credentials, connect
/// storage, and construct the modality services the settings enable.
///
/// # Errors
///
/// Returns an error if:
/// - The configured secrets cannot be decoded
/// - The private key cannot be loaded
/// - The database cannot be opened or migrated
async fn build_state(settings: &LaunchGateSettings) -> anyhow::Result<web::Data<AppState>> {
    let credentials = settings.decoded_credentials()?;
    let crypto = Arc::new(CryptoEngine::new(
        &credentials.private_key,
        settings.authority.private_key_passphrase.as_deref(),
    )?);
    let transport = Arc::new(ApiTransport::new(
        settings.engine_credentials(credentials.secret_key),
        Arc::clone(&crypto),
    )?);
    let auth = Arc::new(AuthProtocolService::new(transport, Arc::clone(&crypto)));

    let pool = SqlitePool::connect(&settings.storage.database_url).await?;
    store::sqlite::migrate(&pool).await?;
    let replay: Arc<dyn ReplayStore> = Arc::new(SqliteReplayStore::new(pool.clone()));
    let states: Arc<dyn UserStateStore> = Arc::new(SqliteUserStateStore::new(pool));
    tokio::spawn(store::run_replay_sweep(Arc::clone(&replay)));

    let reconciler = Arc::new(SessionReconciler::new(
        Arc::clone(&auth) as _,
        states,
        Duration::from_secs(settings.authority.poll_ceiling_secs),
    ));

    let sso_profile = settings.sso_profile();
    let sso_response_validator = sso_profile
        .as_ref()
        .map(|profile| Arc::new(ResponseValidator::new(profile.clone(), Arc::clone(&replay))));
    let sso_logout_validator = sso_profile
        .as_ref()
        .map(|profile| Arc::new(LogoutRequestValidator::new(profile.clone())));
    let sso_authn_builder = sso_profile
        .map(|profile| Arc::new(AuthnRequestBuilder::new(profile, Arc::clone(&crypto))));

    let oauth = settings
        .oauth_config()
        .map(OAuthExchange::new)
        .transpose()?
        .map(Arc::new);

    Ok(web::Data::new(AppState {
        auth,
        reconciler,
        sso_response_validator,
        sso_logout_validator,
        sso_authn_builder,
        oauth,
    }))
}

/// Start the server
///
/// # Errors
///
/// Returns an error if:
/// - Server binding fails
/// - Server fails to start
async fn start_server(
    state: web::Data<AppState>,
    settings: &LaunchGateSettings,
) -> std::io::Result<()> {
    let bind_address = settings.get_bind_address();
    print_startup_info(&bind_address, settings);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(Logger::default())
            .configure(configure_services)
    })
    .bind(&bind_address)?
    .run()
    .await
}

fn print_startup_info(bind_address: &str, settings: &LaunchGateSettings) {
    println!(
        "Starting LaunchGate Authentication Service on http://{bind_address}"
    );
    println!("Modality: {:?}", settings.application.modality);
    println!();
    println!("Native endpoints:");
    println!("  POST /auth/native/login    - Open an auth request and await the decision");
    println!("  GET  /auth/heartbeat       - Still-authenticated check");
    println!("  GET|POST /engine/callback  - Engine decision and de-orbit callbacks");
    println!();
    println!("SSO endpoints:");
    println!("  GET  /auth/sso/login       - Redirect to the identity authority");
    println!("  GET|POST /auth/sso/acs     - Assertion consumer service");
    println!("  GET  /auth/sso/logout      - Authority-initiated logout");
    println!();
    println!("OAuth endpoints:");
    println!("  GET  /auth/oauth/callback  - Authorization code callback");
    println!();
    println!("Engine callback URL to register with the authority:");
    println!(
        "  {}/engine/callback",
        settings.application.public_base_url
    );
    println!();
    println!("System endpoints:");
    println!("  GET  /health               - Health check");
}
