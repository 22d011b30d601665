mod api;
mod auth;
mod dispatcher;
mod flows;
mod hub;
mod integrations;
mod settings;
mod state;
mod store;
mod webhook;

use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use api::AppState;
use auth::AuthConfig;
use settings::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,aquaflower=debug")),
        )
        .init();

    tracing::info!("Starting AquaFlower bridge v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    store::init(&settings.db_path)?;
    tracing::info!(db = %settings.db_path.display(), api = %settings.api_base_url, "Settings loaded");

    let hub = Arc::new(hub::Hub::new(&settings.external_url));
    let auth_config = Arc::new(AuthConfig::new(settings.auth_token.clone()));
    let port = settings.http_port;
    let app_state = Arc::new(AppState::new(hub.clone(), settings));

    // Restore config entries before accepting connections
    let restored = app_state.restore_entries().await?;
    tracing::info!(entries = restored, "Config entries restored");

    // Build combined router: REST API + webhooks
    let app = api::router(app_state.clone(), auth_config)
        .merge(webhook::router(hub))
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    app_state.unload_all();
    tracing::info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
