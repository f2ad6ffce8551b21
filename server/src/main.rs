mod auth;
mod chat;
mod config;
mod db;
mod error;
mod routes;
mod state;
mod storage;
mod users;
mod ws;

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;

use config::{generate_config_template, Config};
use storage::AttachmentStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "parley_server=info".parse().unwrap()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "parley_server=info".parse().unwrap()),
            )
            .init();
    }

    tracing::info!("Parley server v{} starting", env!("CARGO_PKG_VERSION"));

    // Initialize SQLite database
    let db = db::init_db(&config.data_dir)?;

    // Load or generate JWT signing key (256-bit random, stored in data_dir)
    let jwt_secret = auth::jwt::load_or_generate_jwt_secret(&config.data_dir)?;

    let attachment_store = AttachmentStore::new(
        &config.data_dir,
        config.resolved_public_base_url(),
        Duration::from_secs(config.upload_timeout_secs),
    );

    // Build application state: registry, presence, and router are created
    // here once and shared by every handler.
    let app_state = state::AppState::new(db, attachment_store, jwt_secret);

    // Build router
    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
