//! Main Entrypoint for the Tutor API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Connecting the history store (PostgreSQL, or in-memory when unset).
//! 3. Building the tutoring stack and loading the image catalog once.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tutor_api::{
    config::Config,
    db::connect_history_store,
    router::create_router,
    sessions::{InMemorySessionStore, SessionStore},
    state::AppState,
};
use tutor_core::stack::TutorStack;

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize History Store ---
    let history = connect_history_store(config.database_url.as_deref()).await?;

    // --- 4. Initialize Shared Services ---
    let stack = TutorStack::build(&config.stack_settings())
        .await
        .context("Failed to build tutoring stack")?;

    let sessions = Arc::new(InMemorySessionStore::new(config.session_ttl));
    let sweeper = sessions.clone();
    let sweep_every = config
        .session_ttl
        .clamp(Duration::from_secs(1), Duration::from_secs(60));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            let purged = sweeper.purge_expired().await;
            if purged > 0 {
                info!(purged, "Expired hosted sessions removed");
            }
        }
    });

    let app_state = Arc::new(AppState {
        stack: Arc::new(stack),
        history,
        sessions,
        config: Arc::new(config.clone()),
    });

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 6. Start Server ---
    info!(
        provider = ?config.provider,
        model = %config.chat_model,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
