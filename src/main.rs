//! Lotserver - Parking lot coordination server
//!
//! Main entry point for the coordination server.

use std::sync::Arc;
use std::time::Duration;

use lotserver::coordinator::AssignmentCoordinator;
use lotserver::event_hub::EventHub;
use lotserver::state::{AppConfig, AppState};
use lotserver::web_api;
use sqlx::mysql::MySqlPoolOptions;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lotserver=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Lotserver v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        database_url = %config.database_url,
        host = %config.host,
        port = config.port,
        "Configuration loaded"
    );

    // Create database pool
    let pool = MySqlPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await?;
    tracing::info!("Database connected");

    let coordinator = Arc::new(AssignmentCoordinator::new(pool.clone()));
    let hub = Arc::new(EventHub::new());

    // Seed the hub view from canonical state
    let spaces = coordinator.load_space_snapshot().await?;
    let active = coordinator.load_active_snapshot().await?;
    tracing::info!(
        spaces = spaces.len(),
        active_vehicles = active.len(),
        "Hub view seeded"
    );
    hub.seed(spaces, active).await;

    let state = AppState {
        pool,
        config,
        coordinator,
        hub,
    };

    let app = web_api::create_router(state.clone())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
