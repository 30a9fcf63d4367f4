//! Deckhand control API service
//!
//! Serves the deployment engine over HTTP, wired to the in-memory
//! collaborators seeded with a demo cluster.

use anyhow::{Context, Result};
use control_api::{create_router, AppState, Config};
use deploy_engine::mock::demo_environment;
use deploy_engine::Engine;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "control_api=debug,deploy_engine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Deckhand control API");

    let config = Config::from_env().context("Failed to load configuration")?;

    let demo = demo_environment().await;
    let engine = Engine::new(
        Arc::new(demo.orchestrator),
        Arc::new(demo.registry),
        Arc::new(demo.log_store),
        config.engine_config(),
    );
    info!(
        "Engine ready (ledger capacity {}, demo cluster seeded)",
        config.ledger_capacity
    );

    let app = create_router(AppState::new(engine, config.history_default_limit));

    let listener = TcpListener::bind(&config.api_address())
        .await
        .with_context(|| format!("Failed to bind to {}", config.api_address()))?;

    info!("Control API listening on {}", config.api_address());
    info!("Health check: http://{}/health", config.api_address());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Control API stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
