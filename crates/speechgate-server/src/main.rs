//! Speechgate Server - HTTP API for the speech inference gateway

use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod error;
mod state;

use speechgate_core::{DaemonBackend, Gateway, GatewayConfig};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "speechgate_server=debug,speechgate_core=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Speechgate Server");

    // Load configuration
    let config = GatewayConfig::load()?;
    info!("Models directory: {:?}", config.models_dir);
    info!("Allowed languages: {}", config.allowed_languages.join(", "));

    let backend = Arc::new(DaemonBackend::new(&config.backend));
    match backend.ensure_daemon_running().await {
        Ok(()) => {
            if let Ok(status) = backend.status().await {
                info!(
                    "Inference daemon holds {} models",
                    status.loaded_models.as_ref().map_or(0, Vec::len)
                );
            }
        }
        Err(e) => warn!("Inference daemon unavailable at startup: {}", e),
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let gateway = Arc::new(Gateway::new(config, backend.clone())?);

    // Preload and start background eviction
    let report = gateway.start().await;
    if !report.failed.is_empty() {
        warn!("{} models failed to preload", report.failed.len());
    }

    let state = AppState::new(gateway.clone());
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    info!("Server ready. Press Ctrl+C to stop.");
    server.await?;

    gateway.shutdown().await;
    backend.stop_daemon().await?;

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        },
    }
}
