//! Swivel daemon - Entry Point
//!
//! Wires the service manager to the API server and runs until a shutdown
//! signal arrives, then tears the jobs down in reverse start order.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use swivel::api::ApiServer;
use swivel::config::Config;
use swivel::events::EventBus;
use swivel::history::Histories;
use swivel::jobs::scanner::HttpsIpProber;
use swivel::manager::ServiceManager;
use swivel::probe::HttpProber;
use swivel::proxy::TcpRelayCore;

#[tokio::main]
async fn main() -> swivel::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "swivel=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Swivel");

    let config = Config::from_env()?;
    info!("Configuration loaded");

    let bus = EventBus::new();
    let histories = Histories::new(&config.history);

    let manager = ServiceManager::new(
        bus.clone(),
        Arc::new(HttpProber::new()),
        Arc::new(HttpsIpProber::new()),
        Arc::new(TcpRelayCore::new()),
        histories.clone(),
    );

    let api_server = ApiServer::new(config.api.clone(), manager.clone(), histories);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let api_task = tokio::spawn(async move {
        if let Err(e) = api_server.run(shutdown_rx).await {
            error!("API server error: {}", e);
        }
    });

    info!("API server starting on {}", config.api_addr());

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    // Stop jobs in reverse order, then the API server.
    manager.shutdown().await;
    let _ = shutdown_tx.send(true);
    let _ = api_task.await;

    info!("Swivel stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
