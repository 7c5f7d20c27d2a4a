use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use streamgate_gateway::logging::init_tracing;
use streamgate_gateway::routes::build_router;
use streamgate_gateway::{AppState, Config, HealthMonitor, HealthPolicy, HttpBackendClient};

const RATE_LIMIT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    init_tracing(&config.logging.level);

    tracing::info!(
        backends = config.backends.len(),
        "Starting streamgate v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = Arc::new(HttpBackendClient::new(config.streaming.connect_timeout())?);
    let state = Arc::new(AppState::new(config.clone(), client.clone()).await);

    let shutdown = CancellationToken::new();
    let monitor = Arc::new(HealthMonitor::new(
        state.registry.clone(),
        client,
        HealthPolicy::from(&config.health),
    ));
    let background = vec![
        monitor.spawn(shutdown.clone()),
        state.cache.clone().spawn_sweeper(shutdown.clone()),
        state
            .rate_limiter
            .clone()
            .spawn_sweeper(RATE_LIMIT_SWEEP_INTERVAL, shutdown.clone()),
    ];

    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Listening on {}", addr);
    let listener = TcpListener::bind(&addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Shutting down background tasks");
    shutdown.cancel();
    for task in background {
        if let Err(e) = task.await {
            tracing::warn!("Background task ended abnormally: {}", e);
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
