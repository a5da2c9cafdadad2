use meshcall::config::Config;
use meshcall::domain::relay::SignalingRelay;
use meshcall::interface::api::{build_router, init_metrics};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Config path: first argument, then MESHCALL_CONFIG
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("MESHCALL_CONFIG").ok())
        .map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    // Initialize tracing; RUST_LOG wins over the configured filter
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting meshcall signaling relay");
    info!("Configuration loaded: {:?}", config);

    info!("Initializing Prometheus metrics exporter");
    let prometheus_handle = init_metrics()?;

    let relay = Arc::new(SignalingRelay::new(&config.relay));
    let app = build_router(relay.clone(), prometheus_handle);

    let listener = tokio::net::TcpListener::bind(config.bind_address()).await?;
    info!("Signaling relay listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(
        "Relay stopped ({} rooms, {} participants at shutdown)",
        relay.room_count().await,
        relay.participant_count()
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
