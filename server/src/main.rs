//! Tandem Server binary.

use std::sync::Arc;
use tandem_server::config::Config;
use tandem_server::durable::PgDurableStore;
use tandem_server::primary::RedisPrimaryStore;
use tandem_server::retry::connect_with_backoff;
use tandem_server::sync::SyncService;
use tandem_server::{app, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Tandem Server on {}:{}", config.host, config.port);

    // Connect both stores
    let primary = connect_with_backoff("redis", &config.connect_retry, || {
        RedisPrimaryStore::connect(&config.redis_url)
    })
    .await?;
    let durable = connect_with_backoff("postgres", &config.connect_retry, || {
        PgDurableStore::connect(&config.database_url)
    })
    .await?;

    // Run migrations
    tracing::info!("Running database migrations...");
    durable.run_migrations().await?;

    // Start reconciliation
    let sync = Arc::new(SyncService::new(
        Arc::new(primary),
        Arc::new(durable),
        config.sync_settings(),
    ));
    sync.start();

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app(AppState::new(Arc::clone(&sync))))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Flush pending changes before exit
    sync.stop();
    if let Err(e) = sync.force_sync_now().await {
        tracing::error!(error = %e, "Final sync before shutdown failed");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}
