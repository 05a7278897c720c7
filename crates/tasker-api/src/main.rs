//! Statement Tasker API server.

use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use statement_api::{HttpStatementGateway, StatementGateway};
use statement_tasker::store::NatsKv;
use statement_tasker::{InvocationRouter, Starter, TaskerConfig, TrackingStore};
use tasker_api::{build_router, ApiConfig, AppState};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tasker_api=debug,statement_tasker=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    init_tracing();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Statement Tasker API");

    let api_config = ApiConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load API config, using defaults");
        ApiConfig::default()
    });
    let config = TaskerConfig::from_env()?;

    let client = statement_tasker::nats::connect(&config.nats_url).await?;
    let kv = NatsKv::open(client, &config.tracking_bucket, config.record_ttl()).await?;
    let store = TrackingStore::new(Arc::new(kv), config.record_ttl());

    let gateway: Arc<dyn StatementGateway> = Arc::new(HttpStatementGateway::new(&config.statement_endpoint));
    let starter = Arc::new(Starter::new(
        store.clone(),
        gateway.clone(),
        config.target(),
        config.retry_policy(),
        config.issue_timeout(),
    ));
    let router = InvocationRouter::new(starter, store.clone(), gateway, config.retry_policy());

    let app = build_router(AppState::new(router, store));

    let addr = api_config.bind_address();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
