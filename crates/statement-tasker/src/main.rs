//! Statement Tasker worker binary.
//!
//! Listens for statement status changes and resolves pending callbacks.

use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use statement_tasker::queue::JetStreamQueue;
use statement_tasker::signal::NatsCallbackSignal;
use statement_tasker::store::NatsKv;
use statement_tasker::{Completer, CompletionListener, CompletionWorker, TaskerConfig, TrackingStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,statement_tasker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    tracing::info!("Starting Statement Tasker worker");

    let config = TaskerConfig::from_env()?;
    tracing::info!(
        tracking_bucket = %config.tracking_bucket,
        notification_subject = %config.notification_subject,
        notification_stream = %config.notification_stream,
        work_stream = %config.work_stream,
        "Worker configuration loaded"
    );

    let client = statement_tasker::nats::connect(&config.nats_url).await?;

    let kv = NatsKv::open(client.clone(), &config.tracking_bucket, config.record_ttl()).await?;
    let store = TrackingStore::new(Arc::new(kv), config.record_ttl());

    let queue = Arc::new(JetStreamQueue::connect(client.clone(), &config).await?);
    let signal = NatsCallbackSignal::new(client.clone(), &config.callback_subject_prefix, config.callback_timeout());

    let completer = Completer::new(store, Arc::new(signal), config.retry_policy());
    let worker = CompletionWorker::new(
        queue.clone(),
        completer,
        config.redelivery_policy(),
        config.max_concurrent,
    );

    let listener = CompletionListener::new(queue).with_retry(config.retry_policy());
    let listener_config = config.clone();
    let listener_client = client.clone();
    let listener_task = tokio::spawn(async move {
        if let Err(e) = listener.run_jetstream(listener_client, &listener_config).await {
            tracing::error!(error = %e, "Completion listener stopped");
        }
    });

    // Handle shutdown signals
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received");
    };

    tokio::select! {
        result = worker.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker error");
                listener_task.abort();
                return Err(e.into());
            }
        }
        _ = shutdown => {
            tracing::info!("Shutting down worker");
        }
    }

    listener_task.abort();
    tracing::info!("Worker stopped");
    Ok(())
}
