use std::sync::Arc;

use tokio::sync::watch;

use courier_common::config::AppConfig;
use courier_common::{db, redis_pool};
use courier_engine::setup::build_engine;
use courier_ingestor::feed::FeedPoller;
use courier_ingestor::normalize::EventIngestor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier_ingestor=info,courier_engine=info,courier_notifier=info".into()),
        )
        .json()
        .init();

    tracing::info!("Courier ingestor starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to storage (migrations run on connect)
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    let redis = redis_pool::create_redis_pool(&config.redis_url).await?;

    let engine = Arc::new(build_engine(&config, pool.clone(), redis)?);

    let poller = FeedPoller::new(
        pool,
        engine.clone(),
        EventIngestor::new(),
        config.feed_poll_interval_ms,
        config.feed_batch_size,
        config.worker_concurrency,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut poller_task = tokio::spawn(async move { poller.run(shutdown_rx).await });

    // Run with graceful shutdown on Ctrl+C
    tokio::select! {
        result = &mut poller_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Feed poller exited with error");
                    return Err(e);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Feed poller task panicked");
                    return Err(e.into());
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
            engine.shutdown();
            let _ = shutdown_tx.send(true);
            if let Err(e) = poller_task.await {
                tracing::error!(error = %e, "Feed poller task panicked during shutdown");
            }
        }
    }

    tracing::info!("Courier ingestor stopped.");
    Ok(())
}
