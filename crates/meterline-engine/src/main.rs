//! Meterline ingestion service
//!
//! Applies the schema, then runs NATS ingestion workers until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meterline_common::VERSION;
use meterline_engine::{
    ClickHouseStore, EngineConfig, EngineMetrics, IngestConsumer, NatsSubscription,
    RawEventRepository,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("Starting Meterline v{}", VERSION);

    let config = EngineConfig::load().context("Failed to load configuration")?;
    info!(
        clickhouse = %config.clickhouse.url,
        database = %config.clickhouse.database,
        nats = %config.nats.url,
        subject = %config.nats.subject,
        workers = config.nats.workers,
        "Loaded configuration"
    );

    let store = ClickHouseStore::new(&config.clickhouse);
    store.ping().await.context("ClickHouse is unreachable")?;
    store.migrate().await.context("Failed to apply schema")?;

    let registry = Registry::new();
    let metrics = EngineMetrics::new()?;
    metrics.register(&registry)?;

    let raw: Arc<dyn RawEventRepository> = Arc::new(store);
    let shutdown = CancellationToken::new();

    let mut workers = Vec::with_capacity(config.nats.workers);
    for worker in 0..config.nats.workers {
        let subscription = NatsSubscription::connect(&config.nats)
            .await
            .with_context(|| format!("Failed to subscribe worker {}", worker))?;
        let consumer = IngestConsumer::new(worker, subscription, raw.clone())
            .with_metrics(metrics.clone());
        workers.push(tokio::spawn(consumer.run(shutdown.child_token())));
    }
    info!(workers = workers.len(), "Ingestion running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install CTRL+C signal handler")?;
    info!("Received shutdown signal");
    shutdown.cancel();

    for handle in workers {
        match handle.await {
            Ok(stats) => debug!(?stats, "Worker joined"),
            Err(e) => error!(error = %e, "Worker panicked"),
        }
    }

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    info!(
        "Final metrics:\n{}",
        String::from_utf8_lossy(&buffer)
    );

    info!("Shutting down Meterline");
    Ok(())
}
