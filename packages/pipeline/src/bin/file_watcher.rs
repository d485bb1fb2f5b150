//! File watcher service.
//!
//! Periodically scans the source bucket, deduplicates files against the
//! job ledger, stages bodies in the blob cache and publishes parse-ready
//! envelopes. Runs the stuck-job reaper after every scan.

use std::sync::Arc;

use anyhow::{Context, Result};
use pipeline_core::config::WatcherConfig;
use pipeline_core::kernel::broker::{connect_with_retry, QueuePublisher};
use pipeline_core::kernel::cache::FileCache;
use pipeline_core::kernel::ledger::Ledger;
use pipeline_core::kernel::object_store::ObjectStore;
use pipeline_core::kernel::signals::shutdown_token;
use pipeline_core::kernel::{AmqpPublisher, PostgresLedger, RedisFileCache, S3ObjectStore};
use pipeline_core::watcher::{FileProcessor, ProcessorConfig, Reaper, WatcherService};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pipeline_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    tracing::info!("starting file watcher service");

    let config = WatcherConfig::from_env().context("failed to load configuration")?;
    tracing::info!(
        bucket = %config.bucket_name,
        queue = %config.queue_name,
        poll_interval = ?config.poll_interval,
        batch_size = config.batch_size,
        rate_limit = config.rate_limit_per_second,
        "configuration loaded"
    );

    let ledger = PostgresLedger::connect(
        &config.backends.postgres_url(),
        config.backends.postgres_max_pool_size,
    )
    .await
    .context("failed to initialize Postgres")?;
    ledger.migrate().await?;
    tracing::info!("connected to Postgres");

    let cache = RedisFileCache::connect(&config.backends.redis_url())
        .await
        .context("failed to initialize Redis")?;
    tracing::info!("connected to Redis");

    let store = S3ObjectStore::new(
        &config.backends.minio_endpoint,
        &config.backends.minio_access_key,
        &config.backends.minio_secret_key,
        config.backends.minio_use_ssl,
    );
    store
        .ensure_bucket(&config.bucket_name)
        .await
        .context("failed to ensure source bucket")?;
    tracing::info!(endpoint = %config.backends.minio_endpoint, "connected to MinIO");

    let broker_conn = connect_with_retry(&config.backends.rabbitmq_url)
        .await
        .context("failed to connect to RabbitMQ")?;
    let publisher = AmqpPublisher::new(&broker_conn, &config.queue_name)
        .await
        .context("failed to set up publisher")?;

    let ledger: Arc<dyn Ledger> = Arc::new(ledger);
    let cache: Arc<dyn FileCache> = Arc::new(cache);
    let store: Arc<dyn ObjectStore> = Arc::new(store);
    let publisher: Arc<dyn QueuePublisher> = Arc::new(publisher);

    let processor = FileProcessor::new(
        store,
        Arc::clone(&ledger),
        Arc::clone(&cache),
        publisher,
        ProcessorConfig::from(&config),
    );
    let reaper = Reaper::new(ledger, cache);
    let service = WatcherService::new(processor, reaper, config.poll_interval);

    let shutdown = shutdown_token();
    service.run(shutdown).await?;

    broker_conn.close(320, "shutting down").await.ok();
    Ok(())
}
