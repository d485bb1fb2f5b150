//! Storage service.
//!
//! Consumes storage-ready envelopes, uploads produced artifacts to the
//! object store and finalizes the job ledger.

use std::sync::Arc;

use anyhow::{Context, Result};
use pipeline_core::config::StorageConfig;
use pipeline_core::kernel::broker::{bind_consumer, connect_with_retry};
use pipeline_core::kernel::object_store::ObjectStore;
use pipeline_core::kernel::signals::shutdown_token;
use pipeline_core::kernel::{PostgresLedger, RedisFileCache, S3ObjectStore};
use pipeline_core::storage::StorageConsumer;
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

    tracing::info!("starting storage service");

    let config = StorageConfig::from_env().context("failed to load configuration")?;
    tracing::info!(
        queue = %config.queue_name,
        output_bucket = %config.output_bucket_name,
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
        .ensure_bucket(&config.output_bucket_name)
        .await
        .context("failed to ensure output bucket")?;
    tracing::info!(endpoint = %config.backends.minio_endpoint, "connected to MinIO");

    let broker_conn = connect_with_retry(&config.backends.rabbitmq_url)
        .await
        .context("failed to connect to RabbitMQ")?;
    let deliveries = bind_consumer(&broker_conn, &config.queue_name, "storage-service")
        .await
        .context("failed to bind consumer")?;

    let consumer = StorageConsumer::new(Arc::new(ledger), Arc::new(store), Arc::new(cache));

    let shutdown = shutdown_token();
    consumer.run(deliveries, shutdown).await?;

    broker_conn.close(320, "shutting down").await.ok();
    Ok(())
}
