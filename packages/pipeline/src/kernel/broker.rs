//! Durable queue binding over AMQP.
//!
//! Both queues are declared durable and messages are published persistent.
//! The broker may reorder and redeliver freely; consumers ack manually and
//! reject with `requeue=false` because retries are ledger-driven, never
//! broker-driven.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};

const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Publish seam; lets tests capture envelopes without a broker.
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    /// Publish one persistent JSON message to the bound queue.
    async fn publish(&self, payload: Bytes) -> Result<()>;
}

/// Connect with bounded retries; a broker that never comes up is a fatal
/// startup error.
pub async fn connect_with_retry(url: &str) -> Result<Connection> {
    let mut last_err = None;

    for attempt in 1..=CONNECT_ATTEMPTS {
        tracing::info!(attempt, max = CONNECT_ATTEMPTS, "connecting to RabbitMQ");
        match Connection::connect(url, ConnectionProperties::default()).await {
            Ok(conn) => {
                tracing::info!("connected to RabbitMQ");
                return Ok(conn);
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "RabbitMQ connection failed");
                last_err = Some(e);
                if attempt < CONNECT_ATTEMPTS {
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
    }

    Err(last_err.unwrap().into())
}

/// Declare the named durable queue on a fresh channel.
pub async fn declare_durable_queue(conn: &Connection, queue: &str) -> Result<Channel> {
    let channel = conn
        .create_channel()
        .await
        .context("failed to open channel")?;

    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("failed to declare queue {queue}"))?;

    tracing::info!(queue, "declared durable queue");
    Ok(channel)
}

/// Producer bound to one queue on one channel.
///
/// The channel is not safe for concurrent publishes; callers serialize
/// (the scan loop processes objects sequentially).
pub struct AmqpPublisher {
    channel: Channel,
    queue: String,
}

impl AmqpPublisher {
    pub async fn new(conn: &Connection, queue: &str) -> Result<Self> {
        let channel = declare_durable_queue(conn, queue).await?;
        Ok(Self {
            channel,
            queue: queue.to_string(),
        })
    }
}

#[async_trait]
impl QueuePublisher for AmqpPublisher {
    async fn publish(&self, payload: Bytes) -> Result<()> {
        self.channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2),
            )
            .await
            .with_context(|| format!("failed to publish to {}", self.queue))?
            .await
            .context("broker did not confirm publish")?;

        Ok(())
    }
}

/// Bind a manual-ack consumer with prefetch 1.
pub async fn bind_consumer(conn: &Connection, queue: &str, tag: &str) -> Result<Consumer> {
    let channel = declare_durable_queue(conn, queue).await?;

    channel
        .basic_qos(1, BasicQosOptions::default())
        .await
        .context("failed to set QoS")?;

    let consumer = channel
        .basic_consume(
            queue,
            tag,
            BasicConsumeOptions {
                no_ack: false,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("failed to register consumer on {queue}"))?;

    Ok(consumer)
}
