//! The storage service: consumes storage-ready envelopes, uploads
//! artifacts and finalizes the ledger.
//!
//! Deliveries are acked manually. Any processing failure rejects without
//! requeue: retries are ledger-driven through the reaper, not
//! broker-driven, so permanent errors cannot cause tight redelivery
//! loops. Replayed deliveries for completed jobs are absorbed by the
//! idempotency check.

use std::sync::Arc;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::kernel::cache::{FileCache, FileStatus, COMPLETED_TTL};
use crate::kernel::ledger::{JobStatus, Ledger};
use crate::kernel::object_store::ObjectStore;
use crate::messages::StorageReadyMessage;

pub struct StorageConsumer {
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn ObjectStore>,
    cache: Arc<dyn FileCache>,
}

impl StorageConsumer {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn ObjectStore>,
        cache: Arc<dyn FileCache>,
    ) -> Self {
        Self {
            ledger,
            store,
            cache,
        }
    }

    /// Consume deliveries until shutdown. A closed channel terminates the
    /// service; supervision restarts it.
    pub async fn run(
        &self,
        mut consumer: lapin::Consumer,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!("storage consumer started, waiting for messages");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = consumer.next() => {
                    let delivery = delivery
                        .context("broker connection closed")?
                        .context("failed to receive delivery")?;

                    match self.process_message(&delivery.data).await {
                        Ok(()) => {
                            delivery
                                .ack(BasicAckOptions::default())
                                .await
                                .context("failed to ack delivery")?;
                        }
                        Err(e) => {
                            error!(error = %e, "failed to process message");
                            delivery
                                .nack(BasicNackOptions {
                                    requeue: false,
                                    ..Default::default()
                                })
                                .await
                                .context("failed to nack delivery")?;
                        }
                    }
                }
            }
        }

        info!("storage consumer stopped");
        Ok(())
    }

    /// Handle one storage-ready envelope. `Ok` acks the delivery, `Err`
    /// rejects it without requeue.
    pub async fn process_message(&self, body: &[u8]) -> Result<()> {
        let message: StorageReadyMessage =
            serde_json::from_slice(body).context("malformed storage-ready message")?;

        info!(
            job_id = %message.job_id,
            filename = %message.filename,
            bucket = %message.bucket_name,
            "received storage-ready message"
        );

        let job = self
            .ledger
            .get_job_by_id(message.job_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("job not found in ledger: {}", message.job_id))?;

        // Redeliveries of an already-finalized job are a success.
        if job.status == JobStatus::Completed {
            info!(job_id = %message.job_id, "job already completed, skipping");
            return Ok(());
        }

        let artifact = match BASE64.decode(&message.file_content) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.ledger
                    .fail_job(message.job_id, &format!("Base64 decode failed: {e}"))
                    .await?;
                return Err(e).context("failed to decode artifact payload");
            }
        };

        if let Err(e) = self.store.ensure_bucket(&message.bucket_name).await {
            self.ledger
                .record_job_error(message.job_id, &format!("Bucket creation failed: {e}"))
                .await?;
            return Err(e).context("failed to ensure destination bucket");
        }

        if let Err(e) = self
            .store
            .put_object(
                &message.bucket_name,
                &message.filename,
                artifact,
                "application/pdf",
            )
            .await
        {
            self.ledger
                .record_job_error(message.job_id, &format!("Upload failed: {e}"))
                .await?;
            return Err(e).context("failed to upload artifact");
        }

        let pdf_location = format!("{}/{}", message.bucket_name, message.filename);

        // The artifact is durable at this point; a finalize miss is a
        // warning, not a redelivery.
        if let Err(e) = self.ledger.complete_job(message.job_id, &pdf_location).await {
            warn!(job_id = %message.job_id, error = %e, "failed to finalize completed job");
        }

        if let Err(e) = self
            .cache
            .set_file_status(&message.file_hash, FileStatus::Completed, COMPLETED_TTL)
            .await
        {
            warn!(job_id = %message.job_id, error = %e, "failed to update status cache");
        }

        info!(job_id = %message.job_id, location = %pdf_location, "artifact stored");
        Ok(())
    }
}
