//! Scan cycle: list the source bucket, deduplicate against cache and
//! ledger, stage bodies in the blob cache and publish parse-ready
//! envelopes.
//!
//! Objects are processed sequentially; the token bucket and the one-second
//! pause between batches are the throttling primitives. The ledger insert
//! is the single point of mutual exclusion across watcher replicas.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WatcherConfig;
use crate::kernel::broker::QueuePublisher;
use crate::kernel::cache::{FileCache, FileStatus, BLOB_TTL, COMPLETED_TTL, PROCESSING_TTL};
use crate::kernel::ledger::{JobStatus, Ledger};
use crate::kernel::object_store::{ObjectMeta, ObjectStore};
use crate::messages::ParseReadyMessage;

/// Deadline for a single object download.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const DOWNLOAD_TIMEOUT_ERROR: &str = "Download timeout after 5 minutes";

/// Pause between batches within one scan.
const BATCH_PAUSE: Duration = Duration::from_secs(1);

/// Counters for one scan cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    pub found: usize,
    pub queued: usize,
    pub skipped: usize,
    pub errors: usize,
}

enum ObjectOutcome {
    Queued(Uuid),
    Skipped,
}

/// Tuning knobs for the scan cycle.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub bucket_name: String,
    pub batch_size: usize,
    pub rate_limit_per_second: u32,
    pub download_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            bucket_name: "uploads".to_string(),
            batch_size: 100,
            rate_limit_per_second: 50,
            download_timeout: DOWNLOAD_TIMEOUT,
        }
    }
}

impl From<&WatcherConfig> for ProcessorConfig {
    fn from(config: &WatcherConfig) -> Self {
        Self {
            bucket_name: config.bucket_name.clone(),
            batch_size: config.batch_size,
            rate_limit_per_second: config.rate_limit_per_second,
            download_timeout: DOWNLOAD_TIMEOUT,
        }
    }
}

pub struct FileProcessor {
    store: Arc<dyn ObjectStore>,
    ledger: Arc<dyn Ledger>,
    cache: Arc<dyn FileCache>,
    publisher: Arc<dyn QueuePublisher>,
    config: ProcessorConfig,
}

impl FileProcessor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        ledger: Arc<dyn Ledger>,
        cache: Arc<dyn FileCache>,
        publisher: Arc<dyn QueuePublisher>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            cache,
            publisher,
            config,
        }
    }

    /// One scan cycle over the source bucket.
    pub async fn run_scan(&self, shutdown: &CancellationToken) -> Result<ScanStats> {
        let objects = self
            .store
            .list_objects(&self.config.bucket_name)
            .await
            .context("failed to list objects")?;

        let mut stats = ScanStats {
            found: objects.len(),
            ..Default::default()
        };

        if objects.is_empty() {
            debug!(bucket = %self.config.bucket_name, "no files found in bucket");
            return Ok(stats);
        }

        info!(bucket = %self.config.bucket_name, count = objects.len(), "scanning bucket");

        // One token per attempted object, work or not.
        let mut tokens = tokio::time::interval(
            Duration::from_secs(1) / self.config.rate_limit_per_second.max(1),
        );
        tokens.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        for (batch_index, batch) in objects.chunks(self.config.batch_size.max(1)).enumerate() {
            if batch_index > 0 {
                debug!("pausing between batches");
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(stats),
                    _ = tokio::time::sleep(BATCH_PAUSE) => {}
                }
            }

            for object in batch {
                if shutdown.is_cancelled() {
                    return Ok(stats);
                }
                tokens.tick().await;

                match self.process_object(object).await {
                    Ok(ObjectOutcome::Queued(job_id)) => {
                        info!(key = %object.key, job_id = %job_id, "queued for parsing");
                        stats.queued += 1;
                    }
                    Ok(ObjectOutcome::Skipped) => stats.skipped += 1,
                    Err(e) => {
                        warn!(key = %object.key, error = %e, "failed to process object");
                        stats.errors += 1;
                    }
                }
            }
        }

        info!(
            queued = stats.queued,
            skipped = stats.skipped,
            errors = stats.errors,
            "scan complete"
        );
        Ok(stats)
    }

    /// Dedup / handoff sequence for one object. Later steps are skipped as
    /// soon as an earlier one decides the object is already handled.
    async fn process_object(&self, object: &ObjectMeta) -> Result<ObjectOutcome> {
        let file_hash = object.file_hash();
        let filename = object.key.as_str();

        // Status cache probe. Advisory only: a read error falls through to
        // the ledger.
        match self.cache.file_status(file_hash).await {
            Ok(Some(FileStatus::Completed)) => {
                debug!(key = filename, "skip: already completed (cache)");
                return Ok(ObjectOutcome::Skipped);
            }
            Ok(Some(FileStatus::Processing)) => {
                debug!(key = filename, "skip: in flight (cache)");
                return Ok(ObjectOutcome::Skipped);
            }
            Ok(None) => {}
            Err(e) => warn!(key = filename, error = %e, "status cache read failed, continuing"),
        }

        // Atomic insert; on fingerprint conflict, decide from the existing row.
        let job_id = match self.ledger.create_job(file_hash, filename).await? {
            Some(job_id) => {
                info!(key = filename, job_id = %job_id, "created job");
                job_id
            }
            None => match self.resolve_duplicate(file_hash, filename).await? {
                Some(job_id) => job_id,
                None => return Ok(ObjectOutcome::Skipped),
            },
        };

        // Download under a deadline. A timeout goes straight back to
        // pending through the retry routine; other failures leave the row
        // for the reaper.
        let body = match tokio::time::timeout(
            self.config.download_timeout,
            self.store.get_object(&self.config.bucket_name, filename),
        )
        .await
        {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                self.ledger
                    .record_job_error(job_id, &format!("Download failed: {e}"))
                    .await?;
                return Err(e).with_context(|| format!("failed to download {filename}"));
            }
            Err(_) => {
                self.ledger
                    .record_job_error(job_id, DOWNLOAD_TIMEOUT_ERROR)
                    .await?;
                self.ledger.mark_job_for_retry(job_id).await?;
                anyhow::bail!("download timed out: {filename}");
            }
        };

        self.cache
            .put_blob(file_hash, &body, BLOB_TTL)
            .await
            .with_context(|| format!("failed to stage blob for {filename}"))?;

        let envelope = ParseReadyMessage::new(job_id, file_hash, filename, object.size);
        let payload = serde_json::to_vec(&envelope).context("failed to encode envelope")?;

        if let Err(e) = self.publisher.publish(Bytes::from(payload)).await {
            self.ledger
                .record_job_error(job_id, &format!("MQ publish failed: {e}"))
                .await?;
            // Compensate: the blob is useless without a queued envelope.
            if let Err(del) = self.cache.delete_blob(file_hash).await {
                warn!(key = filename, error = %del, "failed to delete orphaned blob");
            }
            return Err(e).with_context(|| format!("failed to publish envelope for {filename}"));
        }

        // Promote and warm the cache; warn-only, the reaper corrects both.
        if let Err(e) = self
            .ledger
            .update_job_status(job_id, JobStatus::Processing)
            .await
        {
            warn!(job_id = %job_id, error = %e, "failed to promote job to processing");
        }
        if let Err(e) = self
            .cache
            .set_file_status(file_hash, FileStatus::Processing, PROCESSING_TTL)
            .await
        {
            warn!(job_id = %job_id, error = %e, "failed to warm status cache");
        }

        Ok(ObjectOutcome::Queued(job_id))
    }

    /// An insert conflict means a job already exists for this fingerprint.
    /// Returns a job id when that job should be (re)processed now.
    async fn resolve_duplicate(&self, file_hash: &str, filename: &str) -> Result<Option<Uuid>> {
        let Some(job) = self.ledger.get_job_by_file_hash(file_hash).await? else {
            warn!(key = filename, "job missing after duplicate detection");
            return Ok(None);
        };

        match job.status {
            JobStatus::Completed => {
                debug!(key = filename, "skip: already completed (ledger)");
                if let Err(e) = self
                    .cache
                    .set_file_status(file_hash, FileStatus::Completed, COMPLETED_TTL)
                    .await
                {
                    warn!(key = filename, error = %e, "failed to refresh status cache");
                }
                Ok(None)
            }
            JobStatus::Processing if job.is_stuck_processing(Utc::now()) && job.can_retry() => {
                info!(
                    key = filename,
                    job_id = %job.id,
                    retry_count = job.retry_count,
                    "stuck job, marking for retry"
                );
                if self.ledger.mark_job_for_retry(job.id).await? {
                    Ok(Some(job.id))
                } else {
                    info!(key = filename, job_id = %job.id, "max retries exceeded");
                    Ok(None)
                }
            }
            JobStatus::Processing => {
                debug!(key = filename, "skip: still processing");
                Ok(None)
            }
            status => {
                // Left for the reaper's sweeps.
                debug!(key = filename, %status, "skip: duplicate job");
                Ok(None)
            }
        }
    }
}
