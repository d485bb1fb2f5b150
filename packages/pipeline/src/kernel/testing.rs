//! In-memory test doubles for the four external seams.
//!
//! These let the watcher and consumer flows run end-to-end in tests
//! without Postgres, Redis, MinIO or RabbitMQ. Each double keeps enough
//! recorded state for assertions (TTLs written, payloads published,
//! uploads performed) and supports targeted failure injection.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::broker::QueuePublisher;
use super::cache::{FileCache, FileStatus};
use super::ledger::{stuck_pending_after, stuck_processing_after, Job, JobStatus, Ledger};
use super::object_store::{ObjectMeta, ObjectStore};

// =============================================================================
// Ledger
// =============================================================================

/// In-memory ledger with the same transition semantics as the Postgres
/// implementation, including the stored retry routine.
#[derive(Default)]
pub struct TestLedger {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl TestLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row directly, bypassing `create_job`.
    pub fn insert(&self, job: Job) {
        self.lock().insert(job.id, job);
    }

    pub fn job(&self, job_id: Uuid) -> Option<Job> {
        self.lock().get(&job_id).cloned()
    }

    pub fn job_by_hash(&self, file_hash: &str) -> Option<Job> {
        self.lock()
            .values()
            .find(|j| j.file_hash == file_hash)
            .cloned()
    }

    pub fn job_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Ledger for TestLedger {
    async fn create_job(&self, file_hash: &str, filename: &str) -> Result<Option<Uuid>> {
        let mut jobs = self.lock();
        if jobs.values().any(|j| j.file_hash == file_hash) {
            return Ok(None);
        }

        let job = Job::builder().file_hash(file_hash).filename(filename).build();
        let id = job.id;
        jobs.insert(id, job);
        Ok(Some(id))
    }

    async fn get_job_by_file_hash(&self, file_hash: &str) -> Result<Option<Job>> {
        Ok(self.job_by_hash(file_hash))
    }

    async fn get_job_by_id(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.job(job_id))
    }

    async fn update_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<()> {
        let mut jobs = self.lock();
        if let Some(job) = jobs.get_mut(&job_id) {
            job.status = status;
            if status == JobStatus::Processing && job.processing_started_at.is_none() {
                job.processing_started_at = Some(Utc::now());
            }
            if status == JobStatus::Completed && job.completed_at.is_none() {
                job.completed_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn complete_job(&self, job_id: Uuid, pdf_location: &str) -> Result<()> {
        let mut jobs = self.lock();
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow::anyhow!("job not found: {job_id}"))?;
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        job.pdf_location = Some(pdf_location.to_string());
        Ok(())
    }

    async fn fail_job(&self, job_id: Uuid, error_message: &str) -> Result<()> {
        let mut jobs = self.lock();
        if let Some(job) = jobs.get_mut(&job_id) {
            job.status = JobStatus::Failed;
            job.error_message = Some(error_message.to_string());
        }
        Ok(())
    }

    async fn record_job_error(&self, job_id: Uuid, error_message: &str) -> Result<()> {
        let mut jobs = self.lock();
        if let Some(job) = jobs.get_mut(&job_id) {
            job.error_message = Some(error_message.to_string());
        }
        Ok(())
    }

    async fn mark_job_for_retry(&self, job_id: Uuid) -> Result<bool> {
        let mut jobs = self.lock();
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow::anyhow!("job not found: {job_id}"))?;

        if job.retry_count < job.max_retries {
            job.status = JobStatus::Pending;
            job.processing_started_at = None;
            job.retry_count += 1;
            Ok(true)
        } else {
            job.status = JobStatus::Failed;
            job.error_message = Some("max retries exceeded".to_string());
            Ok(false)
        }
    }

    async fn find_stuck_jobs(&self) -> Result<Vec<Job>> {
        let now = Utc::now();
        let mut stuck: Vec<Job> = self
            .lock()
            .values()
            .filter(|j| {
                j.status == JobStatus::Processing
                    && j.processing_started_at
                        .is_some_and(|started| now - started > stuck_processing_after())
                    && j.can_retry()
            })
            .cloned()
            .collect();
        stuck.sort_by_key(|j| j.processing_started_at);
        Ok(stuck)
    }

    async fn find_stuck_pending_jobs(&self) -> Result<Vec<Job>> {
        let now = Utc::now();
        let mut stuck: Vec<Job> = self
            .lock()
            .values()
            .filter(|j| {
                j.status == JobStatus::Pending
                    && now - j.created_at > stuck_pending_after()
                    && j.can_retry()
            })
            .cloned()
            .collect();
        stuck.sort_by_key(|j| j.created_at);
        Ok(stuck)
    }
}

// =============================================================================
// Cache
// =============================================================================

/// Recorded cache write, TTL included.
#[derive(Debug, Clone)]
pub struct CachedStatus {
    pub status: FileStatus,
    pub ttl: Duration,
}

#[derive(Default)]
pub struct TestCache {
    statuses: Mutex<HashMap<String, CachedStatus>>,
    blobs: Mutex<HashMap<String, (Vec<u8>, Duration)>>,
    fail_status_reads: AtomicBool,
}

impl TestCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every status read return an error (the probe must fall
    /// through to the ledger).
    pub fn fail_status_reads(&self) {
        self.fail_status_reads.store(true, Ordering::SeqCst);
    }

    pub fn status_entry(&self, file_hash: &str) -> Option<CachedStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(file_hash)
            .cloned()
    }

    pub fn blob(&self, file_hash: &str) -> Option<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(file_hash)
            .map(|(body, _)| body.clone())
    }

    pub fn blob_ttl(&self, file_hash: &str) -> Option<Duration> {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(file_hash)
            .map(|(_, ttl)| *ttl)
    }
}

#[async_trait]
impl FileCache for TestCache {
    async fn file_status(&self, file_hash: &str) -> Result<Option<FileStatus>> {
        if self.fail_status_reads.load(Ordering::SeqCst) {
            anyhow::bail!("cache unavailable");
        }
        Ok(self.status_entry(file_hash).map(|e| e.status))
    }

    async fn set_file_status(
        &self,
        file_hash: &str,
        status: FileStatus,
        ttl: Duration,
    ) -> Result<()> {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(file_hash.to_string(), CachedStatus { status, ttl });
        Ok(())
    }

    async fn delete_file_status(&self, file_hash: &str) -> Result<()> {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(file_hash);
        Ok(())
    }

    async fn put_blob(&self, file_hash: &str, body: &[u8], ttl: Duration) -> Result<()> {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(file_hash.to_string(), (body.to_vec(), ttl));
        Ok(())
    }

    async fn delete_blob(&self, file_hash: &str) -> Result<()> {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(file_hash);
        Ok(())
    }
}

// =============================================================================
// Object store
// =============================================================================

type Bucket = BTreeMap<String, (Vec<u8>, String)>;

#[derive(Default)]
pub struct TestObjectStore {
    buckets: Mutex<HashMap<String, Bucket>>,
    download_delay: Mutex<Option<Duration>>,
    fail_downloads: AtomicBool,
    fail_uploads: AtomicBool,
    uploads: AtomicUsize,
}

impl TestObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage an object with the given unquoted ETag; listing returns it
    /// quoted, the way S3 does.
    pub fn put_source_object(&self, bucket: &str, key: &str, body: &[u8], etag: &str) {
        self.buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), (body.to_vec(), format!("\"{etag}\"")));
    }

    /// Delay every download; combined with a short deadline this drives
    /// the timeout path.
    pub fn delay_downloads(&self, delay: Duration) {
        *self.download_delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
    }

    pub fn fail_downloads(&self) {
        self.fail_downloads.store(true, Ordering::SeqCst);
    }

    pub fn fail_uploads(&self) {
        self.fail_uploads.store(true, Ordering::SeqCst);
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|(body, _)| body.clone())
    }

    pub fn bucket_exists(&self, bucket: &str) -> bool {
        self.buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(bucket)
    }

    pub fn object_count(&self, bucket: &str) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(bucket)
            .map(|b| b.len())
            .unwrap_or(0)
    }

    /// Number of successful `put_object` calls.
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for TestObjectStore {
    async fn ensure_bucket(&self, bucket: &str) -> Result<()> {
        self.buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(bucket.to_string())
            .or_default();
        Ok(())
    }

    async fn list_objects(&self, bucket: &str) -> Result<Vec<ObjectMeta>> {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entries) = buckets.get(bucket) else {
            return Ok(Vec::new());
        };

        Ok(entries
            .iter()
            .filter(|(key, _)| !key.ends_with('/'))
            .map(|(key, (body, etag))| ObjectMeta {
                key: key.clone(),
                etag: etag.clone(),
                size: body.len() as i64,
            })
            .collect())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let delay = *self.download_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_downloads.load(Ordering::SeqCst) {
            anyhow::bail!("connection reset");
        }

        self.object(bucket, key)
            .ok_or_else(|| anyhow::anyhow!("no such object: {bucket}/{key}"))
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        _content_type: &str,
    ) -> Result<()> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            anyhow::bail!("connection reset");
        }

        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), (body, String::new()));
        Ok(())
    }
}

// =============================================================================
// Broker
// =============================================================================

/// Publisher double that records payloads, in the vein of a capture-only
/// broker client.
#[derive(Default)]
pub struct TestPublisher {
    published: Mutex<Vec<Bytes>>,
    fail_publishes: AtomicBool,
}

impl TestPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_publishes(&self) {
        self.fail_publishes.store(true, Ordering::SeqCst);
    }

    pub fn publish_count(&self) -> usize {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn published(&self) -> Vec<Bytes> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Deserialize the n-th published payload.
    pub fn message<T: DeserializeOwned>(&self, index: usize) -> T {
        let payloads = self.published();
        serde_json::from_slice(&payloads[index]).expect("published payload should be valid JSON")
    }
}

#[async_trait]
impl QueuePublisher for TestPublisher {
    async fn publish(&self, payload: Bytes) -> Result<()> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            anyhow::bail!("channel closed");
        }
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(payload);
        Ok(())
    }
}
