//! Stuck-job recovery scenarios.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pipeline_core::kernel::cache::{FileCache, FileStatus};
use pipeline_core::kernel::ledger::{Job, JobStatus};
use pipeline_core::kernel::testing::{TestCache, TestLedger, TestObjectStore, TestPublisher};
use pipeline_core::watcher::{FileProcessor, ProcessorConfig, Reaper};
use tokio_util::sync::CancellationToken;

const HASH: &str = "abc123";
const KEY: &str = "266_a.pdf";

fn fixtures() -> (Arc<TestLedger>, Arc<TestCache>, Reaper) {
    let ledger = Arc::new(TestLedger::new());
    let cache = Arc::new(TestCache::new());
    let reaper = Reaper::new(ledger.clone(), cache.clone());
    (ledger, cache, reaper)
}

fn stuck_processing_job(retry_count: i32) -> Job {
    Job::builder()
        .file_hash(HASH)
        .filename(KEY)
        .status(JobStatus::Processing)
        .processing_started_at(Utc::now() - chrono::Duration::minutes(65))
        .retry_count(retry_count)
        .build()
}

#[tokio::test]
async fn stuck_processing_job_goes_back_to_pending() {
    let (ledger, cache, reaper) = fixtures();
    ledger.insert(stuck_processing_job(0));
    cache
        .set_file_status(HASH, FileStatus::Processing, Duration::from_secs(3600))
        .await
        .unwrap();

    let stats = reaper.run().await.unwrap();
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.exhausted, 0);

    let job = ledger.job_by_hash(HASH).unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.processing_started_at.is_none());
    assert_eq!(job.retry_count, 1);

    // Stale marker dropped so the next scan re-evaluates.
    assert!(cache.status_entry(HASH).is_none());
}

#[tokio::test]
async fn exhausted_job_is_failed_not_retried() {
    let (ledger, _cache, reaper) = fixtures();
    ledger.insert(stuck_processing_job(3));

    let stats = reaper.run().await.unwrap();
    assert_eq!(stats.retried, 0);
    assert_eq!(stats.exhausted, 1);

    let job = ledger.job_by_hash(HASH).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some("max retries exceeded"));
}

#[tokio::test]
async fn stuck_pending_job_is_swept() {
    // A creator that died between ledger insert and publish leaves a
    // pending row with no envelope anywhere.
    let (ledger, _cache, reaper) = fixtures();
    ledger.insert(
        Job::builder()
            .file_hash(HASH)
            .filename(KEY)
            .created_at(Utc::now() - chrono::Duration::minutes(11))
            .build(),
    );

    let stats = reaper.run().await.unwrap();
    assert_eq!(stats.retried, 1);

    let job = ledger.job_by_hash(HASH).unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 1);
}

#[tokio::test]
async fn healthy_jobs_are_left_alone() {
    let (ledger, _cache, reaper) = fixtures();
    ledger.insert(
        Job::builder()
            .file_hash("fresh-pending")
            .filename("a.pdf")
            .created_at(Utc::now() - chrono::Duration::minutes(2))
            .build(),
    );
    ledger.insert(
        Job::builder()
            .file_hash("fresh-processing")
            .filename("b.pdf")
            .status(JobStatus::Processing)
            .processing_started_at(Utc::now() - chrono::Duration::minutes(10))
            .build(),
    );

    let stats = reaper.run().await.unwrap();
    assert_eq!(stats.retried, 0);
    assert_eq!(stats.exhausted, 0);
    assert_eq!(
        ledger.job_by_hash("fresh-pending").unwrap().retry_count,
        0
    );
}

#[tokio::test]
async fn reaped_job_is_republished_on_the_next_scan() {
    let (ledger, cache, reaper) = fixtures();
    let store = Arc::new(TestObjectStore::new());
    let publisher = Arc::new(TestPublisher::new());
    store.put_source_object("uploads", KEY, b"body", HASH);

    ledger.insert(stuck_processing_job(0));
    cache
        .set_file_status(HASH, FileStatus::Processing, Duration::from_secs(3600))
        .await
        .unwrap();

    reaper.run().await.unwrap();

    let processor = FileProcessor::new(
        store,
        ledger.clone(),
        cache.clone(),
        publisher.clone(),
        ProcessorConfig {
            rate_limit_per_second: 1000,
            ..Default::default()
        },
    );
    let stats = processor.run_scan(&CancellationToken::new()).await.unwrap();

    assert_eq!(stats.queued, 1);
    assert_eq!(publisher.publish_count(), 1);

    let job = ledger.job_by_hash(HASH).unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.retry_count, 1);
    assert!(job.processing_started_at.is_some());
}
