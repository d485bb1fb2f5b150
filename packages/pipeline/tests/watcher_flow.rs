//! End-to-end watcher scenarios over the in-memory seams.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pipeline_core::kernel::cache::{FileCache, FileStatus};
use pipeline_core::kernel::ledger::{Job, JobStatus};
use pipeline_core::kernel::testing::{TestCache, TestLedger, TestObjectStore, TestPublisher};
use pipeline_core::messages::ParseReadyMessage;
use pipeline_core::watcher::{FileProcessor, ProcessorConfig};
use tokio_util::sync::CancellationToken;

const HASH: &str = "abc123";
const KEY: &str = "266_a.pdf";

struct Harness {
    store: Arc<TestObjectStore>,
    ledger: Arc<TestLedger>,
    cache: Arc<TestCache>,
    publisher: Arc<TestPublisher>,
    processor: FileProcessor,
}

fn harness() -> Harness {
    harness_with(test_config())
}

fn test_config() -> ProcessorConfig {
    ProcessorConfig {
        rate_limit_per_second: 1000,
        ..Default::default()
    }
}

fn harness_with(config: ProcessorConfig) -> Harness {
    let store = Arc::new(TestObjectStore::new());
    let ledger = Arc::new(TestLedger::new());
    let cache = Arc::new(TestCache::new());
    let publisher = Arc::new(TestPublisher::new());

    let processor = FileProcessor::new(
        store.clone(),
        ledger.clone(),
        cache.clone(),
        publisher.clone(),
        config,
    );

    Harness {
        store,
        ledger,
        cache,
        publisher,
        processor,
    }
}

async fn scan(h: &Harness) -> pipeline_core::watcher::ScanStats {
    h.processor
        .run_scan(&CancellationToken::new())
        .await
        .expect("scan should succeed")
}

#[tokio::test]
async fn happy_path_queues_one_job() {
    let h = harness();
    h.store
        .put_source_object("uploads", KEY, &[7u8; 1024], HASH);

    let stats = scan(&h).await;
    assert_eq!(stats.found, 1);
    assert_eq!(stats.queued, 1);
    assert_eq!(stats.errors, 0);

    // Ledger row promoted to processing.
    let job = h.ledger.job_by_hash(HASH).expect("job should exist");
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.retry_count, 0);
    assert!(job.processing_started_at.is_some());
    assert_eq!(job.filename, KEY);

    // Body staged in the blob tier for one hour.
    assert_eq!(h.cache.blob(HASH).unwrap(), vec![7u8; 1024]);
    assert_eq!(h.cache.blob_ttl(HASH).unwrap(), Duration::from_secs(3600));

    // One envelope referencing the blob.
    assert_eq!(h.publisher.publish_count(), 1);
    let msg: ParseReadyMessage = h.publisher.message(0);
    assert_eq!(msg.job_id, job.id);
    assert_eq!(msg.file_hash, HASH);
    assert_eq!(msg.filename, KEY);
    assert_eq!(msg.redis_key, "blob:abc123");
    assert_eq!(msg.file_size, 1024);

    // Status cache warmed for one hour.
    let entry = h.cache.status_entry(HASH).unwrap();
    assert_eq!(entry.status, FileStatus::Processing);
    assert_eq!(entry.ttl, Duration::from_secs(3600));
}

#[tokio::test]
async fn rescan_is_deduplicated_by_status_cache() {
    let h = harness();
    h.store.put_source_object("uploads", KEY, b"body", HASH);

    scan(&h).await;
    let stats = scan(&h).await;

    assert_eq!(stats.queued, 0);
    assert_eq!(stats.skipped, 1);
    assert_eq!(h.ledger.job_count(), 1);
    assert_eq!(h.publisher.publish_count(), 1);
}

#[tokio::test]
async fn rescan_is_deduplicated_by_ledger_when_cache_is_cold() {
    let h = harness();
    h.store.put_source_object("uploads", KEY, b"body", HASH);
    scan(&h).await;

    // Cache restarted; the ledger is still authoritative.
    h.cache
        .delete_file_status(HASH)
        .await
        .expect("delete should succeed");

    let stats = scan(&h).await;
    assert_eq!(stats.skipped, 1);
    assert_eq!(h.ledger.job_count(), 1);
    assert_eq!(h.publisher.publish_count(), 1);
}

#[tokio::test]
async fn repeated_scans_produce_one_row_per_fingerprint() {
    let h = harness();
    h.store.put_source_object("uploads", "a.pdf", b"one", "h1");
    h.store.put_source_object("uploads", "b.pdf", b"two", "h2");

    for _ in 0..5 {
        scan(&h).await;
    }

    assert_eq!(h.ledger.job_count(), 2);
    assert_eq!(h.publisher.publish_count(), 2);
}

#[tokio::test]
async fn completed_row_refreshes_status_cache_and_skips() {
    let h = harness();
    h.store.put_source_object("uploads", KEY, b"body", HASH);
    h.ledger.insert(
        Job::builder()
            .file_hash(HASH)
            .filename(KEY)
            .status(JobStatus::Completed)
            .pdf_location("outputs/266_a.pdf")
            .build(),
    );

    let stats = scan(&h).await;
    assert_eq!(stats.skipped, 1);
    assert_eq!(h.publisher.publish_count(), 0);

    let entry = h.cache.status_entry(HASH).unwrap();
    assert_eq!(entry.status, FileStatus::Completed);
    assert_eq!(entry.ttl, Duration::from_secs(86400));
}

#[tokio::test]
async fn cache_read_failure_falls_through_to_ledger() {
    let h = harness();
    h.cache.fail_status_reads();
    h.store.put_source_object("uploads", KEY, b"body", HASH);

    let stats = scan(&h).await;
    assert_eq!(stats.queued, 1);
    assert_eq!(h.ledger.job_count(), 1);
    assert_eq!(h.publisher.publish_count(), 1);
}

#[tokio::test]
async fn stuck_processing_row_is_retried_inline() {
    let h = harness();
    h.store.put_source_object("uploads", KEY, b"body", HASH);
    h.ledger.insert(
        Job::builder()
            .file_hash(HASH)
            .filename(KEY)
            .status(JobStatus::Processing)
            .processing_started_at(Utc::now() - chrono::Duration::minutes(65))
            .build(),
    );

    let stats = scan(&h).await;
    assert_eq!(stats.queued, 1);
    assert_eq!(h.publisher.publish_count(), 1);

    let job = h.ledger.job_by_hash(HASH).unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.retry_count, 1);
}

#[tokio::test]
async fn recently_started_processing_row_is_left_alone() {
    let h = harness();
    h.store.put_source_object("uploads", KEY, b"body", HASH);
    h.ledger.insert(
        Job::builder()
            .file_hash(HASH)
            .filename(KEY)
            .status(JobStatus::Processing)
            .processing_started_at(Utc::now() - chrono::Duration::minutes(5))
            .build(),
    );

    let stats = scan(&h).await;
    assert_eq!(stats.skipped, 1);
    assert_eq!(h.publisher.publish_count(), 0);
}

#[tokio::test]
async fn download_timeout_marks_job_for_retry() {
    tokio::time::pause();

    let h = harness_with(ProcessorConfig {
        download_timeout: Duration::from_millis(50),
        ..test_config()
    });
    h.store.put_source_object("uploads", KEY, b"body", HASH);
    h.store.delay_downloads(Duration::from_millis(500));

    let stats = scan(&h).await;
    assert_eq!(stats.errors, 1);
    assert_eq!(h.publisher.publish_count(), 0);
    assert!(h.cache.blob(HASH).is_none());

    // Back to pending with the budget consumed; redelivered next scan.
    let job = h.ledger.job_by_hash(HASH).unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 1);
    assert_eq!(
        job.error_message.as_deref(),
        Some("Download timeout after 5 minutes")
    );
}

#[tokio::test]
async fn download_failure_records_error_without_consuming_budget() {
    let h = harness();
    h.store.put_source_object("uploads", KEY, b"body", HASH);
    h.store.fail_downloads();

    let stats = scan(&h).await;
    assert_eq!(stats.errors, 1);
    assert_eq!(h.publisher.publish_count(), 0);

    let job = h.ledger.job_by_hash(HASH).unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 0);
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("Download failed: "));
}

#[tokio::test]
async fn publish_failure_deletes_the_staged_blob() {
    let h = harness();
    h.store.put_source_object("uploads", KEY, b"body", HASH);
    h.publisher.fail_publishes();

    let stats = scan(&h).await;
    assert_eq!(stats.errors, 1);

    let job = h.ledger.job_by_hash(HASH).unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("MQ publish failed: "));

    // Compensating delete: no orphaned blob, no status marker.
    assert!(h.cache.blob(HASH).is_none());
    assert!(h.cache.status_entry(HASH).is_none());
}

#[tokio::test]
async fn scan_batches_large_listings() {
    tokio::time::pause();

    let h = harness_with(ProcessorConfig {
        batch_size: 3,
        ..test_config()
    });
    for i in 0..7 {
        h.store
            .put_source_object("uploads", &format!("f{i}.pdf"), b"body", &format!("h{i}"));
    }

    let stats = scan(&h).await;
    assert_eq!(stats.found, 7);
    assert_eq!(stats.queued, 7);
    assert_eq!(h.publisher.publish_count(), 7);
}
