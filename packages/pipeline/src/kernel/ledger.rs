//! Job ledger: the transactional store that owns job identity and truth.
//!
//! Every state-changing operation is a single statement or the one stored
//! routine (`mark_job_for_retry`); atomicity comes from `ON CONFLICT` and
//! the routine, never from cross-statement transactions.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// How long a `processing` job may sit before the reaper considers it stuck.
pub fn stuck_processing_after() -> chrono::Duration {
    chrono::Duration::hours(1)
}

/// How long a `pending` job may sit un-published before the reaper
/// considers its creator dead.
pub fn stuck_pending_after() -> chrono::Duration {
    chrono::Duration::minutes(10)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the `processing_jobs` table.
///
/// Keyed uniquely by `file_hash` (the source object's ETag, treated as an
/// opaque content fingerprint).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TypedBuilder)]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    #[builder(setter(into))]
    pub file_hash: String,
    #[builder(setter(into))]
    pub filename: String,
    #[builder(default)]
    pub status: JobStatus,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option, into))]
    pub pdf_location: Option<String>,
    #[builder(default, setter(strip_option, into))]
    pub error_message: Option<String>,
    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default = 3)]
    pub max_retries: i32,
}

impl Job {
    /// Whether this `processing` row has been in flight longer than the
    /// stuck threshold.
    pub fn is_stuck_processing(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing
            && self
                .processing_started_at
                .is_some_and(|started| now - started > stuck_processing_after())
    }

    /// Whether the retry budget still has room.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Operations on the job ledger.
///
/// `create_job` is the single point of mutual exclusion across watcher
/// replicas: exactly one caller receives a job id per `file_hash`.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Atomic insert keyed on `file_hash`. Returns the new job id, or
    /// `None` when a job for that fingerprint already exists.
    async fn create_job(&self, file_hash: &str, filename: &str) -> Result<Option<Uuid>>;

    async fn get_job_by_file_hash(&self, file_hash: &str) -> Result<Option<Job>>;

    async fn get_job_by_id(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// Update `status`. Sets `processing_started_at` only on the first
    /// transition into `processing`, `completed_at` only on the first
    /// transition into `completed`.
    async fn update_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<()>;

    /// Atomic `(status='completed', completed_at, pdf_location)` update;
    /// errors unless exactly one row is affected.
    async fn complete_job(&self, job_id: Uuid, pdf_location: &str) -> Result<()>;

    /// Terminal failure: `status='failed'` plus the error text.
    async fn fail_job(&self, job_id: Uuid, error_message: &str) -> Result<()>;

    /// Record error text without changing status. Used where the row must
    /// stay eligible for the reaper's sweeps.
    async fn record_job_error(&self, job_id: Uuid, error_message: &str) -> Result<()>;

    /// Stored routine. Returns `true` when the job went back to `pending`
    /// (retry budget had room), `false` when it was moved to `failed`.
    async fn mark_job_for_retry(&self, job_id: Uuid) -> Result<bool>;

    /// `processing` rows older than one hour with retries remaining,
    /// oldest first.
    async fn find_stuck_jobs(&self) -> Result<Vec<Job>>;

    /// `pending` rows older than ten minutes with retries remaining:
    /// their creator died between insert and publish.
    async fn find_stuck_pending_jobs(&self) -> Result<Vec<Job>>;
}

const JOB_COLUMNS: &str = "id, file_hash, filename, status, created_at, \
     processing_started_at, completed_at, pdf_location, error_message, \
     retry_count, max_retries";

/// Postgres-backed ledger.
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build the connection pool and verify connectivity.
    pub async fn connect(url: &str, max_pool_size: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_pool_size)
            .min_connections(max_pool_size / 2)
            .max_lifetime(Duration::from_secs(3600))
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .context("failed to connect to Postgres")?;

        Ok(Self { pool })
    }

    /// Apply schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Ledger for PostgresLedger {
    async fn create_job(&self, file_hash: &str, filename: &str) -> Result<Option<Uuid>> {
        let job_id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO processing_jobs (file_hash, filename, status)
            VALUES ($1, $2, 'pending')
            ON CONFLICT (file_hash) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(file_hash)
        .bind(filename)
        .fetch_optional(&self.pool)
        .await
        .context("failed to create job")?;

        Ok(job_id)
    }

    async fn get_job_by_file_hash(&self, file_hash: &str) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM processing_jobs WHERE file_hash = $1"
        ))
        .bind(file_hash)
        .fetch_optional(&self.pool)
        .await
        .context("failed to get job by file hash")?;

        Ok(job)
    }

    async fn get_job_by_id(&self, job_id: Uuid) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM processing_jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to get job by id")?;

        Ok(job)
    }

    async fn update_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE processing_jobs
            SET status = $1,
                processing_started_at = CASE
                    WHEN $1 = 'processing' AND processing_started_at IS NULL
                    THEN NOW() ELSE processing_started_at END,
                completed_at = CASE
                    WHEN $1 = 'completed' AND completed_at IS NULL
                    THEN NOW() ELSE completed_at END
            WHERE id = $2
            "#,
        )
        .bind(status)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("failed to update job status")?;

        Ok(())
    }

    async fn complete_job(&self, job_id: Uuid, pdf_location: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE processing_jobs
            SET status = 'completed',
                completed_at = NOW(),
                pdf_location = $1
            WHERE id = $2
            "#,
        )
        .bind(pdf_location)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("failed to complete job")?;

        anyhow::ensure!(
            result.rows_affected() == 1,
            "job not found: {job_id}"
        );
        Ok(())
    }

    async fn fail_job(&self, job_id: Uuid, error_message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE processing_jobs
            SET status = 'failed',
                error_message = $1
            WHERE id = $2
            "#,
        )
        .bind(error_message)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("failed to mark job as failed")?;

        Ok(())
    }

    async fn record_job_error(&self, job_id: Uuid, error_message: &str) -> Result<()> {
        sqlx::query("UPDATE processing_jobs SET error_message = $1 WHERE id = $2")
            .bind(error_message)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .context("failed to record job error")?;

        Ok(())
    }

    async fn mark_job_for_retry(&self, job_id: Uuid) -> Result<bool> {
        let retried = sqlx::query_scalar::<_, bool>("SELECT mark_job_for_retry($1)")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await
            .context("failed to mark job for retry")?;

        Ok(retried)
    }

    async fn find_stuck_jobs(&self) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM processing_jobs
            WHERE status = 'processing'
              AND processing_started_at < NOW() - INTERVAL '1 hour'
              AND retry_count < max_retries
            ORDER BY processing_started_at ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await
        .context("failed to find stuck jobs")?;

        Ok(jobs)
    }

    async fn find_stuck_pending_jobs(&self) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM processing_jobs
            WHERE status = 'pending'
              AND created_at < NOW() - INTERVAL '10 minutes'
              AND retry_count < max_retries
            ORDER BY created_at ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await
        .context("failed to find stuck pending jobs")?;

        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::builder()
            .file_hash("abc123")
            .filename("266_a.pdf")
            .build()
    }

    #[test]
    fn new_job_starts_pending_with_zero_retries() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.max_retries, 3);
    }

    #[test]
    fn processing_job_past_one_hour_is_stuck() {
        let now = Utc::now();
        let job = Job::builder()
            .file_hash("abc123")
            .filename("266_a.pdf")
            .status(JobStatus::Processing)
            .processing_started_at(now - chrono::Duration::minutes(65))
            .build();
        assert!(job.is_stuck_processing(now));
    }

    #[test]
    fn recently_started_job_is_not_stuck() {
        let now = Utc::now();
        let job = Job::builder()
            .file_hash("abc123")
            .filename("266_a.pdf")
            .status(JobStatus::Processing)
            .processing_started_at(now - chrono::Duration::minutes(10))
            .build();
        assert!(!job.is_stuck_processing(now));
    }

    #[test]
    fn pending_job_is_never_stuck_processing() {
        let now = Utc::now();
        let job = Job::builder()
            .file_hash("abc123")
            .filename("266_a.pdf")
            .processing_started_at(now - chrono::Duration::hours(2))
            .build();
        assert!(!job.is_stuck_processing(now));
    }

    #[test]
    fn retry_budget() {
        let mut job = sample_job();
        assert!(job.can_retry());
        job.retry_count = 3;
        assert!(!job.can_retry());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.to_string(), status.as_str());
        }
    }
}
