//! Stuck-job recovery.
//!
//! Two sweeps, run after every scan and once at startup:
//!
//! - `processing` rows older than one hour: the publisher died mid-flight
//!   or the parser never finished.
//! - `pending` rows older than ten minutes: the creator died between
//!   ledger insert and publish.
//!
//! Reaped jobs go back through the stored retry routine; jobs out of
//! budget land in `failed` there. The blob tier is never touched here,
//! stale blobs expire on their own TTL.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::kernel::cache::FileCache;
use crate::kernel::ledger::{Job, Ledger};

/// Counters for one reaper run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapStats {
    pub retried: usize,
    pub exhausted: usize,
}

pub struct Reaper {
    ledger: Arc<dyn Ledger>,
    cache: Arc<dyn FileCache>,
}

impl Reaper {
    pub fn new(ledger: Arc<dyn Ledger>, cache: Arc<dyn FileCache>) -> Self {
        Self { ledger, cache }
    }

    /// Run both sweeps.
    pub async fn run(&self) -> Result<ReapStats> {
        let mut stats = ReapStats::default();

        let stuck = self.ledger.find_stuck_jobs().await?;
        if !stuck.is_empty() {
            info!(count = stuck.len(), "found stuck processing jobs");
        }
        for job in &stuck {
            self.reap(job, &mut stats).await;
        }

        let stuck_pending = self.ledger.find_stuck_pending_jobs().await?;
        if !stuck_pending.is_empty() {
            info!(count = stuck_pending.len(), "found stuck pending jobs");
        }
        for job in &stuck_pending {
            self.reap(job, &mut stats).await;
        }

        Ok(stats)
    }

    async fn reap(&self, job: &Job, stats: &mut ReapStats) {
        match self.ledger.mark_job_for_retry(job.id).await {
            Ok(true) => {
                // Drop the stale marker so the next scan does not
                // short-circuit on it.
                if let Err(e) = self.cache.delete_file_status(&job.file_hash).await {
                    warn!(job_id = %job.id, error = %e, "failed to clear status cache");
                }
                info!(
                    job_id = %job.id,
                    filename = %job.filename,
                    retry_count = job.retry_count + 1,
                    max_retries = job.max_retries,
                    "marked stuck job for retry"
                );
                stats.retried += 1;
            }
            Ok(false) => {
                info!(job_id = %job.id, filename = %job.filename, "max retries exceeded, job failed");
                stats.exhausted += 1;
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "failed to mark job for retry");
            }
        }
    }
}
