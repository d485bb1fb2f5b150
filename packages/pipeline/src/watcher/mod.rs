//! The watcher service: periodic scan, dedup/handoff, stuck-job recovery.

pub mod processor;
pub mod reaper;

use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use processor::{FileProcessor, ProcessorConfig, ScanStats, DOWNLOAD_TIMEOUT};
pub use reaper::{ReapStats, Reaper};

/// Drives scan + reap on a fixed interval until shutdown.
///
/// Errors inside a cycle are logged and the loop continues; the next cycle
/// re-observes the same bucket state.
pub struct WatcherService {
    processor: FileProcessor,
    reaper: Reaper,
    poll_interval: Duration,
}

impl WatcherService {
    pub fn new(processor: FileProcessor, reaper: Reaper, poll_interval: Duration) -> Self {
        Self {
            processor,
            reaper,
            poll_interval,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(interval = ?self.poll_interval, "file watcher starting");

        loop {
            if let Err(e) = self.processor.run_scan(&shutdown).await {
                error!(error = %e, "scan failed");
            }
            if let Err(e) = self.reaper.run().await {
                error!(error = %e, "reaper run failed");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("file watcher stopped");
        Ok(())
    }
}
