//! Status and blob tiers of the shared cache.
//!
//! Two disjoint keyspaces, both TTL-bound:
//!
//! - `processed:{file_hash}` - advisory status markers. The system must
//!   remain correct when any entry is missing or stale; the ledger is
//!   authoritative.
//! - `blob:{file_hash}` - raw file bytes, a TTL-bounded side channel
//!   between the watcher and the parser.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// TTL for a `processing` status marker; doubles as the in-flight guarantee.
pub const PROCESSING_TTL: Duration = Duration::from_secs(3600);

/// TTL for a `completed` status marker.
pub const COMPLETED_TTL: Duration = Duration::from_secs(24 * 3600);

/// TTL for staged file bodies. The parser must resolve a blob before this
/// expires.
pub const BLOB_TTL: Duration = Duration::from_secs(3600);

pub fn status_key(file_hash: &str) -> String {
    format!("processed:{file_hash}")
}

pub fn blob_key(file_hash: &str) -> String {
    format!("blob:{file_hash}")
}

/// Advisory file status as stored in the status tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Processing,
    Completed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Processing => "processing",
            FileStatus::Completed => "completed",
        }
    }

    /// Parse a cached value. Unknown values map to `None` so a malformed
    /// write degrades to a cache miss instead of an error.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "processing" => Some(FileStatus::Processing),
            "completed" => Some(FileStatus::Completed),
            _ => None,
        }
    }
}

/// Cache operations shared by both services.
#[async_trait]
pub trait FileCache: Send + Sync {
    /// Read the status marker for a fingerprint. `None` on miss or on an
    /// unrecognized value.
    async fn file_status(&self, file_hash: &str) -> Result<Option<FileStatus>>;

    async fn set_file_status(
        &self,
        file_hash: &str,
        status: FileStatus,
        ttl: Duration,
    ) -> Result<()>;

    async fn delete_file_status(&self, file_hash: &str) -> Result<()>;

    async fn put_blob(&self, file_hash: &str, body: &[u8], ttl: Duration) -> Result<()>;

    /// Idempotent; deleting an absent blob is not an error.
    async fn delete_blob(&self, file_hash: &str) -> Result<()>;
}

/// Redis-backed cache client.
#[derive(Clone)]
pub struct RedisFileCache {
    conn: ConnectionManager,
}

impl RedisFileCache {
    /// Connect under a 5 second deadline and verify the server responds
    /// to PING.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid Redis URL")?;
        let mut conn = tokio::time::timeout(
            Duration::from_secs(5),
            client.get_connection_manager(),
        )
        .await
        .context("timed out connecting to Redis")?
        .context("failed to connect to Redis")?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("failed to ping Redis")?;

        Ok(Self { conn })
    }
}

#[async_trait]
impl FileCache for RedisFileCache {
    async fn file_status(&self, file_hash: &str) -> Result<Option<FileStatus>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn
            .get(status_key(file_hash))
            .await
            .context("failed to get file status from Redis")?;

        Ok(value.as_deref().and_then(FileStatus::parse))
    }

    async fn set_file_status(
        &self,
        file_hash: &str,
        status: FileStatus,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(status_key(file_hash), status.as_str(), ttl.as_secs())
            .await
            .context("failed to set file status in Redis")?;

        Ok(())
    }

    async fn delete_file_status(&self, file_hash: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(status_key(file_hash))
            .await
            .context("failed to delete file status from Redis")?;

        Ok(())
    }

    async fn put_blob(&self, file_hash: &str, body: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(blob_key(file_hash), body, ttl.as_secs())
            .await
            .context("failed to store blob in Redis")?;

        Ok(())
    }

    async fn delete_blob(&self, file_hash: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(blob_key(file_hash))
            .await
            .context("failed to delete blob from Redis")?;

        Ok(())
    }
}
