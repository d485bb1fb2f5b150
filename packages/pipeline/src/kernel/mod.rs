//! Shared infrastructure for both services.
//!
//! Each external system sits behind an `async_trait` seam with one
//! production implementation and one in-memory test double:
//!
//! - [`Ledger`] / [`PostgresLedger`] - transactional job store
//! - [`FileCache`] / [`RedisFileCache`] - status + blob tiers
//! - [`ObjectStore`] / [`S3ObjectStore`] - S3-compatible bucket API
//! - [`QueuePublisher`] / [`AmqpPublisher`] - durable queue publish
//!
//! Test doubles live in [`testing`].

pub mod broker;
pub mod cache;
pub mod ledger;
pub mod object_store;
pub mod signals;
pub mod testing;

pub use broker::{AmqpPublisher, QueuePublisher};
pub use cache::{FileCache, FileStatus, RedisFileCache};
pub use ledger::{Job, JobStatus, Ledger, PostgresLedger};
pub use object_store::{ObjectMeta, ObjectStore, S3ObjectStore};
