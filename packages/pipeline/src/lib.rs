// File ingest pipeline - core library
//
// Two cooperating services share this crate:
//
// - `file-watcher` scans a source bucket, deduplicates files against the
//   job ledger, stages file bodies in the blob cache and publishes
//   parse-ready envelopes.
// - `storage-service` consumes storage-ready envelopes, uploads the
//   produced artifacts and finalizes the ledger.
//
// The ledger (Postgres) owns job identity and truth; the cache (Redis) is
// advisory for status and a TTL-bounded transport for blobs; the broker
// (RabbitMQ) owns message transport; the object store (MinIO) owns durable
// bytes.

pub mod config;
pub mod kernel;
pub mod messages;
pub mod storage;
pub mod watcher;

pub use config::{StorageConfig, WatcherConfig};
