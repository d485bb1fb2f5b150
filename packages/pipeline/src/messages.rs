//! Message envelopes carried on the two queues.
//!
//! Both queues carry JSON bodies. `parse_ready` envelopes reference the
//! file body through the blob cache instead of inlining it; `storage_ready`
//! envelopes carry the produced artifact as base64 because the parser side
//! has no durable store of its own.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::kernel::cache::blob_key;

/// Envelope published by the watcher once a file body is staged in the
/// blob cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParseReadyMessage {
    pub job_id: Uuid,
    pub file_hash: String,
    pub filename: String,
    /// Cache key the parser resolves the file body from. Valid for the
    /// blob TTL only.
    pub redis_key: String,
    pub file_size: i64,
}

impl ParseReadyMessage {
    pub fn new(job_id: Uuid, file_hash: &str, filename: &str, file_size: i64) -> Self {
        Self {
            job_id,
            file_hash: file_hash.to_string(),
            filename: filename.to_string(),
            redis_key: blob_key(file_hash),
            file_size,
        }
    }
}

/// Envelope consumed by the storage service. Produced by the parser once
/// an artifact has been rendered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageReadyMessage {
    pub job_id: Uuid,
    pub file_hash: String,
    pub bucket_name: String,
    pub filename: String,
    /// Base64-encoded artifact bytes.
    pub file_content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ready_wire_format() {
        let job_id = Uuid::new_v4();
        let msg = ParseReadyMessage::new(job_id, "abc123", "266_a.pdf", 1024);
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["job_id"], job_id.to_string());
        assert_eq!(json["file_hash"], "abc123");
        assert_eq!(json["filename"], "266_a.pdf");
        assert_eq!(json["redis_key"], "blob:abc123");
        assert_eq!(json["file_size"], 1024);
    }

    #[test]
    fn storage_ready_round_trips() {
        let msg = StorageReadyMessage {
            job_id: Uuid::new_v4(),
            file_hash: "abc123".into(),
            bucket_name: "outputs".into(),
            filename: "266_a.pdf".into(),
            file_content: "aGVsbG8=".into(),
        };
        let body = serde_json::to_vec(&msg).unwrap();
        let decoded: StorageReadyMessage = serde_json::from_slice(&body).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn storage_ready_rejects_missing_fields() {
        let body = br#"{"job_id":"not-a-uuid"}"#;
        assert!(serde_json::from_slice::<StorageReadyMessage>(body).is_err());
    }
}
