//! S3-compatible object store client.
//!
//! Both services talk to MinIO through this seam: the watcher lists and
//! downloads source files, the storage service uploads artifacts. Bodies
//! are bounded and buffered in memory; there is no streaming path.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

/// Listing entry: key plus the metadata the dedup path needs. No bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    /// Raw ETag as returned by the store, surrounding quotes included.
    pub etag: String,
    pub size: i64,
}

impl ObjectMeta {
    /// Content fingerprint: the ETag with surrounding quote characters
    /// stripped. Opaque; multipart uploads yield composite ETags that are
    /// not MD5s.
    pub fn file_hash(&self) -> &str {
        self.etag.trim_matches('"')
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create the bucket when absent; succeed when it already exists.
    async fn ensure_bucket(&self, bucket: &str) -> Result<()>;

    /// List all objects recursively (keys + ETag + size only). Keys ending
    /// in `/` are skipped.
    async fn list_objects(&self, bucket: &str) -> Result<Vec<ObjectMeta>>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<()>;
}

/// MinIO client over the AWS SDK: custom endpoint, static credentials,
/// path-style addressing.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub fn new(endpoint: &str, access_key: &str, secret_key: &str, use_ssl: bool) -> Self {
        let scheme = if use_ssl { "https" } else { "http" };
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(format!("{scheme}://{endpoint}"))
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new(
                access_key, secret_key, None, None, "static",
            ))
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(config),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn ensure_bucket(&self, bucket: &str) -> Result<()> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => {
                tracing::debug!(bucket, "bucket exists");
                Ok(())
            }
            Err(SdkError::ServiceError(err)) if err.err().is_not_found() => {
                self.client
                    .create_bucket()
                    .bucket(bucket)
                    .send()
                    .await
                    .with_context(|| format!("failed to create bucket {bucket}"))?;
                tracing::info!(bucket, "created bucket");
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("failed to check bucket {bucket}")),
        }
    }

    async fn list_objects(&self, bucket: &str) -> Result<Vec<ObjectMeta>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .with_context(|| format!("failed to list bucket {bucket}"))?;

            for obj in resp.contents() {
                let Some(key) = obj.key() else { continue };
                if key.ends_with('/') {
                    continue;
                }
                objects.push(ObjectMeta {
                    key: key.to_string(),
                    etag: obj.e_tag().unwrap_or_default().to_string(),
                    size: obj.size().unwrap_or(0),
                });
            }

            match resp.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        Ok(objects)
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("failed to get object {bucket}/{key}"))?;

        let body = resp
            .body
            .collect()
            .await
            .with_context(|| format!("failed to read object body {bucket}/{key}"))?;

        Ok(body.into_bytes().to_vec())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .with_context(|| format!("failed to upload object {bucket}/{key}"))?;

        Ok(())
    }
}
