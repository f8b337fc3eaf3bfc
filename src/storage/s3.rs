use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;

use crate::codec::Prefix;
use crate::contracts::{EntityId, RecordStore, SequenceDocument, StoreError, Versioned};

/// Connection settings for the remote record store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub bucket: String,
    /// Custom endpoint (MinIO/LocalStack). `None` uses AWS defaults.
    pub endpoint: Option<String>,
    pub region: String,
    pub base_path: String,
}

impl RemoteConfig {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            endpoint: None,
            region: "us-east-1".into(),
            base_path: "fiscseq".into(),
        }
    }

    /// Creates a RemoteConfig from environment variables. Returns `None`
    /// when no bucket is configured.
    ///
    /// Environment variables:
    /// - `FISCSEQ_S3_BUCKET`: Bucket name (required)
    /// - `FISCSEQ_S3_ENDPOINT`: Custom endpoint URL
    /// - `FISCSEQ_S3_REGION`: Region for a custom endpoint (default: us-east-1)
    /// - `FISCSEQ_S3_BASE_PATH`: Key prefix (default: fiscseq)
    pub fn from_env() -> Option<Self> {
        let bucket = std::env::var("FISCSEQ_S3_BUCKET").ok().filter(|b| !b.is_empty())?;
        let mut config = Self::new(bucket);
        config.endpoint = std::env::var("FISCSEQ_S3_ENDPOINT").ok().filter(|e| !e.is_empty());
        if let Ok(region) = std::env::var("FISCSEQ_S3_REGION") {
            config.region = region;
        }
        if let Ok(base_path) = std::env::var("FISCSEQ_S3_BASE_PATH") {
            config.base_path = base_path.trim_matches('/').to_string();
        }
        Some(config)
    }
}

/// Sequence documents stored as JSON objects, updated with conditional
/// writes (`If-Match` on the loaded ETag, `If-None-Match: *` on creation).
pub struct S3RecordStore {
    client: Client,
    bucket: String,
    base_path: String,
}

impl S3RecordStore {
    /// Creates a store with default AWS configuration.
    pub async fn new(bucket: impl Into<String>, base_path: impl Into<String>) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self {
            client: Client::new(&config),
            bucket: bucket.into(),
            base_path: base_path.into(),
        }
    }

    /// Creates a store against a custom endpoint (for MinIO/LocalStack).
    pub async fn with_endpoint(
        bucket: impl Into<String>,
        base_path: impl Into<String>,
        endpoint: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        let endpoint = endpoint.into();
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region.into()))
            .load()
            .await;

        let s3_config = S3ConfigBuilder::from(&config)
            .endpoint_url(&endpoint)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(s3_config),
            bucket: bucket.into(),
            base_path: base_path.into(),
        }
    }

    pub async fn from_config(config: &RemoteConfig) -> Self {
        match &config.endpoint {
            Some(endpoint) => {
                tracing::info!(endpoint = %endpoint, bucket = %config.bucket, "connecting to S3-compatible record store");
                Self::with_endpoint(&config.bucket, &config.base_path, endpoint, &config.region).await
            }
            None => {
                tracing::info!(bucket = %config.bucket, "connecting to AWS S3 record store");
                Self::new(&config.bucket, &config.base_path).await
            }
        }
    }

    /// Format: {base_path}/sequences/{entity}/{prefix}.json
    fn object_key(&self, entity_id: EntityId, prefix: Prefix) -> String {
        object_key(&self.base_path, entity_id, prefix)
    }
}

fn object_key(base_path: &str, entity_id: EntityId, prefix: Prefix) -> String {
    if base_path.is_empty() {
        format!("sequences/{}/{}.json", entity_id, prefix)
    } else {
        format!("{}/sequences/{}/{}.json", base_path, entity_id, prefix)
    }
}

/// HTTP status of a failed call, when the service answered at all.
fn status_of<E>(err: &SdkError<E, HttpResponse>) -> Option<u16> {
    err.raw_response().map(|r| r.status().as_u16())
}

/// A failed GET means "no document yet" on NoSuchKey or a bare 404.
fn is_absent(no_such_key: bool, status: Option<u16>) -> bool {
    no_such_key || status == Some(404)
}

/// Maps a failed conditional PUT. 409 and 412 mean another writer moved the
/// object since it was loaded (or created it first).
fn put_error(key: &str, status: Option<u16>, detail: impl std::fmt::Display) -> StoreError {
    match status {
        Some(status @ (409 | 412)) => StoreError::Conflict(format!(
            "{}: conditional write rejected (HTTP {})",
            key, status
        )),
        _ => StoreError::S3(format!("{}: {}", key, detail)),
    }
}

impl RecordStore for S3RecordStore {
    async fn load(
        &self,
        entity_id: EntityId,
        prefix: Prefix,
    ) -> Result<Option<Versioned<SequenceDocument>>, StoreError> {
        let key = self.object_key(entity_id, prefix);
        let output = match self.client.get_object().bucket(&self.bucket).key(&key).send().await {
            Ok(output) => output,
            Err(e) => {
                let no_such_key = e.as_service_error().is_some_and(|se| se.is_no_such_key());
                if is_absent(no_such_key, status_of(&e)) {
                    return Ok(None);
                }
                return Err(StoreError::S3(format!("{}: {}", key, DisplayErrorContext(&e))));
            }
        };

        let version = output
            .e_tag()
            .map(String::from)
            .ok_or_else(|| StoreError::S3(format!("{}: response carries no ETag", key)))?;
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StoreError::S3(format!("{}: {}", key, e)))?
            .into_bytes();
        let value: SequenceDocument =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Some(Versioned { value, version }))
    }

    async fn store(
        &self,
        document: &SequenceDocument,
        expected: Option<&str>,
    ) -> Result<String, StoreError> {
        let key = self.object_key(document.entity_id, document.prefix);
        let body = serde_json::to_vec(document).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(Bytes::from(body)))
            .content_type("application/json");
        let request = match expected {
            Some(etag) => request.if_match(etag),
            None => request.if_none_match("*"),
        };

        match request.send().await {
            Ok(output) => output
                .e_tag()
                .map(String::from)
                .ok_or_else(|| StoreError::S3(format!("{}: response carries no ETag", key))),
            Err(e) => Err(put_error(&key, status_of(&e), DisplayErrorContext(&e))),
        }
    }

    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.base_path)
    }
}
