//! S3 gateway storage backend.
//!
//! Forwards storage operations to an S3-compatible service.  Each
//! collection maps to an upstream bucket of the same name; keys are
//! optionally namespaced with a prefix:
//!
//!   `{prefix}{key}` in bucket `{collection}`
//!
//! Credentials are resolved via the standard AWS credential chain
//! (env vars, `~/.aws/credentials`, IAM role, etc.) unless explicit keys
//! are configured.

use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info};

use super::backend::{ObjectBody, ObjectHead, StorageBackend, StorageError, StorageResult};
use crate::config::AwsStorageConfig;

/// `x-amz-copy-source` is a URL path: everything but unreserved characters
/// and the separator gets escaped.
const COPY_SOURCE_ENCODE_SET: percent_encoding::AsciiSet = percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

fn copy_source(bucket: &str, s3_key: &str) -> String {
    let key = percent_encoding::utf8_percent_encode(s3_key, &COPY_SOURCE_ENCODE_SET);
    format!("{bucket}/{key}")
}

/// Gateway backend that forwards operations to S3.
pub struct AwsGatewayBackend {
    /// AWS S3 SDK client.
    client: Client,
    /// Key prefix for all objects in the upstream buckets.
    prefix: String,
}

impl AwsGatewayBackend {
    /// Create a new S3 gateway backend from configuration.
    pub async fn new(config: &AwsStorageConfig) -> anyhow::Result<Self> {
        let timeouts = aws_config::timeout::TimeoutConfig::builder()
            .operation_timeout(Duration::from_secs(config.operation_timeout_seconds))
            .build();

        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .timeout_config(timeouts);

        if !config.endpoint_url.is_empty() {
            config_loader = config_loader.endpoint_url(&config.endpoint_url);
        }

        if !config.access_key_id.is_empty() && !config.secret_access_key.is_empty() {
            let creds = aws_sdk_s3::config::Credentials::new(
                &config.access_key_id,
                &config.secret_access_key,
                None, // session_token
                None, // expiry
                "photostash-config",
            );
            config_loader = config_loader.credentials_provider(creds);
        }

        let sdk_config = config_loader.load().await;

        let s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.use_path_style);

        let client = Client::from_conf(s3_config_builder.build());

        info!(
            "S3 gateway backend initialized: region={} endpoint='{}' prefix='{}'",
            config.region, config.endpoint_url, config.prefix
        );

        Ok(Self {
            client,
            prefix: config.prefix.clone(),
        })
    }

    /// Map a storage key to an upstream S3 key.
    fn s3_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Strip the configured prefix from an upstream S3 key.
    fn strip_prefix<'a>(&self, s3_key: &'a str) -> &'a str {
        s3_key.strip_prefix(self.prefix.as_str()).unwrap_or(s3_key)
    }

    /// Map an AWS SDK error to a storage error with context.
    fn map_sdk_error(context: &str, err: impl std::fmt::Display) -> StorageError {
        StorageError::Backend(anyhow::anyhow!("S3 {context}: {err}"))
    }
}

impl StorageBackend for AwsGatewayBackend {
    fn put(
        &self,
        collection: &str,
        key: &str,
        content_type: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>> {
        let bucket = collection.to_string();
        let s3_key = self.s3_key(key);
        let content_type = content_type.to_string();
        Box::pin(async move {
            debug!("S3 put_object: bucket={} key={}", bucket, s3_key);

            self.client
                .put_object()
                .bucket(&bucket)
                .key(&s3_key)
                .content_type(content_type)
                .body(ByteStream::from(data))
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("put_object", e))?;

            Ok(())
        })
    }

    fn get(
        &self,
        collection: &str,
        key: &str,
        range: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = StorageResult<ObjectBody>> + Send + '_>> {
        let bucket = collection.to_string();
        let key = key.to_string();
        let range = range.map(str::to_string);
        Box::pin(async move {
            let s3_key = self.s3_key(&key);

            debug!("S3 get_object: bucket={} key={} range={:?}", bucket, s3_key, range);

            let mut request = self.client.get_object().bucket(&bucket).key(&s3_key);
            if let Some(ref r) = range {
                request = request.range(r);
            }

            let resp = request.send().await.map_err(|e| {
                let service_err = e.into_service_error();
                if service_err.is_no_such_key() {
                    StorageError::not_found(&bucket, &key)
                } else if service_err.code() == Some("InvalidRange") {
                    StorageError::InvalidRange {
                        range: range.clone().unwrap_or_default(),
                    }
                } else {
                    Self::map_sdk_error("get_object", service_err)
                }
            })?;

            let content_type = resp
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string();
            let content_range = resp.content_range().map(str::to_string);

            let data = resp
                .body
                .collect()
                .await
                .map_err(|e| Self::map_sdk_error("get_object body", e))?
                .into_bytes();

            Ok(ObjectBody {
                content_length: data.len() as u64,
                data,
                content_type,
                content_range,
            })
        })
    }

    fn head(
        &self,
        collection: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<ObjectHead>> + Send + '_>> {
        let bucket = collection.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let s3_key = self.s3_key(&key);

            debug!("S3 head_object: bucket={} key={}", bucket, s3_key);

            let resp = self
                .client
                .head_object()
                .bucket(&bucket)
                .key(&s3_key)
                .send()
                .await
                .map_err(|e| {
                    let service_err = e.into_service_error();
                    if service_err.is_not_found() {
                        StorageError::not_found(&bucket, &key)
                    } else {
                        Self::map_sdk_error("head_object", service_err)
                    }
                })?;

            Ok(ObjectHead {
                content_type: resp
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string(),
                size: resp.content_length().unwrap_or(0).max(0) as u64,
                last_modified: resp.last_modified().map(|t| t.secs()),
            })
        })
    }

    fn rename(
        &self,
        collection: &str,
        src: &str,
        dst: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>> {
        let bucket = collection.to_string();
        let src = src.to_string();
        let dst = dst.to_string();
        Box::pin(async move {
            let src_s3_key = self.s3_key(&src);
            let dst_s3_key = self.s3_key(&dst);

            debug!(
                "S3 rename: bucket={} src={} dst={}",
                bucket, src_s3_key, dst_s3_key
            );

            // S3 has no rename: server-side copy, then delete the source.
            self.client
                .copy_object()
                .bucket(&bucket)
                .key(&dst_s3_key)
                .copy_source(copy_source(&bucket, &src_s3_key))
                .send()
                .await
                .map_err(|e| {
                    let service_err = e.into_service_error();
                    if service_err.code() == Some("NoSuchKey") {
                        StorageError::not_found(&bucket, &src)
                    } else {
                        Self::map_sdk_error("copy_object", service_err)
                    }
                })?;

            self.client
                .delete_object()
                .bucket(&bucket)
                .key(&src_s3_key)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("delete_object", e))?;

            Ok(())
        })
    }

    fn delete(
        &self,
        collection: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>> {
        let bucket = collection.to_string();
        let s3_key = self.s3_key(key);
        Box::pin(async move {
            debug!("S3 delete_object: bucket={} key={}", bucket, s3_key);

            // S3 delete_object is idempotent -- no error for missing keys.
            self.client
                .delete_object()
                .bucket(&bucket)
                .key(&s3_key)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("delete_object", e))?;

            Ok(())
        })
    }

    fn list(
        &self,
        collection: &str,
        prefix: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<Vec<String>>> + Send + '_>> {
        let bucket = collection.to_string();
        let s3_prefix = self.s3_key(prefix);
        Box::pin(async move {
            debug!("S3 list_objects_v2: bucket={} prefix={}", bucket, s3_prefix);

            let mut keys = Vec::new();
            let mut continuation_token: Option<String> = None;

            loop {
                let mut request = self
                    .client
                    .list_objects_v2()
                    .bucket(&bucket)
                    .prefix(&s3_prefix);
                if let Some(token) = continuation_token.take() {
                    request = request.continuation_token(token);
                }

                let resp = request
                    .send()
                    .await
                    .map_err(|e| Self::map_sdk_error("list_objects_v2", e))?;

                for object in resp.contents() {
                    if let Some(k) = object.key() {
                        keys.push(self.strip_prefix(k).to_string());
                    }
                }

                if resp.is_truncated() == Some(true) {
                    continuation_token = resp.next_continuation_token().map(str::to_string);
                    if continuation_token.is_none() {
                        break;
                    }
                } else {
                    break;
                }
            }

            keys.sort();
            Ok(keys)
        })
    }

    fn presign_read(
        &self,
        collection: &str,
        key: &str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>> {
        let bucket = collection.to_string();
        let s3_key = self.s3_key(key);
        Box::pin(async move {
            let presign_config = PresigningConfig::expires_in(ttl)
                .map_err(|e| Self::map_sdk_error("presign config", e))?;

            let presigned = self
                .client
                .get_object()
                .bucket(&bucket)
                .key(&s3_key)
                .presigned(presign_config)
                .await
                .map_err(|e| Self::map_sdk_error("presign get_object", e))?;

            Ok(presigned.uri().to_string())
        })
    }
}
