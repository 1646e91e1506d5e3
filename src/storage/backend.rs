//! Abstract storage backend trait.
//!
//! Every storage backend must implement [`StorageBackend`].  All methods
//! address an object by `(collection, key)`, where the collection is the
//! bucket a set of related objects belongs to.  A missing key is always
//! reported as [`StorageError::NotFound`] so callers can tell it apart from
//! transient failures.

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors produced by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The key does not exist in the collection.
    #[error("object not found: {collection}/{key}")]
    NotFound { collection: String, key: String },

    /// The requested byte range cannot be satisfied.
    #[error("requested range not satisfiable: {range}")]
    InvalidRange { range: String },

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other backend failure (network, SDK, permissions).
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StorageError {
    pub fn not_found(collection: &str, key: &str) -> Self {
        Self::NotFound {
            collection: collection.to_string(),
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Bytes of a (possibly partial) object read.
#[derive(Debug, Clone)]
pub struct ObjectBody {
    /// Returned bytes; only the requested sub-range for ranged reads.
    pub data: Bytes,
    /// Content type recorded when the object was written.
    pub content_type: String,
    /// Length of `data`.
    pub content_length: u64,
    /// `bytes start-end/total` when a range was served.
    pub content_range: Option<String>,
}

/// Object attributes returned by [`StorageBackend::head`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    /// Declared content type.
    pub content_type: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time in Unix seconds, when the backend knows it.
    pub last_modified: Option<i64>,
}

/// Async object storage contract.
pub trait StorageBackend: Send + Sync + 'static {
    /// Write `data` to `key`, replacing any existing object.
    fn put(
        &self,
        collection: &str,
        key: &str,
        content_type: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>>;

    /// Read the object at `key`, optionally restricted to an HTTP-style
    /// `range` such as `bytes=0-99`.
    fn get(
        &self,
        collection: &str,
        key: &str,
        range: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = StorageResult<ObjectBody>> + Send + '_>>;

    /// Fetch content type and size without reading the body.
    fn head(
        &self,
        collection: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<ObjectHead>> + Send + '_>>;

    /// Move `src` to `dst` within the collection.
    fn rename(
        &self,
        collection: &str,
        src: &str,
        dst: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>>;

    /// Delete the object at `key`.  Deleting a missing key is not an error.
    fn delete(
        &self,
        collection: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>>;

    /// List every key starting with `prefix`, in lexicographic order.
    fn list(
        &self,
        collection: &str,
        prefix: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<Vec<String>>> + Send + '_>>;

    /// Produce a temporary read handle for `key`, valid for `ttl`.
    fn presign_read(
        &self,
        collection: &str,
        key: &str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>>;
}
