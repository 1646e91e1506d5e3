//! In-memory storage backend.
//!
//! Objects are held in a `tokio::sync::RwLock<HashMap<...>>` keyed by
//! `(collection, key)`.  Nothing is persisted; the backend is meant for
//! tests and throwaway development servers.
//!
//! A configurable memory limit (`max_size_bytes`) caps total stored bytes.

use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use super::backend::{ObjectBody, ObjectHead, StorageBackend, StorageError, StorageResult};
use super::range::slice_range;

type ObjectKey = (String, String);

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Bytes,
    content_type: String,
    modified: i64,
}

/// In-memory storage backend.
pub struct MemoryBackend {
    objects: tokio::sync::RwLock<HashMap<ObjectKey, StoredBlob>>,
    /// Maximum bytes allowed.  0 means unlimited.
    max_size_bytes: u64,
}

impl MemoryBackend {
    /// Create an unbounded backend.
    pub fn new() -> Self {
        Self::with_limit(0)
    }

    /// Create a backend that refuses writes past `max_size_bytes` in total.
    pub fn with_limit(max_size_bytes: u64) -> Self {
        Self {
            objects: tokio::sync::RwLock::new(HashMap::new()),
            max_size_bytes,
        }
    }

    fn object_key(collection: &str, key: &str) -> ObjectKey {
        (collection.to_string(), key.to_string())
    }

    /// Total bytes currently stored.
    pub async fn size(&self) -> u64 {
        self.objects
            .read()
            .await
            .values()
            .map(|blob| blob.data.len() as u64)
            .sum()
    }

    /// Check whether replacing `replaced` bytes with `additional` bytes
    /// would exceed the memory limit.
    fn check_capacity(
        &self,
        objects: &HashMap<ObjectKey, StoredBlob>,
        replaced: u64,
        additional: u64,
    ) -> StorageResult<()> {
        if self.max_size_bytes == 0 {
            return Ok(());
        }
        let current: u64 = objects.values().map(|b| b.data.len() as u64).sum();
        let next = current.saturating_sub(replaced) + additional;
        if next > self.max_size_bytes {
            return Err(anyhow::anyhow!(
                "Memory limit exceeded: current={current}, additional={additional}, max={}",
                self.max_size_bytes
            )
            .into());
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemoryBackend {
    fn put(
        &self,
        collection: &str,
        key: &str,
        content_type: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>> {
        let object_key = Self::object_key(collection, key);
        let content_type = content_type.to_string();
        Box::pin(async move {
            let mut objects = self.objects.write().await;
            let replaced = objects
                .get(&object_key)
                .map(|b| b.data.len() as u64)
                .unwrap_or(0);
            self.check_capacity(&objects, replaced, data.len() as u64)?;
            objects.insert(
                object_key,
                StoredBlob {
                    data,
                    content_type,
                    modified: chrono::Utc::now().timestamp(),
                },
            );
            Ok(())
        })
    }

    fn get(
        &self,
        collection: &str,
        key: &str,
        range: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = StorageResult<ObjectBody>> + Send + '_>> {
        let object_key = Self::object_key(collection, key);
        let range = range.map(str::to_string);
        Box::pin(async move {
            let blob = self
                .objects
                .read()
                .await
                .get(&object_key)
                .cloned()
                .ok_or_else(|| StorageError::not_found(&object_key.0, &object_key.1))?;
            let (data, content_range) = slice_range(blob.data, range.as_deref())?;
            Ok(ObjectBody {
                content_length: data.len() as u64,
                data,
                content_type: blob.content_type,
                content_range,
            })
        })
    }

    fn head(
        &self,
        collection: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<ObjectHead>> + Send + '_>> {
        let object_key = Self::object_key(collection, key);
        Box::pin(async move {
            let objects = self.objects.read().await;
            let blob = objects
                .get(&object_key)
                .ok_or_else(|| StorageError::not_found(&object_key.0, &object_key.1))?;
            Ok(ObjectHead {
                content_type: blob.content_type.clone(),
                size: blob.data.len() as u64,
                last_modified: Some(blob.modified),
            })
        })
    }

    fn rename(
        &self,
        collection: &str,
        src: &str,
        dst: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>> {
        let src_key = Self::object_key(collection, src);
        let dst_key = Self::object_key(collection, dst);
        Box::pin(async move {
            let mut objects = self.objects.write().await;
            let blob = objects
                .remove(&src_key)
                .ok_or_else(|| StorageError::not_found(&src_key.0, &src_key.1))?;
            objects.insert(dst_key, blob);
            Ok(())
        })
    }

    fn delete(
        &self,
        collection: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>> {
        let object_key = Self::object_key(collection, key);
        Box::pin(async move {
            self.objects.write().await.remove(&object_key);
            Ok(())
        })
    }

    fn list(
        &self,
        collection: &str,
        prefix: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<Vec<String>>> + Send + '_>> {
        let collection = collection.to_string();
        let prefix = prefix.to_string();
        Box::pin(async move {
            let objects = self.objects.read().await;
            let mut keys: Vec<String> = objects
                .keys()
                .filter(|(c, k)| *c == collection && k.starts_with(&prefix))
                .map(|(_, k)| k.clone())
                .collect();
            keys.sort();
            Ok(keys)
        })
    }

    fn presign_read(
        &self,
        collection: &str,
        key: &str,
        _ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>> {
        let object_key = Self::object_key(collection, key);
        Box::pin(async move {
            if !self.objects.read().await.contains_key(&object_key) {
                return Err(StorageError::not_found(&object_key.0, &object_key.1));
            }
            Ok(format!("memory://{}/{}", object_key.0, object_key.1))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_get_roundtrip() {
        let backend = MemoryBackend::new();
        backend
            .put("photos", "origin/a.jpg", "image/jpeg", Bytes::from("hello"))
            .await
            .unwrap();

        let body = backend.get("photos", "origin/a.jpg", None).await.unwrap();
        assert_eq!(body.data, Bytes::from("hello"));
        assert_eq!(body.content_type, "image/jpeg");
        assert_eq!(body.content_length, 5);
        assert!(body.content_range.is_none());
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let backend = MemoryBackend::new();
        let err = backend.get("photos", "nope", None).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let backend = MemoryBackend::new();
        backend
            .put("a", "k", "text/plain", Bytes::from("1"))
            .await
            .unwrap();
        assert!(backend.get("b", "k", None).await.unwrap_err().is_not_found());
        assert!(backend.list("b", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ranged_get() {
        let backend = MemoryBackend::new();
        backend
            .put("photos", "k", "video/mp4", Bytes::from(vec![1u8; 500]))
            .await
            .unwrap();
        let body = backend
            .get("photos", "k", Some("bytes=0-99"))
            .await
            .unwrap();
        assert_eq!(body.content_length, 100);
        assert_eq!(body.content_range.as_deref(), Some("bytes 0-99/500"));
    }

    #[tokio::test]
    async fn test_head_reports_type_and_size() {
        let backend = MemoryBackend::new();
        backend
            .put("photos", "k", "image/png", Bytes::from("12345"))
            .await
            .unwrap();
        let head = backend.head("photos", "k").await.unwrap();
        assert_eq!(head.content_type, "image/png");
        assert_eq!(head.size, 5);
        assert!(backend.head("photos", "x").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_rename_moves_object() {
        let backend = MemoryBackend::new();
        backend
            .put("photos", "origin/a", "image/jpeg", Bytes::from("data"))
            .await
            .unwrap();
        backend.rename("photos", "origin/a", "trash/a").await.unwrap();

        assert!(backend
            .get("photos", "origin/a", None)
            .await
            .unwrap_err()
            .is_not_found());
        let moved = backend.get("photos", "trash/a", None).await.unwrap();
        assert_eq!(moved.data, Bytes::from("data"));
        assert_eq!(moved.content_type, "image/jpeg");
    }

    #[tokio::test]
    async fn test_delete_nonexistent_is_ok() {
        let backend = MemoryBackend::new();
        backend.delete("photos", "no-such-key").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_by_prefix_sorted() {
        let backend = MemoryBackend::new();
        for key in ["meta/wal/b.json", "meta/meta.json", "meta/wal/a.json", "origin/x"] {
            backend
                .put("photos", key, "application/json", Bytes::from("[]"))
                .await
                .unwrap();
        }
        let keys = backend.list("photos", "meta/wal/").await.unwrap();
        assert_eq!(keys, vec!["meta/wal/a.json", "meta/wal/b.json"]);
    }

    #[tokio::test]
    async fn test_presign_requires_existing_object() {
        let backend = MemoryBackend::new();
        assert!(backend
            .presign_read("photos", "k", Duration::from_secs(60))
            .await
            .unwrap_err()
            .is_not_found());
        backend
            .put("photos", "k", "image/jpeg", Bytes::from("x"))
            .await
            .unwrap();
        let url = backend
            .presign_read("photos", "k", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(url, "memory://photos/k");
    }

    #[tokio::test]
    async fn test_memory_limit_put() {
        let backend = MemoryBackend::with_limit(10);
        backend
            .put("photos", "a", "text/plain", Bytes::from(vec![0u8; 8]))
            .await
            .unwrap();
        assert!(backend
            .put("photos", "b", "text/plain", Bytes::from(vec![0u8; 8]))
            .await
            .is_err());
        // Overwriting the same key only counts the delta.
        backend
            .put("photos", "a", "text/plain", Bytes::from(vec![0u8; 10]))
            .await
            .unwrap();
        assert_eq!(backend.size().await, 10);
    }
}
