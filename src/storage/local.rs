//! Local filesystem storage backend.
//!
//! Objects are stored as flat files under `{root}/{collection}/{key}`.
//! Content types are kept in sidecar files under `{root}/.types/` since the
//! filesystem has nowhere else to put them.
//!
//! All writes follow crash-only design: write to temp file, fsync, rename.

use bytes::Bytes;
use std::future::Future;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use super::backend::{ObjectBody, ObjectHead, StorageBackend, StorageError, StorageResult};
use super::range::slice_range;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Stores objects on the local filesystem.
pub struct LocalBackend {
    /// Root directory for all stored objects.
    root: PathBuf,
}

impl LocalBackend {
    /// Create a new `LocalBackend` rooted at `root`.
    ///
    /// The directory will be created if it does not exist.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(root.join(".tmp"))?;
        std::fs::create_dir_all(root.join(".types"))?;
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    /// Reject keys that would escape the root or hit the internal
    /// `.tmp`/`.types` directories.
    fn check_relative(value: &str) -> StorageResult<()> {
        if value.is_empty() || value.starts_with('.') {
            return Err(anyhow::anyhow!("Invalid storage path component: {value:?}").into());
        }
        for component in Path::new(value).components() {
            if !matches!(component, Component::Normal(_)) {
                return Err(
                    anyhow::anyhow!("Path traversal detected in storage key: {value}").into()
                );
            }
        }
        Ok(())
    }

    /// Resolve a `(collection, key)` pair to an absolute file path.
    fn resolve(&self, collection: &str, key: &str) -> StorageResult<PathBuf> {
        Self::check_relative(collection)?;
        Self::check_relative(key)?;
        Ok(self.root.join(collection).join(key))
    }

    fn type_path(&self, collection: &str, key: &str) -> PathBuf {
        self.root.join(".types").join(collection).join(key)
    }

    /// Generate a temp file path under .tmp/ for atomic writes.
    fn temp_path(&self) -> PathBuf {
        let id = uuid::Uuid::new_v4();
        self.root.join(".tmp").join(format!("tmp-{id}"))
    }

    /// Crash-only write: temp file, fsync, rename.
    fn write_atomic(&self, final_path: &Path, data: &[u8]) -> StorageResult<()> {
        if let Some(parent) = final_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.temp_path();
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, final_path)?;
        Ok(())
    }

    fn read_content_type(&self, collection: &str, key: &str) -> String {
        std::fs::read_to_string(self.type_path(collection, key))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
    }

    fn remove_if_exists(path: &Path) -> StorageResult<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn collect_keys(dir: &Path, base: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                Self::collect_keys(&path, base, out)?;
            } else if let Ok(relative) = path.strip_prefix(base) {
                let key: Vec<String> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                out.push(key.join("/"));
            }
        }
        Ok(())
    }
}

impl StorageBackend for LocalBackend {
    fn put(
        &self,
        collection: &str,
        key: &str,
        content_type: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>> {
        let collection = collection.to_string();
        let key = key.to_string();
        let content_type = content_type.to_string();
        Box::pin(async move {
            let final_path = self.resolve(&collection, &key)?;
            self.write_atomic(&final_path, &data)?;
            self.write_atomic(&self.type_path(&collection, &key), content_type.as_bytes())?;
            Ok(())
        })
    }

    fn get(
        &self,
        collection: &str,
        key: &str,
        range: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = StorageResult<ObjectBody>> + Send + '_>> {
        let collection = collection.to_string();
        let key = key.to_string();
        let range = range.map(str::to_string);
        Box::pin(async move {
            let path = self.resolve(&collection, &key)?;
            let data = match std::fs::read(&path) {
                Ok(data) => Bytes::from(data),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(StorageError::not_found(&collection, &key));
                }
                Err(e) => return Err(e.into()),
            };
            let (data, content_range) = slice_range(data, range.as_deref())?;
            Ok(ObjectBody {
                content_length: data.len() as u64,
                data,
                content_type: self.read_content_type(&collection, &key),
                content_range,
            })
        })
    }

    fn head(
        &self,
        collection: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<ObjectHead>> + Send + '_>> {
        let collection = collection.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let path = self.resolve(&collection, &key)?;
            let meta = match std::fs::metadata(&path) {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => return Err(StorageError::not_found(&collection, &key)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(StorageError::not_found(&collection, &key));
                }
                Err(e) => return Err(e.into()),
            };
            let last_modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64);
            Ok(ObjectHead {
                content_type: self.read_content_type(&collection, &key),
                size: meta.len(),
                last_modified,
            })
        })
    }

    fn rename(
        &self,
        collection: &str,
        src: &str,
        dst: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>> {
        let collection = collection.to_string();
        let src = src.to_string();
        let dst = dst.to_string();
        Box::pin(async move {
            let src_path = self.resolve(&collection, &src)?;
            let dst_path = self.resolve(&collection, &dst)?;
            if !src_path.is_file() {
                return Err(StorageError::not_found(&collection, &src));
            }
            if let Some(parent) = dst_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&src_path, &dst_path)?;

            let src_type = self.type_path(&collection, &src);
            if src_type.is_file() {
                let dst_type = self.type_path(&collection, &dst);
                if let Some(parent) = dst_type.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::rename(&src_type, &dst_type)?;
            }
            Ok(())
        })
    }

    fn delete(
        &self,
        collection: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>> {
        let collection = collection.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let path = self.resolve(&collection, &key)?;
            Self::remove_if_exists(&path)?;
            Self::remove_if_exists(&self.type_path(&collection, &key))?;
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
            Self::check_relative(&collection)?;
            let base = self.root.join(&collection);
            if !base.is_dir() {
                return Ok(Vec::new());
            }
            let mut keys = Vec::new();
            Self::collect_keys(&base, &base, &mut keys)?;
            keys.retain(|k| k.starts_with(&prefix));
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
        let collection = collection.to_string();
        let key = key.to_string();
        Box::pin(async move {
            // Local files never expire; the derivation tools read the path directly.
            let path = self.resolve(&collection, &key)?;
            if !path.is_file() {
                return Err(StorageError::not_found(&collection, &key));
            }
            Ok(path.to_string_lossy().into_owned())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_backend() -> (tempfile::TempDir, LocalBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn test_put_and_get_roundtrip() {
        let (_dir, backend) = test_backend();
        backend
            .put("photos", "origin/a.jpg", "image/jpeg", Bytes::from("hello"))
            .await
            .unwrap();
        let body = backend.get("photos", "origin/a.jpg", None).await.unwrap();
        assert_eq!(body.data, Bytes::from("hello"));
        assert_eq!(body.content_type, "image/jpeg");
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (_dir, backend) = test_backend();
        let err = backend.get("photos", "missing", None).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let (_dir, backend) = test_backend();
        let result = backend
            .put("photos", "../escape", "text/plain", Bytes::from("x"))
            .await;
        assert!(result.is_err());
        let result = backend
            .put(".types", "k", "text/plain", Bytes::from("x"))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_head_and_rename_keep_content_type() {
        let (_dir, backend) = test_backend();
        backend
            .put("photos", "origin/v", "video/mp4", Bytes::from(vec![0u8; 42]))
            .await
            .unwrap();
        let head = backend.head("photos", "origin/v").await.unwrap();
        assert_eq!(head.size, 42);
        assert_eq!(head.content_type, "video/mp4");

        backend.rename("photos", "origin/v", "trash/v").await.unwrap();
        assert!(backend.head("photos", "origin/v").await.unwrap_err().is_not_found());
        let moved = backend.head("photos", "trash/v").await.unwrap();
        assert_eq!(moved.content_type, "video/mp4");
    }

    #[tokio::test]
    async fn test_delete_nonexistent_is_ok() {
        let (_dir, backend) = test_backend();
        backend.delete("photos", "nothing/here").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_nested_keys() {
        let (_dir, backend) = test_backend();
        for key in ["meta/meta.json", "meta/wal/1.json", "meta/wal/2.json", "origin/a"] {
            backend
                .put("photos", key, "application/json", Bytes::from("[]"))
                .await
                .unwrap();
        }
        assert_eq!(
            backend.list("photos", "meta/wal/").await.unwrap(),
            vec!["meta/wal/1.json", "meta/wal/2.json"]
        );
        assert_eq!(backend.list("photos", "").await.unwrap().len(), 4);
        assert!(backend.list("empty", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ranged_get() {
        let (_dir, backend) = test_backend();
        backend
            .put("photos", "k", "image/jpeg", Bytes::from("0123456789"))
            .await
            .unwrap();
        let body = backend.get("photos", "k", Some("bytes=-3")).await.unwrap();
        assert_eq!(body.data, Bytes::from("789"));
        assert_eq!(body.content_range.as_deref(), Some("bytes 7-9/10"));
    }

    #[tokio::test]
    async fn test_presign_returns_file_path() {
        let (dir, backend) = test_backend();
        backend
            .put("photos", "origin/a", "image/jpeg", Bytes::from("x"))
            .await
            .unwrap();
        let handle = backend
            .presign_read("photos", "origin/a", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(handle.ends_with("photos/origin/a"));
        assert!(handle.starts_with(&*dir.path().canonicalize().unwrap().to_string_lossy()));
    }
}
