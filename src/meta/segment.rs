//! WAL segment documents.
//!
//! A segment is an immutable JSON array of [`MetaDelta`]s written once per
//! processed batch under `meta/wal/<uuid>.json`.  Random names mean
//! concurrent writers never collide, and a segment is never rewritten.

use bytes::Bytes;
use metrics::counter;
use std::sync::Arc;
use tracing::debug;

use super::record::MetaDelta;
use crate::errors::SyncError;
use crate::keys::{self, JSON_CONTENT_TYPE, SEGMENT_PREFIX};
use crate::metrics::SEGMENTS_WRITTEN_TOTAL;
use crate::storage::backend::{StorageBackend, StorageError};

/// Persists delta batches as new segment documents.
#[derive(Clone)]
pub struct SegmentWriter {
    storage: Arc<dyn StorageBackend>,
}

impl SegmentWriter {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Write `deltas` as a single new segment.
    ///
    /// Returns the segment key, or `None` when there was nothing to write.
    pub async fn write(
        &self,
        collection: &str,
        deltas: &[MetaDelta],
    ) -> Result<Option<String>, SyncError> {
        if deltas.is_empty() {
            return Ok(None);
        }

        let key = keys::new_segment_key();
        let body = serde_json::to_vec(deltas).map_err(|source| SyncError::CorruptDocument {
            key: key.clone(),
            source,
        })?;

        self.storage
            .put(collection, &key, JSON_CONTENT_TYPE, Bytes::from(body))
            .await?;

        counter!(SEGMENTS_WRITTEN_TOTAL).increment(1);
        debug!(collection, segment = %key, deltas = deltas.len(), "wrote WAL segment");
        Ok(Some(key))
    }
}

/// Keys of all pending segments in `collection`, oldest name first.
pub(crate) async fn list_segments(
    storage: &dyn StorageBackend,
    collection: &str,
) -> Result<Vec<String>, SyncError> {
    let keys = storage.list(collection, SEGMENT_PREFIX).await?;
    Ok(keys
        .into_iter()
        .filter(|k| matches!(keys::classify(k), keys::Namespace::Segment))
        .collect())
}

/// Load one segment.
///
/// A missing segment is reported as [`SyncError::CompactionConflict`]: it
/// was listed a moment ago, so someone else consumed it.
pub(crate) async fn read_segment(
    storage: &dyn StorageBackend,
    collection: &str,
    key: &str,
) -> Result<Vec<MetaDelta>, SyncError> {
    let body = match storage.get(collection, key, None).await {
        Ok(body) => body,
        Err(StorageError::NotFound { .. }) => {
            return Err(SyncError::CompactionConflict {
                segment: key.to_string(),
            })
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&body.data).map_err(|source| SyncError::CorruptDocument {
        key: key.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::record::MetaRecord;
    use crate::storage::memory::MemoryBackend;

    #[tokio::test]
    async fn test_empty_batch_writes_nothing() {
        let storage = Arc::new(MemoryBackend::new());
        let writer = SegmentWriter::new(storage.clone());
        assert!(writer.write("photos", &[]).await.unwrap().is_none());
        assert!(list_segments(storage.as_ref(), "photos").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_each_batch_gets_its_own_segment() {
        let storage = Arc::new(MemoryBackend::new());
        let writer = SegmentWriter::new(storage.clone());
        let delta = MetaRecord::new("a.jpg").with_deleted(true, 1);

        let first = writer.write("photos", &[delta.clone()]).await.unwrap().unwrap();
        let second = writer.write("photos", &[delta.clone()]).await.unwrap().unwrap();
        assert_ne!(first, second);

        let listed = list_segments(storage.as_ref(), "photos").await.unwrap();
        assert_eq!(listed.len(), 2);

        let loaded = read_segment(storage.as_ref(), "photos", &first).await.unwrap();
        assert_eq!(loaded, vec![delta]);
    }

    #[tokio::test]
    async fn test_list_skips_non_segment_keys() {
        let storage = Arc::new(MemoryBackend::new());
        storage
            .put("photos", "meta/wal/stray.tmp", "text/plain", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(list_segments(storage.as_ref(), "photos").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vanished_segment_is_a_conflict() {
        let storage = MemoryBackend::new();
        let err = read_segment(&storage, "photos", "meta/wal/gone.json")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::CompactionConflict { .. }));
    }

    #[tokio::test]
    async fn test_corrupt_segment_is_reported() {
        let storage = MemoryBackend::new();
        storage
            .put("photos", "meta/wal/bad.json", JSON_CONTENT_TYPE, Bytes::from_static(b"{nope"))
            .await
            .unwrap();
        let err = read_segment(&storage, "photos", "meta/wal/bad.json")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::CorruptDocument { .. }));
    }
}
