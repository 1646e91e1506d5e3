//! Compaction of WAL segments into the baseline snapshot.
//!
//! A pass lists the pending segments, folds them into the current baseline
//! with per-field LWW, writes the baseline back, and deletes the consumed
//! segments.  Passes may run concurrently: the fold is idempotent, so a
//! segment folded twice changes nothing, and a segment that disappears
//! mid-pass was already folded by someone else.
//!
//! A segment that cannot be decoded is moved to `meta/corrupt/` and the
//! rest of the pass goes on without it.

use bytes::Bytes;
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::record::{Baseline, MetaDelta};
use super::segment::{list_segments, read_segment};
use crate::errors::SyncError;
use crate::keys::{self, BASELINE_KEY, JSON_CONTENT_TYPE};
use crate::metrics::{COMPACTIONS_TOTAL, COMPACTION_CONFLICTS_TOTAL, SEGMENTS_QUARANTINED_TOTAL};
use crate::storage::backend::{StorageBackend, StorageError};

/// Outcome of one compaction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Segments loaded and folded.
    pub segments_folded: usize,
    /// Deltas that changed at least one field.
    pub deltas_applied: usize,
    /// Records in the baseline after the pass.
    pub records: usize,
    /// Segments deleted after the baseline was written.
    pub segments_pruned: usize,
    /// Undecodable segments moved out of the WAL.
    pub segments_quarantined: usize,
}

/// Pending segments, read and sorted by whether they can be folded.
#[derive(Default)]
struct Pending {
    deltas: Vec<MetaDelta>,
    readable: Vec<String>,
    corrupt: Vec<String>,
}

#[derive(Clone)]
pub struct Compactor {
    storage: Arc<dyn StorageBackend>,
}

impl Compactor {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Current baseline for `collection`; empty if none was written yet.
    pub async fn baseline(&self, collection: &str) -> Result<Baseline, SyncError> {
        let body = match self.storage.get(collection, BASELINE_KEY, None).await {
            Ok(body) => body,
            Err(StorageError::NotFound { .. }) => return Ok(Baseline::default()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&body.data).map_err(|source| SyncError::CorruptDocument {
            key: BASELINE_KEY.to_string(),
            source,
        })
    }

    /// The baseline with every pending segment folded in.  Writes nothing;
    /// this is what the metadata will look like after the next pass.
    pub async fn current(&self, collection: &str) -> Result<Baseline, SyncError> {
        let pending = self.read_pending(collection).await?;
        let mut baseline = self.baseline(collection).await?;
        baseline.fold(&pending.deltas);
        Ok(baseline)
    }

    /// Run one compaction pass over `collection`.
    pub async fn compact(&self, collection: &str) -> Result<CompactionReport, SyncError> {
        let result = self.compact_inner(collection).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        counter!(COMPACTIONS_TOTAL, "status" => status).increment(1);
        result
    }

    async fn read_pending(&self, collection: &str) -> Result<Pending, SyncError> {
        let mut pending = Pending::default();
        for key in list_segments(self.storage.as_ref(), collection).await? {
            match read_segment(self.storage.as_ref(), collection, &key).await {
                Ok(mut batch) => {
                    pending.deltas.append(&mut batch);
                    pending.readable.push(key);
                }
                Err(SyncError::CompactionConflict { segment }) => {
                    counter!(COMPACTION_CONFLICTS_TOTAL).increment(1);
                    warn!(
                        collection,
                        segment,
                        "segment consumed by a concurrent compaction, skipping"
                    );
                }
                Err(SyncError::CorruptDocument { key, source }) => {
                    warn!(collection, segment = %key, error = %source, "undecodable segment");
                    pending.corrupt.push(key);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(pending)
    }

    async fn compact_inner(&self, collection: &str) -> Result<CompactionReport, SyncError> {
        // Segments first: one consumed by a concurrent pass after this point
        // is already in the baseline loaded below.
        let pending = self.read_pending(collection).await?;
        let mut baseline = self.baseline(collection).await?;

        let segments_quarantined = self.quarantine(collection, &pending.corrupt).await;

        if pending.readable.is_empty() {
            debug!(collection, "no pending segments");
            return Ok(CompactionReport {
                records: baseline.len(),
                segments_quarantined,
                ..Default::default()
            });
        }

        let deltas_applied = baseline.fold(&pending.deltas);

        let body = serde_json::to_vec(&baseline).map_err(|source| SyncError::CorruptDocument {
            key: BASELINE_KEY.to_string(),
            source,
        })?;
        self.storage
            .put(collection, BASELINE_KEY, JSON_CONTENT_TYPE, Bytes::from(body))
            .await?;

        let mut segments_pruned = 0;
        for key in &pending.readable {
            match self.storage.delete(collection, key).await {
                Ok(()) => segments_pruned += 1,
                Err(e) => warn!(collection, segment = %key, error = %e, "failed to prune segment"),
            }
        }

        let report = CompactionReport {
            segments_folded: pending.readable.len(),
            deltas_applied,
            records: baseline.len(),
            segments_pruned,
            segments_quarantined,
        };
        info!(
            collection,
            segments = report.segments_folded,
            applied = report.deltas_applied,
            records = report.records,
            quarantined = report.segments_quarantined,
            "compaction complete"
        );
        Ok(report)
    }

    /// Move undecodable segments out of the WAL.  Best effort: a segment
    /// that fails to move is retried on the next pass.
    async fn quarantine(&self, collection: &str, corrupt: &[String]) -> usize {
        let mut moved = 0;
        for key in corrupt {
            let target = keys::quarantine_key(key);
            match self.storage.rename(collection, key, &target).await {
                Ok(()) => {
                    counter!(SEGMENTS_QUARANTINED_TOTAL).increment(1);
                    error!(
                        collection,
                        segment = %key,
                        target = %target,
                        "quarantined undecodable segment"
                    );
                    moved += 1;
                }
                Err(e) => {
                    warn!(collection, segment = %key, error = %e, "failed to quarantine segment")
                }
            }
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::record::MetaRecord;
    use crate::meta::segment::SegmentWriter;
    use crate::storage::backend::{ObjectBody, ObjectHead, StorageResult};
    use crate::storage::memory::MemoryBackend;
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

    fn segment_body(deltas: &[MetaRecord]) -> Bytes {
        Bytes::from(serde_json::to_vec(deltas).unwrap())
    }

    fn setup() -> (Arc<MemoryBackend>, SegmentWriter, Compactor) {
        let storage = Arc::new(MemoryBackend::new());
        (
            storage.clone(),
            SegmentWriter::new(storage.clone()),
            Compactor::new(storage),
        )
    }

    #[tokio::test]
    async fn test_missing_baseline_is_empty() {
        let (_, _, compactor) = setup();
        assert!(compactor.baseline("photos").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_compact_folds_and_prunes() {
        let (storage, writer, compactor) = setup();
        writer
            .write("photos", &[MetaRecord::new("a.jpg").with_preview("p1.jpg", "image/jpeg", 10)])
            .await
            .unwrap();
        writer
            .write("photos", &[MetaRecord::new("b.mov").with_deleted(true, 11)])
            .await
            .unwrap();

        let report = compactor.compact("photos").await.unwrap();
        assert_eq!(report.segments_folded, 2);
        assert_eq!(report.deltas_applied, 2);
        assert_eq!(report.records, 2);
        assert_eq!(report.segments_pruned, 2);

        assert!(list_segments(storage.as_ref(), "photos").await.unwrap().is_empty());
        let baseline = compactor.baseline("photos").await.unwrap();
        assert_eq!(baseline.get("a.jpg").unwrap().preview(), Some("p1.jpg"));
        assert!(baseline.get("b.mov").unwrap().is_deleted());
    }

    #[tokio::test]
    async fn test_refolding_a_segment_is_a_no_op() {
        let (_, writer, compactor) = setup();
        let delta = MetaRecord::new("a.jpg").with_preview("p1.jpg", "image/jpeg", 10);

        writer.write("photos", &[delta.clone()]).await.unwrap();
        compactor.compact("photos").await.unwrap();
        let before = compactor.baseline("photos").await.unwrap();

        // Redelivered batch: same delta in a fresh segment.
        writer.write("photos", &[delta]).await.unwrap();
        let report = compactor.compact("photos").await.unwrap();
        assert_eq!(report.segments_folded, 1);
        assert_eq!(report.deltas_applied, 0);
        assert_eq!(compactor.baseline("photos").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_segment_order_does_not_matter() {
        let newer = MetaRecord::new("a.jpg").with_preview("new.jpg", "image/jpeg", 20);
        let older = MetaRecord::new("a.jpg").with_preview("old.jpg", "image/jpeg", 10);

        let (_, writer, compactor) = setup();
        writer.write("photos", &[newer.clone()]).await.unwrap();
        compactor.compact("photos").await.unwrap();
        writer.write("photos", &[older.clone()]).await.unwrap();
        compactor.compact("photos").await.unwrap();

        let baseline = compactor.baseline("photos").await.unwrap();
        assert_eq!(baseline.get("a.jpg").unwrap().preview(), Some("new.jpg"));
    }

    #[tokio::test]
    async fn test_compact_without_segments_keeps_baseline() {
        let (_, writer, compactor) = setup();
        writer
            .write("photos", &[MetaRecord::new("a.jpg").with_deleted(false, 1)])
            .await
            .unwrap();
        compactor.compact("photos").await.unwrap();

        let report = compactor.compact("photos").await.unwrap();
        assert_eq!(report.segments_folded, 0);
        assert_eq!(report.records, 1);
    }

    #[tokio::test]
    async fn test_corrupt_baseline_fails_the_pass() {
        let (storage, writer, compactor) = setup();
        storage
            .put("photos", BASELINE_KEY, JSON_CONTENT_TYPE, Bytes::from_static(b"not json"))
            .await
            .unwrap();
        writer
            .write("photos", &[MetaRecord::new("a.jpg").with_deleted(true, 1)])
            .await
            .unwrap();

        let err = compactor.compact("photos").await.unwrap_err();
        assert!(matches!(err, SyncError::CorruptDocument { .. }));
        // Nothing was consumed.
        assert_eq!(list_segments(storage.as_ref(), "photos").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_segment_is_quarantined_and_the_rest_folds() {
        let (storage, writer, compactor) = setup();
        storage
            .put("photos", "meta/wal/0000-bad.json", JSON_CONTENT_TYPE, Bytes::from_static(b"[{"))
            .await
            .unwrap();
        writer
            .write("photos", &[MetaRecord::new("a.jpg").with_preview("p.jpg", "image/jpeg", 5)])
            .await
            .unwrap();

        let report = compactor.compact("photos").await.unwrap();
        assert_eq!(report.segments_folded, 1);
        assert_eq!(report.segments_quarantined, 1);
        let baseline = compactor.baseline("photos").await.unwrap();
        assert_eq!(baseline.get("a.jpg").unwrap().preview(), Some("p.jpg"));

        assert!(list_segments(storage.as_ref(), "photos").await.unwrap().is_empty());
        assert!(storage.head("photos", "meta/corrupt/0000-bad.json").await.is_ok());

        // Later passes are clean.
        writer
            .write("photos", &[MetaRecord::new("b.jpg").with_deleted(true, 6)])
            .await
            .unwrap();
        let report = compactor.compact("photos").await.unwrap();
        assert_eq!(report.segments_folded, 1);
        assert_eq!(report.segments_quarantined, 0);
        assert_eq!(report.records, 2);
    }

    #[tokio::test]
    async fn test_current_includes_pending_segments_without_writing() {
        let (storage, writer, compactor) = setup();
        writer
            .write("photos", &[MetaRecord::new("a.jpg").with_preview("p.jpg", "image/jpeg", 5)])
            .await
            .unwrap();

        let current = compactor.current("photos").await.unwrap();
        assert_eq!(current.get("a.jpg").unwrap().preview(), Some("p.jpg"));
        assert!(compactor.baseline("photos").await.unwrap().is_empty());
        assert_eq!(list_segments(storage.as_ref(), "photos").await.unwrap().len(), 1);
    }

    /// Lists like the inner backend but pretends `vanished` is already gone.
    struct RacingBackend {
        inner: MemoryBackend,
        vanished: String,
    }

    impl StorageBackend for RacingBackend {
        fn put(
            &self,
            collection: &str,
            key: &str,
            content_type: &str,
            data: Bytes,
        ) -> BoxFuture<'_, StorageResult<()>> {
            self.inner.put(collection, key, content_type, data)
        }

        fn get(
            &self,
            collection: &str,
            key: &str,
            range: Option<&str>,
        ) -> BoxFuture<'_, StorageResult<ObjectBody>> {
            if key == self.vanished {
                let err = StorageError::not_found(collection, key);
                return Box::pin(async move { Err(err) });
            }
            self.inner.get(collection, key, range)
        }

        fn head(
            &self,
            collection: &str,
            key: &str,
        ) -> BoxFuture<'_, StorageResult<ObjectHead>> {
            self.inner.head(collection, key)
        }

        fn rename(
            &self,
            collection: &str,
            src: &str,
            dst: &str,
        ) -> BoxFuture<'_, StorageResult<()>> {
            self.inner.rename(collection, src, dst)
        }

        fn delete(
            &self,
            collection: &str,
            key: &str,
        ) -> BoxFuture<'_, StorageResult<()>> {
            self.inner.delete(collection, key)
        }

        fn list(
            &self,
            collection: &str,
            prefix: &str,
        ) -> BoxFuture<'_, StorageResult<Vec<String>>> {
            self.inner.list(collection, prefix)
        }

        fn presign_read(
            &self,
            collection: &str,
            key: &str,
            ttl: Duration,
        ) -> BoxFuture<'_, StorageResult<String>> {
            self.inner.presign_read(collection, key, ttl)
        }
    }

    #[tokio::test]
    async fn test_vanished_segment_is_skipped() {
        let inner = MemoryBackend::new();
        inner
            .put(
                "photos",
                "meta/wal/a.json",
                JSON_CONTENT_TYPE,
                segment_body(&[MetaRecord::new("a.jpg").with_deleted(true, 1)]),
            )
            .await
            .unwrap();
        inner
            .put(
                "photos",
                "meta/wal/b.json",
                JSON_CONTENT_TYPE,
                segment_body(&[MetaRecord::new("b.jpg").with_deleted(true, 1)]),
            )
            .await
            .unwrap();

        let storage = Arc::new(RacingBackend {
            inner,
            vanished: "meta/wal/b.json".to_string(),
        });
        let compactor = Compactor::new(storage);

        let report = compactor.compact("photos").await.unwrap();
        assert_eq!(report.segments_folded, 1);
        assert_eq!(report.segments_pruned, 1);
        let baseline = compactor.baseline("photos").await.unwrap();
        assert!(baseline.get("a.jpg").is_some());
        assert!(baseline.get("b.jpg").is_none());
    }
}
