//! Derivation worker: turns content-namespace changes into metadata deltas.
//!
//! For a created object the worker builds a preview, uploads it under
//! `meta/preview/` and emits a delta pointing at it.  For a deleted object
//! it removes the preview and emits a soft-delete delta.  Events are
//! processed independently: one bad object never blocks the others, and
//! the deltas of successful events are always returned.

use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::derive::{effective_content_type, Deriver, MediaKind};
use crate::errors::SyncError;
use crate::keys;
use crate::meta::{next_stamp, Baseline, MetaDelta, MetaRecord};
use crate::metrics::{DERIVATIONS_TOTAL, EVENTS_DROPPED_TOTAL};
use crate::router::EventKind;
use crate::storage::backend::{StorageBackend, StorageError};

/// One change to an original, addressed by name (no `origin/` prefix).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChange {
    pub name: String,
    pub kind: EventKind,
}

/// Result of processing a batch for one collection.
#[derive(Debug, Default)]
pub struct WorkerOutcome {
    /// Deltas of every event that succeeded, in processing order.
    pub deltas: Vec<MetaDelta>,
    /// Events dropped for good (unsupported type, object already gone).
    pub dropped: usize,
    /// Events that failed and need redelivery.
    pub failed: usize,
}

/// Why an event produced no delta.
enum Skip {
    Drop(&'static str),
    Fail(SyncError),
}

impl From<SyncError> for Skip {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::UnsupportedMediaType { .. } => Skip::Drop("unsupported_media_type"),
            other => Skip::Fail(other),
        }
    }
}

impl From<StorageError> for Skip {
    fn from(err: StorageError) -> Self {
        Skip::Fail(err.into())
    }
}

pub struct DerivationWorker {
    storage: Arc<dyn StorageBackend>,
    deriver: Arc<dyn Deriver>,
    presign_ttl: Duration,
}

impl DerivationWorker {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        deriver: Arc<dyn Deriver>,
        presign_ttl: Duration,
    ) -> Self {
        Self {
            storage,
            deriver,
            presign_ttl,
        }
    }

    /// Process `changes` for `collection`.
    ///
    /// `baseline` supplies the preview each object currently owns so stale
    /// previews can be removed.  It must include pending segments, or a
    /// redelivered batch leaks the previews of its first attempt.
    pub async fn process(
        &self,
        collection: &str,
        changes: &[ContentChange],
        baseline: &Baseline,
    ) -> WorkerOutcome {
        let mut outcome = WorkerOutcome::default();
        // Previews attached so far, including ones attached earlier in this
        // batch.
        let mut current: HashMap<String, Option<String>> = HashMap::new();

        for change in changes {
            let owned = current
                .entry(change.name.clone())
                .or_insert_with(|| {
                    baseline
                        .get(&change.name)
                        .and_then(|r| r.preview())
                        .map(str::to_string)
                })
                .clone();

            let result = match change.kind {
                EventKind::Created => {
                    self.on_created(collection, &change.name, owned.as_deref()).await
                }
                EventKind::Deleted => {
                    self.on_deleted(collection, &change.name, owned.as_deref()).await
                }
            };

            match result {
                Ok(delta) => {
                    let preview = match change.kind {
                        EventKind::Created => delta.preview().map(str::to_string),
                        EventKind::Deleted => None,
                    };
                    current.insert(change.name.clone(), preview);
                    outcome.deltas.push(delta);
                }
                Err(Skip::Drop(reason)) => {
                    counter!(EVENTS_DROPPED_TOTAL, "reason" => reason).increment(1);
                    warn!(collection, object = %change.name, reason, "dropping event");
                    outcome.dropped += 1;
                }
                Err(Skip::Fail(err)) => {
                    warn!(collection, object = %change.name, error = %err, "event failed");
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }

    async fn on_created(
        &self,
        collection: &str,
        name: &str,
        owned: Option<&str>,
    ) -> Result<MetaDelta, Skip> {
        let key = keys::content_key(name);
        let head = match self.storage.head(collection, &key).await {
            Ok(head) => head,
            // Deleted again before we got here; its delete event follows.
            Err(StorageError::NotFound { .. }) => return Err(Skip::Drop("object_missing")),
            Err(e) => return Err(e.into()),
        };

        let content_type = effective_content_type(name, &head.content_type);
        let kind = MediaKind::classify(&content_type)?;

        let source = self.storage.presign_read(collection, &key, self.presign_ttl).await?;
        let artifact = match self.deriver.create(&source, &content_type).await {
            Ok(artifact) => {
                counter!(DERIVATIONS_TOTAL, "status" => "ok").increment(1);
                artifact
            }
            Err(e) => {
                counter!(DERIVATIONS_TOTAL, "status" => "error").increment(1);
                return Err(e.into());
            }
        };
        debug!(collection, object = name, ?kind, "derived preview");

        let preview_id = format!("{}.{}", uuid::Uuid::new_v4(), artifact.extension());
        let data = artifact.read().await?;
        self.storage
            .put(collection, &keys::preview_key(&preview_id), artifact.content_type(), data)
            .await?;

        if let Some(stale) = owned {
            self.storage.delete(collection, &keys::preview_key(stale)).await?;
            debug!(collection, object = name, preview = stale, "removed stale preview");
        }

        let now = next_stamp();
        info!(collection, object = name, preview = %preview_id, "attached preview");
        Ok(MetaRecord::new(name)
            .with_object(content_type, head.last_modified, now)
            .with_preview(preview_id, artifact.content_type(), now)
            .with_deleted(false, now))
    }

    async fn on_deleted(
        &self,
        collection: &str,
        name: &str,
        owned: Option<&str>,
    ) -> Result<MetaDelta, Skip> {
        if let Some(preview) = owned {
            self.storage.delete(collection, &keys::preview_key(preview)).await?;
        }
        info!(collection, object = name, "marked deleted");
        Ok(MetaRecord::new(name).with_deleted(true, next_stamp()))
    }
}
