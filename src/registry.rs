//! Content registry: the index behind the read/write API.
//!
//! The registry is an in-memory map of content entries guarded by a tokio
//! `RwLock` and mirrored to a single JSON document
//! (`registry/content.json`).  Reads share the lock.  Every mutation takes
//! the write lock and keeps it until the whole document has been uploaded,
//! so the map and the document never disagree after a mutation returns.
//! The price is that each mutation costs a full rewrite of the document.

use bytes::Bytes;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::derive::{effective_content_type, Deriver, MediaKind};
use crate::errors::SyncError;
use crate::keys::{self, JSON_CONTENT_TYPE, REGISTRY_KEY};
use crate::metrics::REGISTRY_MUTATIONS_TOTAL;
use crate::storage::backend::{ObjectBody, StorageBackend, StorageError};

/// A stored object as the API describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub id: String,
    pub content_type: String,
    /// Unix seconds, as supplied by the uploader.
    pub last_modified: i64,
}

/// One library entry: an original and its thumbnail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub original: ObjectRef,
    pub thumbnail: ObjectRef,
}

/// Payload of an upload.
#[derive(Debug, Clone)]
pub struct NewOriginal {
    pub id: String,
    pub content_type: String,
    pub last_modified: i64,
    pub data: Bytes,
}

/// Bytes served for a content read.
#[derive(Debug, Clone)]
pub struct ContentBody {
    pub object: ObjectBody,
    pub content_type: String,
    pub last_modified: i64,
}

/// Staging keys for one upload in flight.
struct StagedUpload {
    original: String,
    thumbnail: String,
}

impl StagedUpload {
    fn new(id: &str) -> Self {
        Self {
            original: keys::new_staging_key(id),
            thumbnail: keys::new_staging_key(""),
        }
    }
}

pub struct ContentRegistry {
    storage: Arc<dyn StorageBackend>,
    deriver: Arc<dyn Deriver>,
    collection: String,
    presign_ttl: Duration,
    entries: RwLock<BTreeMap<String, Content>>,
}

impl ContentRegistry {
    /// Load the registry document for `collection`; a missing document is
    /// an empty registry.
    pub async fn load(
        storage: Arc<dyn StorageBackend>,
        deriver: Arc<dyn Deriver>,
        collection: impl Into<String>,
        presign_ttl: Duration,
    ) -> Result<Self, SyncError> {
        let collection = collection.into();
        let entries: Vec<Content> = match storage.get(&collection, REGISTRY_KEY, None).await {
            Ok(body) => {
                serde_json::from_slice(&body.data).map_err(|source| SyncError::CorruptDocument {
                    key: REGISTRY_KEY.to_string(),
                    source,
                })?
            }
            Err(StorageError::NotFound { .. }) => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        info!(collection = %collection, entries = entries.len(), "content registry loaded");
        Ok(Self {
            storage,
            deriver,
            collection,
            presign_ttl,
            entries: RwLock::new(
                entries
                    .into_iter()
                    .map(|c| (c.original.id.clone(), c))
                    .collect(),
            ),
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// All entries, sorted by id.
    pub async fn list(&self) -> Vec<Content> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn get(&self, id: &str) -> Option<Content> {
        self.entries.read().await.get(id).cloned()
    }

    /// Read an original, honoring a conditional timestamp and a byte range.
    pub async fn get_original(
        &self,
        id: &str,
        if_modified_since: Option<i64>,
        range: Option<&str>,
    ) -> Result<ContentBody, SyncError> {
        let entries = self.entries.read().await;
        let content = entries
            .get(id)
            .ok_or_else(|| SyncError::NotFound { id: id.to_string() })?;
        self.read_ref(&content.original, &keys::content_key(id), if_modified_since, range)
            .await
    }

    /// Read a thumbnail, honoring a conditional timestamp.
    pub async fn get_thumbnail(
        &self,
        id: &str,
        if_modified_since: Option<i64>,
    ) -> Result<ContentBody, SyncError> {
        let entries = self.entries.read().await;
        let content = entries
            .get(id)
            .ok_or_else(|| SyncError::NotFound { id: id.to_string() })?;
        self.read_ref(&content.thumbnail, &keys::thumbnail_key(id), if_modified_since, None)
            .await
    }

    async fn read_ref(
        &self,
        object: &ObjectRef,
        key: &str,
        if_modified_since: Option<i64>,
        range: Option<&str>,
    ) -> Result<ContentBody, SyncError> {
        if if_modified_since == Some(object.last_modified) {
            return Err(SyncError::NotModified);
        }
        let body = match self.storage.get(&self.collection, key, range).await {
            Ok(body) => body,
            // Indexed but gone from storage; retrying will not bring it back.
            Err(StorageError::NotFound { .. }) => {
                warn!(id = %object.id, key, "registry entry has no stored object");
                return Err(SyncError::NotFound {
                    id: object.id.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        Ok(ContentBody {
            object: body,
            content_type: object.content_type.clone(),
            last_modified: object.last_modified,
        })
    }

    /// Store an original, build its thumbnail and record the entry.
    ///
    /// Replaces any entry with the same id.  Bytes are staged under
    /// `upload/` and only moved into `origin/` and `thumbnail/` once the
    /// registry document has been written, so a failed upload leaves the
    /// previous entry and its bytes untouched.
    pub async fn upload(&self, original: NewOriginal) -> Result<Content, SyncError> {
        let result = self.upload_inner(original).await;
        record_mutation("upload", &result);
        result
    }

    async fn upload_inner(&self, original: NewOriginal) -> Result<Content, SyncError> {
        let content_type = effective_content_type(&original.id, &original.content_type);
        // Reject before anything is written.
        MediaKind::classify(&content_type)?;

        let mut entries = self.entries.write().await;
        let id = original.id.clone();
        let staged = StagedUpload::new(&id);

        let content = match self.stage(&staged, original, content_type).await {
            Ok(content) => content,
            Err(e) => {
                self.discard(&staged).await;
                return Err(e);
            }
        };

        let previous = entries.insert(id.clone(), content.clone());
        if let Err(e) = self.persist(&entries).await {
            match previous {
                Some(previous) => entries.insert(id.clone(), previous),
                None => entries.remove(&id),
            };
            self.discard(&staged).await;
            return Err(e);
        }

        // Committed.  A failed move is reported; uploading again repairs it.
        if let Err(e) = self.promote(&staged, &id).await {
            self.discard(&staged).await;
            return Err(e);
        }

        info!(id = %id, "content uploaded");
        Ok(content)
    }

    /// Write the original and its thumbnail to their staging keys.
    async fn stage(
        &self,
        staged: &StagedUpload,
        original: NewOriginal,
        content_type: String,
    ) -> Result<Content, SyncError> {
        self.storage
            .put(&self.collection, &staged.original, &content_type, original.data)
            .await?;

        let source = self
            .storage
            .presign_read(&self.collection, &staged.original, self.presign_ttl)
            .await?;
        let artifact = self.deriver.create(&source, &content_type).await?;
        let thumbnail_data = artifact.read().await?;
        self.storage
            .put(
                &self.collection,
                &staged.thumbnail,
                artifact.content_type(),
                thumbnail_data,
            )
            .await?;

        Ok(Content {
            original: ObjectRef {
                id: original.id.clone(),
                content_type,
                last_modified: original.last_modified,
            },
            thumbnail: ObjectRef {
                id: original.id,
                content_type: artifact.content_type().to_string(),
                last_modified: original.last_modified,
            },
        })
    }

    async fn promote(&self, staged: &StagedUpload, id: &str) -> Result<(), SyncError> {
        self.storage
            .rename(&self.collection, &staged.original, &keys::content_key(id))
            .await?;
        self.storage
            .rename(&self.collection, &staged.thumbnail, &keys::thumbnail_key(id))
            .await?;
        Ok(())
    }

    /// Best-effort removal of whatever was staged.
    async fn discard(&self, staged: &StagedUpload) {
        for key in [&staged.original, &staged.thumbnail] {
            if let Err(e) = self.storage.delete(&self.collection, key).await {
                warn!(key = %key, error = %e, "failed to remove staged upload");
            }
        }
    }

    /// Remove an entry.  The original moves to `trash/`; the thumbnail is
    /// deleted.  Returns false if there was nothing to delete.
    pub async fn delete(&self, id: &str) -> Result<bool, SyncError> {
        let result = self.delete_inner(id).await;
        record_mutation("delete", &result);
        result
    }

    async fn delete_inner(&self, id: &str) -> Result<bool, SyncError> {
        let mut entries = self.entries.write().await;
        if !entries.contains_key(id) {
            debug!(id, "delete of unknown content, nothing to do");
            return Ok(false);
        }

        self.storage
            .delete(&self.collection, &keys::thumbnail_key(id))
            .await?;
        match self
            .storage
            .rename(&self.collection, &keys::content_key(id), &keys::trash_key(id))
            .await
        {
            Ok(()) => {}
            // Already moved by an earlier attempt that failed to persist.
            Err(StorageError::NotFound { .. }) => warn!(id, "original already gone"),
            Err(e) => return Err(e.into()),
        }

        let removed = entries.remove(id);
        if let Err(e) = self.persist(&entries).await {
            if let Some(removed) = removed {
                entries.insert(id.to_string(), removed);
            }
            return Err(e);
        }

        info!(id, "content deleted");
        Ok(true)
    }

    async fn persist(&self, entries: &BTreeMap<String, Content>) -> Result<(), SyncError> {
        let snapshot: Vec<&Content> = entries.values().collect();
        let body = serde_json::to_vec(&snapshot).map_err(|source| SyncError::CorruptDocument {
            key: REGISTRY_KEY.to_string(),
            source,
        })?;
        self.storage
            .put(&self.collection, REGISTRY_KEY, JSON_CONTENT_TYPE, Bytes::from(body))
            .await?;
        Ok(())
    }
}

fn record_mutation<T>(operation: &'static str, result: &Result<T, SyncError>) {
    let status = if result.is_ok() { "ok" } else { "error" };
    counter!(REGISTRY_MUTATIONS_TOTAL, "operation" => operation, "status" => status)
        .increment(1);
}
