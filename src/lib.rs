//! photostash library: a photo/video library over object storage.
//!
//! Originals live in an object store that offers nothing but per-object
//! create/delete notifications.  The sync engine keeps a derived metadata
//! index (preview pointers, content types, soft deletes) consistent on top
//! of it: notifications are routed to a derivation worker, deltas go to an
//! append-only WAL of segment documents, and a compactor folds them into a
//! baseline snapshot with per-field last-write-wins merge.
//!
//! Next to the engine, a lock-guarded content registry serves the
//! read/write HTTP API.

use std::sync::Arc;
use std::time::Duration;

pub mod config;
pub mod derive;
pub mod errors;
pub mod handlers;
pub mod keys;
pub mod meta;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod server;
pub mod storage;
pub mod worker;

use crate::config::Config;
use crate::derive::Deriver;
use crate::errors::SyncError;
use crate::meta::{Compactor, SegmentWriter};
use crate::registry::ContentRegistry;
use crate::router::EventRouter;
use crate::storage::backend::StorageBackend;
use crate::worker::DerivationWorker;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Content index for the configured collection.
    pub registry: Arc<ContentRegistry>,
    /// Event pipeline entry point.
    pub router: Arc<EventRouter>,
}

impl AppState {
    /// Wire the registry and the event pipeline over one storage backend
    /// and one deriver.  Loads the registry document.
    pub async fn new(
        config: Config,
        storage: Arc<dyn StorageBackend>,
        deriver: Arc<dyn Deriver>,
    ) -> Result<Self, SyncError> {
        let presign_ttl = Duration::from_secs(config.derive.presign_ttl_seconds);

        let registry = ContentRegistry::load(
            storage.clone(),
            deriver.clone(),
            config.storage.collection.clone(),
            presign_ttl,
        )
        .await?;

        let router = EventRouter::new(
            DerivationWorker::new(storage.clone(), deriver, presign_ttl),
            SegmentWriter::new(storage.clone()),
            Compactor::new(storage),
        )
        .with_inline_compaction(config.pipeline.inline_compaction)
        .with_key_prefix(config.storage.key_prefix());

        Ok(Self {
            config,
            registry: Arc::new(registry),
            router: Arc::new(router),
        })
    }
}
