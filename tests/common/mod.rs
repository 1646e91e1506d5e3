//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use photostash::config::Config;
use photostash::derive::{DerivedArtifact, Deriver, MediaKind};
use photostash::errors::SyncError;
use photostash::storage::memory::MemoryBackend;
use photostash::AppState;

/// Deriver that writes a small fixed file instead of running ffmpeg or
/// ImageMagick.
#[derive(Default)]
pub struct FakeDeriver {
    pub calls: AtomicUsize,
}

impl FakeDeriver {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Deriver for FakeDeriver {
    fn create<'a>(
        &'a self,
        source: &'a str,
        content_type: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<DerivedArtifact, SyncError>> + Send + 'a>> {
        Box::pin(async move {
            let kind = MediaKind::classify(content_type)?;
            self.calls.fetch_add(1, Ordering::SeqCst);
            let dir = tempfile::tempdir().map_err(|e| SyncError::Derivation(e.into()))?;
            let path = dir.path().join(format!("preview.{}", kind.preview_extension()));
            tokio::fs::write(&path, format!("thumb:{source}"))
                .await
                .map_err(|e| SyncError::Derivation(e.into()))?;
            Ok(DerivedArtifact::new(dir, path, kind))
        })
    }
}

pub struct Harness {
    pub storage: Arc<MemoryBackend>,
    pub deriver: Arc<FakeDeriver>,
    pub state: Arc<AppState>,
}

pub async fn harness() -> Harness {
    harness_with(Config::default()).await
}

pub async fn harness_with(config: Config) -> Harness {
    let storage = Arc::new(MemoryBackend::new());
    let deriver = Arc::new(FakeDeriver::default());
    let state = AppState::new(config, storage.clone(), deriver.clone())
        .await
        .expect("state");
    Harness {
        storage,
        deriver,
        state: Arc::new(state),
    }
}
