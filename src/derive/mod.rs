//! Preview derivation.
//!
//! A [`Deriver`] turns a readable source (a presigned URL or a local path)
//! plus its declared content type into a small preview artifact.  Only
//! images and videos are accepted; anything else is rejected with
//! [`SyncError::UnsupportedMediaType`].

pub mod command;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use bytes::Bytes;
use tempfile::TempDir;

use crate::errors::SyncError;

pub use command::CommandDeriver;

/// Declared types that carry no information and must be guessed from the
/// object name instead.
const GENERIC_CONTENT_TYPES: &[&str] = &[
    "",
    "application/octet-stream",
    "application/x-www-form-urlencoded",
    "binary/octet-stream",
];

/// What kind of preview a content type gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// Short silent MP4 clip.
    Video,
    /// Downscaled JPEG.
    Image,
}

impl MediaKind {
    pub fn classify(content_type: &str) -> Result<Self, SyncError> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if essence.starts_with("video/") {
            Ok(MediaKind::Video)
        } else if essence.starts_with("image/") {
            Ok(MediaKind::Image)
        } else {
            Err(SyncError::UnsupportedMediaType {
                content_type: content_type.to_string(),
            })
        }
    }

    /// Content type of the preview produced for this kind.
    pub fn preview_content_type(self) -> &'static str {
        match self {
            MediaKind::Video => "video/mp4",
            MediaKind::Image => "image/jpeg",
        }
    }

    /// File extension of the preview produced for this kind.
    pub fn preview_extension(self) -> &'static str {
        match self {
            MediaKind::Video => "mp4",
            MediaKind::Image => "jpg",
        }
    }
}

/// The content type to derive from.
///
/// Uses the declared type unless it is generic, in which case the type is
/// guessed from the object name's extension.  HEIC/HEIF photos are not in
/// every MIME table, so they are matched explicitly.
pub fn effective_content_type(name: &str, declared: &str) -> String {
    let declared_trimmed = declared.trim();
    if !GENERIC_CONTENT_TYPES.contains(&declared_trimmed.to_ascii_lowercase().as_str()) {
        return declared_trimmed.to_string();
    }

    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("heic") => return "image/heic".to_string(),
        Some("heif") => return "image/heif".to_string(),
        _ => {}
    }

    mime_guess::from_path(name)
        .first()
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| declared_trimmed.to_string())
}

/// A preview on local disk.  The backing temporary directory is removed
/// when the artifact is dropped.
#[derive(Debug)]
pub struct DerivedArtifact {
    _dir: TempDir,
    path: PathBuf,
    kind: MediaKind,
}

impl DerivedArtifact {
    /// Wrap a file that lives inside `dir`.
    pub fn new(dir: TempDir, path: PathBuf, kind: MediaKind) -> Self {
        Self {
            _dir: dir,
            path,
            kind,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn content_type(&self) -> &'static str {
        self.kind.preview_content_type()
    }

    pub fn extension(&self) -> &'static str {
        self.kind.preview_extension()
    }

    /// Read the artifact into memory for upload.
    pub async fn read(&self) -> Result<Bytes, SyncError> {
        let data = tokio::fs::read(&self.path).await.map_err(|e| {
            SyncError::Derivation(anyhow::anyhow!(
                "reading artifact {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(Bytes::from(data))
    }
}

/// Builds previews.
pub trait Deriver: Send + Sync + 'static {
    /// Derive a preview from `source`, interpreted as `content_type`.
    ///
    /// Implementations reject anything but `image/*` and `video/*` with
    /// [`SyncError::UnsupportedMediaType`] before doing any work.
    fn create<'a>(
        &'a self,
        source: &'a str,
        content_type: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<DerivedArtifact, SyncError>> + Send + 'a>>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Deterministic deriver for unit tests.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Writes a fixed payload instead of running any tool.  Sources listed
    /// in `failing` produce a derivation error.
    #[derive(Default)]
    pub struct StubDeriver {
        pub calls: AtomicUsize,
        pub failing: Mutex<Vec<String>>,
    }

    impl StubDeriver {
        pub fn fail_on(&self, fragment: &str) {
            self.failing.lock().unwrap().push(fragment.to_string());
        }
    }

    impl Deriver for StubDeriver {
        fn create<'a>(
            &'a self,
            source: &'a str,
            content_type: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<DerivedArtifact, SyncError>> + Send + 'a>> {
            Box::pin(async move {
                let kind = MediaKind::classify(content_type)?;
                self.calls.fetch_add(1, Ordering::SeqCst);
                if self.failing.lock().unwrap().iter().any(|f| source.contains(f)) {
                    return Err(SyncError::Derivation(anyhow::anyhow!("stub failure")));
                }
                let dir = tempfile::tempdir().unwrap();
                let path = dir.path().join(format!("preview.{}", kind.preview_extension()));
                tokio::fs::write(&path, format!("preview of {source}")).await.unwrap();
                Ok(DerivedArtifact::new(dir, path, kind))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(MediaKind::classify("video/quicktime").unwrap(), MediaKind::Video);
        assert_eq!(MediaKind::classify("image/png").unwrap(), MediaKind::Image);
        assert_eq!(MediaKind::classify("Image/JPEG; q=1").unwrap(), MediaKind::Image);
        assert!(matches!(
            MediaKind::classify("text/plain"),
            Err(SyncError::UnsupportedMediaType { .. })
        ));
        assert!(MediaKind::classify("").is_err());
    }

    #[test]
    fn test_declared_type_is_kept() {
        assert_eq!(effective_content_type("a.bin", "video/mp4"), "video/mp4");
        assert_eq!(effective_content_type("a.jpg", "text/plain"), "text/plain");
    }

    #[test]
    fn test_generic_type_is_guessed_from_name() {
        assert_eq!(
            effective_content_type("trip/IMG_0001.JPG", "application/octet-stream"),
            "image/jpeg"
        );
        assert_eq!(effective_content_type("clip.mp4", ""), "video/mp4");
        assert_eq!(
            effective_content_type("IMG_1.HEIC", "application/x-www-form-urlencoded"),
            "image/heic"
        );
        assert_eq!(effective_content_type("x.heif", ""), "image/heif");
    }

    #[test]
    fn test_unguessable_keeps_declared() {
        assert_eq!(
            effective_content_type("noext", "application/octet-stream"),
            "application/octet-stream"
        );
    }

    #[tokio::test]
    async fn test_artifact_dir_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let path = root.join("p.jpg");
        tokio::fs::write(&path, b"jpeg").await.unwrap();

        let artifact = DerivedArtifact::new(dir, path, MediaKind::Image);
        assert_eq!(artifact.read().await.unwrap(), Bytes::from_static(b"jpeg"));
        assert_eq!(artifact.content_type(), "image/jpeg");
        drop(artifact);
        assert!(!root.exists());
    }
}
