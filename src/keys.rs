//! Object key layout inside a collection.
//!
//! ```text
//! origin/<name>                 content namespace (originals)
//! meta/meta.json                baseline snapshot
//! meta/wal/<uuid>.json          WAL segments
//! meta/preview/<uuid>.<ext>     preview artifacts
//! meta/corrupt/<uuid>.json      undecodable segments set aside
//! registry/content.json         content registry snapshot
//! thumbnail/<id>                registry thumbnails
//! trash/<id>                    originals removed through the registry
//! upload/<uuid>                 uploads staged until the registry commits
//! ```

pub const CONTENT_PREFIX: &str = "origin/";
pub const META_PREFIX: &str = "meta/";
pub const BASELINE_KEY: &str = "meta/meta.json";
pub const SEGMENT_PREFIX: &str = "meta/wal/";
pub const PREVIEW_PREFIX: &str = "meta/preview/";
pub const REGISTRY_KEY: &str = "registry/content.json";
pub const THUMBNAIL_PREFIX: &str = "thumbnail/";
pub const TRASH_PREFIX: &str = "trash/";
pub const STAGING_PREFIX: &str = "upload/";
pub const QUARANTINE_PREFIX: &str = "meta/corrupt/";

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Where a key lives, as far as event routing is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace<'a> {
    /// An original in the content namespace; carries the object name.
    Content(&'a str),
    /// The baseline snapshot document.
    Baseline,
    /// A WAL segment document.
    Segment,
    /// A preview artifact.
    Preview,
    /// Anything else under `meta/`.
    OtherMeta,
    /// Keys outside the namespaces the pipeline watches.
    Foreign,
}

/// Classify an object key by namespace prefix.
pub fn classify(key: &str) -> Namespace<'_> {
    if let Some(name) = key.strip_prefix(CONTENT_PREFIX) {
        if name.is_empty() {
            return Namespace::Foreign;
        }
        return Namespace::Content(name);
    }
    if key == BASELINE_KEY {
        return Namespace::Baseline;
    }
    if let Some(rest) = key.strip_prefix(SEGMENT_PREFIX) {
        return if rest.ends_with(".json") && !rest.contains('/') {
            Namespace::Segment
        } else {
            Namespace::OtherMeta
        };
    }
    if key.starts_with(PREVIEW_PREFIX) {
        return Namespace::Preview;
    }
    if key.starts_with(META_PREFIX) {
        return Namespace::OtherMeta;
    }
    Namespace::Foreign
}

pub fn content_key(name: &str) -> String {
    format!("{CONTENT_PREFIX}{name}")
}

pub fn preview_key(preview_id: &str) -> String {
    format!("{PREVIEW_PREFIX}{preview_id}")
}

/// A fresh, collision-free segment key.
pub fn new_segment_key() -> String {
    format!("{SEGMENT_PREFIX}{}.json", uuid::Uuid::new_v4())
}

pub fn thumbnail_key(id: &str) -> String {
    format!("{THUMBNAIL_PREFIX}{id}")
}

pub fn trash_key(id: &str) -> String {
    format!("{TRASH_PREFIX}{id}")
}

/// A fresh staging key for an upload of `id` that is not committed yet.
/// Keeps the extension of `id` so tools can still sniff the format.
pub fn new_staging_key(id: &str) -> String {
    let uuid = uuid::Uuid::new_v4();
    match std::path::Path::new(id).extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{STAGING_PREFIX}{uuid}.{ext}"),
        None => format!("{STAGING_PREFIX}{uuid}"),
    }
}

/// Where an undecodable segment is moved so later passes skip it.
pub fn quarantine_key(segment_key: &str) -> String {
    let name = segment_key.strip_prefix(SEGMENT_PREFIX).unwrap_or(segment_key);
    format!("{QUARANTINE_PREFIX}{name}")
}
