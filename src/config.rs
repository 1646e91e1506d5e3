//! Configuration loading and types for photostash.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: networking, object storage, preview derivation, the sync
//! pipeline, logging and observability.  Every value has a default, so an
//! empty file is a valid development configuration.
//!
//! The loaded document is validated once with `garde`; a bad value becomes
//! [`ConfigError::Invalid`] instead of a panic somewhere downstream.

use garde::Validate;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config:\n{0}")]
    Invalid(#[from] garde::Report),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    #[garde(dive)]
    pub server: ServerConfig,

    /// Object storage backend settings.
    #[serde(default)]
    #[garde(dive)]
    pub storage: StorageConfig,

    /// Preview derivation settings.
    #[serde(default)]
    #[garde(dive)]
    pub derive: DeriveConfig,

    /// Event pipeline settings.
    #[serde(default)]
    #[garde(skip)]
    pub pipeline: PipelineConfig,

    /// Logging settings.
    #[serde(default)]
    #[garde(dive)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    #[garde(skip)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    #[garde(length(min = 1))]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    #[garde(skip)]
    pub port: u16,

    /// Per-request timeout in seconds.  Uploads derive a thumbnail inline,
    /// so this must leave room for the derivation timeout.
    #[serde(default = "default_request_timeout")]
    #[garde(range(min = 1))]
    pub request_timeout_seconds: u64,

    /// Seconds in-flight requests get to finish after a shutdown signal
    /// before the process exits anyway.
    #[serde(default = "default_shutdown_timeout")]
    #[garde(skip)]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    #[garde(pattern(r"^(trace|debug|info|warn|error)$"))]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    #[garde(pattern(r"^(text|json)$"))]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

/// Object storage backend configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct StorageConfig {
    /// Backend type: `local`, `memory`, `aws`.
    #[serde(default = "default_storage_backend")]
    #[garde(pattern(r"^(local|memory|aws)$"))]
    pub backend: String,

    /// Collection (bucket) served by the HTTP API and holding the registry.
    #[serde(default = "default_collection")]
    #[garde(length(min = 3, max = 63), pattern(r"^[a-z0-9][a-z0-9.\-]*[a-z0-9]$"))]
    pub collection: String,

    /// Local storage configuration.
    #[serde(default)]
    #[garde(dive)]
    pub local: LocalStorageConfig,

    /// Memory storage configuration.
    #[serde(default)]
    #[garde(skip)]
    pub memory: MemoryStorageConfig,

    /// S3 gateway configuration.
    #[serde(default)]
    #[garde(dive)]
    pub aws: AwsStorageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            collection: default_collection(),
            local: LocalStorageConfig::default(),
            memory: MemoryStorageConfig::default(),
            aws: AwsStorageConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Prefix the upstream store puts in front of every key it reports in
    /// notifications.  Only the S3 gateway namespaces keys.
    pub fn key_prefix(&self) -> &str {
        match self.backend.as_str() {
            "aws" => &self.aws.prefix,
            _ => "",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LocalStorageConfig {
    #[serde(default = "default_storage_root")]
    #[garde(length(min = 1))]
    pub root_dir: String,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_storage_root(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryStorageConfig {
    /// Total byte cap; 0 means unlimited.
    #[serde(default)]
    pub max_size_bytes: u64,
}

/// Settings for the S3 gateway.  The bucket is the collection, so nothing
/// here names one.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AwsStorageConfig {
    #[serde(default = "default_region")]
    #[garde(length(min = 1))]
    pub region: String,
    #[serde(default)]
    #[garde(skip)]
    pub prefix: String,
    #[serde(default)]
    #[garde(skip)]
    pub endpoint_url: String,
    #[serde(default)]
    #[garde(skip)]
    pub use_path_style: bool,
    #[serde(default)]
    #[garde(skip)]
    pub access_key_id: String,
    #[serde(default)]
    #[garde(skip)]
    pub secret_access_key: String,
    #[serde(default = "default_operation_timeout")]
    #[garde(range(min = 1))]
    pub operation_timeout_seconds: u64,
}

impl Default for AwsStorageConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            prefix: String::new(),
            endpoint_url: String::new(),
            use_path_style: false,
            access_key_id: String::new(),
            secret_access_key: String::new(),
            operation_timeout_seconds: default_operation_timeout(),
        }
    }
}

/// Preview derivation settings.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DeriveConfig {
    /// ffmpeg binary name or path.
    #[serde(default = "default_ffmpeg")]
    #[garde(length(min = 1))]
    pub ffmpeg: String,

    /// ImageMagick binary name or path.
    #[serde(default = "default_magick")]
    #[garde(length(min = 1))]
    pub magick: String,

    /// Kill a derivation tool, or abandon a source download, after this
    /// many seconds.
    #[serde(default = "default_derive_timeout")]
    #[garde(range(min = 1))]
    pub timeout_seconds: u64,

    /// Lifetime of the signed read URL handed to the tools.
    #[serde(default = "default_presign_ttl")]
    #[garde(range(min = 1, max = 604800))]
    pub presign_ttl_seconds: u64,

    /// Length of video previews.
    #[serde(default = "default_clip_seconds")]
    #[garde(range(min = 1, max = 60))]
    pub clip_seconds: u32,

    /// Longer edge of previews, in pixels.
    #[serde(default = "default_max_dimension")]
    #[garde(range(min = 16, max = 4096))]
    pub max_dimension: u32,
}

impl Default for DeriveConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            magick: default_magick(),
            timeout_seconds: default_derive_timeout(),
            presign_ttl_seconds: default_presign_ttl(),
            clip_seconds: default_clip_seconds(),
            max_dimension: default_max_dimension(),
        }
    }
}

/// Event pipeline settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    /// Compact right after writing a segment instead of waiting for the
    /// segment's own creation notification.  Useful for storage that does
    /// not emit notifications for `meta/` keys.
    #[serde(default)]
    pub inline_compaction: bool,
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    300
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_operation_timeout() -> u64 {
    60
}

fn default_storage_backend() -> String {
    "local".to_string()
}

fn default_collection() -> String {
    "photos".to_string()
}

fn default_storage_root() -> String {
    "./data/objects".to_string()
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_magick() -> String {
    "magick".to_string()
}

fn default_derive_timeout() -> u64 {
    120
}

fn default_presign_ttl() -> u64 {
    15 * 60
}

fn default_clip_seconds() -> u32 {
    3
}

fn default_max_dimension() -> u32 {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Parse and validate a YAML document.
pub fn parse_config(contents: &str, path: &Path) -> Result<Config, ConfigError> {
    // An empty file is valid and means "all defaults".
    let config: Config = if contents.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?
    };
    config.validate()?;
    Ok(config)
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&contents, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<Config, ConfigError> {
        parse_config(yaml, Path::new("test.yaml"))
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.storage.backend, "local");
        assert_eq!(config.storage.collection, "photos");
        assert_eq!(config.derive.presign_ttl_seconds, 900);
        assert_eq!(config.derive.timeout_seconds, 120);
        assert_eq!(config.derive.max_dimension, 256);
        assert!(!config.pipeline.inline_compaction);
        assert!(config.observability.metrics);
    }

    #[test]
    fn test_partial_sections() {
        let config = parse(
            r#"
server:
  port: 9100
storage:
  backend: aws
  collection: family-photos
  aws:
    endpoint_url: http://localhost:9000
    use_path_style: true
derive:
  clip_seconds: 5
logging:
  format: json
"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.storage.backend, "aws");
        assert_eq!(config.storage.aws.region, "us-east-1");
        assert!(config.storage.aws.use_path_style);
        assert_eq!(config.derive.clip_seconds, 5);
        assert_eq!(config.derive.ffmpeg, "ffmpeg");
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_key_prefix_applies_to_gateway_only() {
        let config = parse("storage:\n  backend: aws\n  aws:\n    prefix: photostash/\n").unwrap();
        assert_eq!(config.storage.key_prefix(), "photostash/");

        let config =
            parse("storage:\n  backend: local\n  aws:\n    prefix: photostash/\n").unwrap();
        assert_eq!(config.storage.key_prefix(), "");
    }

    #[test]
    fn test_unknown_backend_is_invalid() {
        let err = parse("storage:\n  backend: ftp\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("storage.backend"));
    }

    #[test]
    fn test_bad_collection_name_is_invalid() {
        let err = parse("storage:\n  collection: Photos_2024\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_zero_timeout_is_invalid() {
        let err = parse("derive:\n  timeout_seconds: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_malformed_yaml_is_a_parse_error() {
        let err = parse("server: [unclosed").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_missing_file_is_an_io_error() {
        let err = load_config("/nonexistent/photostash.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photostash.yaml");
        std::fs::write(&path, "storage:\n  backend: memory\n").unwrap();
        assert_eq!(load_config(&path).unwrap().storage.backend, "memory");
    }
}
