//! Error taxonomy for the sync engine and the content API.
//!
//! Every variant maps to a stable error code and an HTTP status.  The enum
//! implements [`axum::response::IntoResponse`] so handlers can simply
//! return `Err(SyncError::NotFound { .. })`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::storage::backend::StorageError;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Errors surfaced by the pipeline, the registry and the HTTP layer.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Lookup miss in the registry.
    #[error("content not found: {id}")]
    NotFound { id: String },

    /// Conditional request matched the stored timestamp.  Not a failure,
    /// a control outcome rendered as 304.
    #[error("not modified")]
    NotModified,

    /// The derivation capability cannot build a preview for this type.
    #[error("unsupported media type `{content_type}`")]
    UnsupportedMediaType { content_type: String },

    /// The requested byte range lies outside the object.
    #[error("requested range not satisfiable")]
    InvalidRange,

    /// Transient storage failure; the caller should retry.
    #[error("storage failure: {0}")]
    StorageFailure(#[source] StorageError),

    /// The derivation tool failed for a supported type.
    #[error("derivation failed: {0}")]
    Derivation(#[source] anyhow::Error),

    /// A persisted document could not be decoded.
    #[error("corrupt document {key}: {source}")]
    CorruptDocument {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// A segment vanished between listing and loading because another
    /// compaction consumed it.  Self-healing; never shown to users.
    #[error("compaction conflict on segment {segment}")]
    CompactionConflict { segment: String },

    /// An inbound event batch contained an unrecognized event type.
    #[error("cannot classify event batch: {message}")]
    Classification { message: String },

    /// Some events in a batch failed; successful deltas were persisted and
    /// the whole batch should be redelivered.
    #[error("{failed} of {total} events failed; batch must be retried")]
    BatchIncomplete { failed: usize, total: usize },

    /// Malformed request input (headers, path parameters).
    #[error("{message}")]
    InvalidRequest { message: String },
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidRange { .. } => SyncError::InvalidRange,
            other => SyncError::StorageFailure(other),
        }
    }
}

impl SyncError {
    /// Return the stable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::NotFound { .. } => "NotFound",
            SyncError::NotModified => "NotModified",
            SyncError::UnsupportedMediaType { .. } => "UnsupportedMediaType",
            SyncError::InvalidRange => "InvalidRange",
            SyncError::StorageFailure(_) => "StorageFailure",
            SyncError::Derivation(_) => "DerivationFailed",
            SyncError::CorruptDocument { .. } => "CorruptDocument",
            SyncError::CompactionConflict { .. } => "CompactionConflict",
            SyncError::Classification { .. } => "Classification",
            SyncError::BatchIncomplete { .. } => "BatchIncomplete",
            SyncError::InvalidRequest { .. } => "InvalidRequest",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            SyncError::NotFound { .. } => StatusCode::NOT_FOUND,
            SyncError::NotModified => StatusCode::NOT_MODIFIED,
            SyncError::UnsupportedMediaType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            SyncError::InvalidRange => StatusCode::RANGE_NOT_SATISFIABLE,
            SyncError::StorageFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            SyncError::Derivation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SyncError::CorruptDocument { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            SyncError::CompactionConflict { .. } => StatusCode::CONFLICT,
            SyncError::Classification { .. } => StatusCode::BAD_REQUEST,
            SyncError::BatchIncomplete { .. } => StatusCode::SERVICE_UNAVAILABLE,
            SyncError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
        }
    }

    /// Whether redelivering the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::StorageFailure(_) | SyncError::BatchIncomplete { .. }
        )
    }
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();

        // 304 Not Modified responses must not have a body.
        if matches!(self, SyncError::NotModified) {
            return (status, [("x-request-id", request_id)]).into_response();
        }

        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "request failed");
        }

        let body = serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
            "request_id": request_id,
        });

        (
            status,
            [
                ("content-type", "application/json".to_string()),
                ("x-request-id", request_id),
            ],
            body.to_string(),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_format() {
        let id = generate_request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn test_backend_failure_is_retryable() {
        let err: SyncError = StorageError::Backend(anyhow::anyhow!("connection reset")).into();
        assert!(matches!(err, SyncError::StorageFailure(_)));
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_content_not_found_is_final() {
        let err = SyncError::NotFound {
            id: "x.jpg".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_storage_invalid_range_maps_to_invalid_range() {
        let err: SyncError = StorageError::InvalidRange {
            range: "bytes=9-".to_string(),
        }
        .into();
        assert!(matches!(err, SyncError::InvalidRange));
        assert_eq!(err.status_code(), StatusCode::RANGE_NOT_SATISFIABLE);
    }

    #[test]
    fn test_not_modified_has_no_body() {
        let response = SyncError::NotModified.into_response();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert!(response.headers().get("content-type").is_none());
    }

    #[test]
    fn test_error_response_is_json() {
        let response = SyncError::UnsupportedMediaType {
            content_type: "text/plain".to_string(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
        assert!(response.headers().contains_key("x-request-id"));
    }
}
