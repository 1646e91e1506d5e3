//! HTTP request handlers.

pub mod content;
pub mod events;

use axum::http::HeaderMap;

use crate::errors::SyncError;

/// Value of a header as UTF-8, if present and valid.
pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Parse an HTTP date into Unix seconds.
pub(crate) fn parse_http_date(value: &str) -> Option<i64> {
    let time = httpdate::parse_http_date(value).ok()?;
    let secs = time.duration_since(std::time::UNIX_EPOCH).ok()?.as_secs();
    i64::try_from(secs).ok()
}

/// Format Unix seconds as an HTTP date.  Negative values clamp to the epoch.
pub(crate) fn format_http_date(secs: i64) -> String {
    let secs = u64::try_from(secs).unwrap_or(0);
    httpdate::fmt_http_date(std::time::UNIX_EPOCH + std::time::Duration::from_secs(secs))
}

/// `If-Modified-Since` as Unix seconds.  An unparseable value is ignored,
/// as HTTP requires.
pub(crate) fn if_modified_since(headers: &HeaderMap) -> Option<i64> {
    header_str(headers, "if-modified-since").and_then(parse_http_date)
}

/// A header the request cannot do without, or that must be well formed.
pub(crate) fn invalid_header(name: &str, value: &str) -> SyncError {
    SyncError::InvalidRequest {
        message: format!("invalid {name} header: `{value}`"),
    }
}
