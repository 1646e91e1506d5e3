//! Content API: list, read, upload and delete library entries.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::debug;

use super::{format_http_date, header_str, if_modified_since, invalid_header, parse_http_date};
use crate::errors::SyncError;
use crate::registry::{Content, ContentBody, NewOriginal};
use crate::AppState;

/// `GET /content`
pub async fn list_content(State(state): State<Arc<AppState>>) -> Json<Vec<Content>> {
    Json(state.registry.list().await)
}

/// `GET /content/:id/original` -- honors `Range` and `If-Modified-Since`.
pub async fn get_original(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, SyncError> {
    let range = header_str(&headers, "range");
    let body = state
        .registry
        .get_original(&id, if_modified_since(&headers), range)
        .await?;
    Ok(content_response(body))
}

/// `GET /content/:id/thumbnail` -- honors `If-Modified-Since`.
pub async fn get_thumbnail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, SyncError> {
    let body = state
        .registry
        .get_thumbnail(&id, if_modified_since(&headers))
        .await?;
    Ok(content_response(body))
}

/// `POST /content/:id` -- body is the original; `Content-Type` and
/// `Last-Modified` describe it.  A missing `Last-Modified` means now.
pub async fn upload_content(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Content>), SyncError> {
    let content_type = header_str(&headers, "content-type").unwrap_or_default().to_string();
    let last_modified = match header_str(&headers, "last-modified") {
        Some(value) => {
            parse_http_date(value).ok_or_else(|| invalid_header("Last-Modified", value))?
        }
        None => chrono::Utc::now().timestamp(),
    };

    debug!(id = %id, content_type = %content_type, size = body.len(), "upload");
    let content = state
        .registry
        .upload(NewOriginal {
            id,
            content_type,
            last_modified,
            data: body,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(content)))
}

/// `DELETE /content/:id` -- idempotent.
pub async fn delete_content(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, SyncError> {
    state.registry.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn content_response(body: ContentBody) -> Response {
    let status = if body.object.content_range.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let content_length = body.object.content_length;
    let content_range = body.object.content_range.clone();

    let mut response = (status, body.object.data).into_response();
    let hdrs = response.headers_mut();
    hdrs.insert(
        "content-type",
        HeaderValue::from_str(&body.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    hdrs.insert("content-length", HeaderValue::from(content_length));
    if let Some(cr) = content_range.and_then(|cr| HeaderValue::from_str(&cr).ok()) {
        hdrs.insert("content-range", cr);
    }
    if let Ok(date) = HeaderValue::from_str(&format_http_date(body.last_modified)) {
        hdrs.insert("last-modified", date);
    }
    hdrs.insert("accept-ranges", HeaderValue::from_static("bytes"));
    response
}
