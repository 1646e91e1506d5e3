//! Prometheus metrics for photostash.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants for the sync pipeline and the registry,
//! provides an axum middleware for HTTP RED metrics, and exposes the
//! `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "photostash_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "photostash_http_request_duration_seconds";

/// Events accepted by the router (counter). Labels: kind.
pub const EVENTS_ROUTED_TOTAL: &str = "photostash_events_routed_total";

/// Events dropped without producing a delta (counter). Labels: reason.
pub const EVENTS_DROPPED_TOTAL: &str = "photostash_events_dropped_total";

/// Preview derivations (counter). Labels: status.
pub const DERIVATIONS_TOTAL: &str = "photostash_derivations_total";

/// WAL segments written (counter).
pub const SEGMENTS_WRITTEN_TOTAL: &str = "photostash_segments_written_total";

/// Compaction passes (counter). Labels: status.
pub const COMPACTIONS_TOTAL: &str = "photostash_compactions_total";

/// Segments skipped because a concurrent compaction consumed them (counter).
pub const COMPACTION_CONFLICTS_TOTAL: &str = "photostash_compaction_conflicts_total";

/// Undecodable segments moved to `meta/corrupt/` (counter).
pub const SEGMENTS_QUARANTINED_TOTAL: &str = "photostash_segments_quarantined_total";

/// Registry mutations (counter). Labels: operation, status.
pub const REGISTRY_MUTATIONS_TOTAL: &str = "photostash_registry_mutations_total";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent; safe to call
/// multiple times (e.g. in tests).
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        // Another recorder may already be installed in tests; keep our handle
        // for rendering either way.
        let _ = metrics::set_global_recorder(recorder);
        handle
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(EVENTS_ROUTED_TOTAL, "Storage events accepted by the router");
    describe_counter!(EVENTS_DROPPED_TOTAL, "Storage events dropped without a delta");
    describe_counter!(DERIVATIONS_TOTAL, "Preview derivations by outcome");
    describe_counter!(SEGMENTS_WRITTEN_TOTAL, "WAL segments written");
    describe_counter!(COMPACTIONS_TOTAL, "Compaction passes by outcome");
    describe_counter!(
        COMPACTION_CONFLICTS_TOTAL,
        "Segments consumed by a concurrent compaction"
    );
    describe_counter!(
        SEGMENTS_QUARANTINED_TOTAL,
        "Undecodable segments set aside by compaction"
    );
    describe_counter!(REGISTRY_MUTATIONS_TOTAL, "Content registry mutations");
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation.
/// Must be the outermost layer so it captures the full request lifecycle.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.clone(),
        "path" => path.clone(),
        "status" => status
    )
    .increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Normalize an actual request path to a route template for metric labels.
///
/// Examples:
/// - `/health` -> `/health`
/// - `/content` -> `/content`
/// - `/content/img.jpg` -> `/content/{id}`
/// - `/content/img.jpg/original` -> `/content/{id}/original`
/// - anything unknown -> `/{other}`
fn normalize_path(path: &str) -> String {
    match path {
        "/" | "/health" | "/metrics" | "/events" | "/content" => path.to_string(),
        _ => {
            let Some(rest) = path.strip_prefix("/content/") else {
                return "/{other}".to_string();
            };
            match rest.rsplit_once('/') {
                Some((_, "original")) => "/content/{id}/original".to_string(),
                Some((_, "thumbnail")) => "/content/{id}/thumbnail".to_string(),
                _ => "/content/{id}".to_string(),
            }
        }
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}
