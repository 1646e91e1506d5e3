//! Axum router construction.
//!
//! The [`app`] function wires every endpoint to its handler and returns a
//! ready-to-serve [`axum::Router`].

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::errors::generate_request_id;
use crate::handlers::{content, events};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

/// Build the axum [`Router`] with all routes.
pub fn app(state: Arc<AppState>) -> Router {
    let request_timeout = Duration::from_secs(state.config.server.request_timeout_seconds);

    let mut router = Router::new().route("/health", get(health_check));
    if state.config.observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .route("/content", get(content::list_content))
        .route(
            "/content/:id",
            post(content::upload_content).delete(content::delete_content),
        )
        .route("/content/:id/original", get(content::get_original))
        .route("/content/:id/thumbnail", get(content::get_thumbnail))
        .route("/events", post(events::post_events))
        .with_state(state)
        // Layer ordering: inner layers run first, outer layers wrap them.
        .layer(TimeoutLayer::new(request_timeout))
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(TraceLayer::new_for_http())
        // metrics_middleware is outermost (captures full request lifecycle).
        .layer(middleware::from_fn(metrics_middleware))
        // Originals can be large videos.
        .layer(DefaultBodyLimit::disable())
}

/// Adds `x-request-id` (unless an error response already set one) and
/// `server` to every response.
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    if !headers.contains_key("x-request-id") {
        if let Ok(value) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-request-id", value);
        }
    }
    headers.insert("server", HeaderValue::from_static("photostash"));

    response
}

/// `GET /health`
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}
