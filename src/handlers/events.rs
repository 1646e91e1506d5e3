//! Event trigger endpoint.
//!
//! Accepts the object-storage notification envelope:
//!
//! ```json
//! {"messages": [{
//!     "event_metadata": {"event_type": "yandex.cloud.events.storage.ObjectCreate"},
//!     "details": {"bucket_id": "photos", "object_id": "origin/img1.jpg"}
//! }]}
//! ```

use axum::{extract::State, Json};
use serde::Deserialize;
use std::sync::Arc;

use crate::errors::SyncError;
use crate::router::{InboundEvent, RouteReport};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct TriggerEnvelope {
    #[serde(default)]
    pub messages: Vec<TriggerMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TriggerMessage {
    pub event_metadata: EventMetadata,
    pub details: EventDetails,
}

#[derive(Debug, Deserialize)]
pub struct EventMetadata {
    pub event_type: String,
}

#[derive(Debug, Deserialize)]
pub struct EventDetails {
    pub bucket_id: String,
    pub object_id: String,
}

impl From<TriggerMessage> for InboundEvent {
    fn from(message: TriggerMessage) -> Self {
        InboundEvent::new(
            message.details.bucket_id,
            message.details.object_id,
            message.event_metadata.event_type,
        )
    }
}

/// `POST /events`
///
/// 200 with a [`RouteReport`] when the batch is done; 400 if it cannot be
/// classified; 503 when part of it must be redelivered.
pub async fn post_events(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<TriggerEnvelope>,
) -> Result<Json<RouteReport>, SyncError> {
    let batch = envelope.messages.into_iter().map(InboundEvent::from).collect();
    let report = state.router.route(batch).await?;
    Ok(Json(report))
}
