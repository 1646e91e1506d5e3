//! Event routing.
//!
//! Storage change notifications arrive in batches.  The router classifies
//! every event up front, groups them by collection, sends content changes
//! to the [`DerivationWorker`], persists the resulting deltas as one WAL
//! segment, and schedules compaction when a new segment shows up.
//!
//! Writes under `meta/` (the baseline, previews) generate notifications of
//! their own.  Only segment creation is acted on, and only by compacting;
//! nothing the compactor writes can trigger another compaction.

use metrics::counter;
use serde::Serialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{debug, info};

use crate::errors::SyncError;
use crate::keys::{self, Namespace};
use crate::meta::{Compactor, SegmentWriter};
use crate::metrics::EVENTS_ROUTED_TOTAL;
use crate::worker::{ContentChange, DerivationWorker};

/// What happened to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Deleted,
}

impl FromStr for EventKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" | "object_create" | "yandex.cloud.events.storage.ObjectCreate" => {
                Ok(EventKind::Created)
            }
            "deleted" | "object_delete" | "yandex.cloud.events.storage.ObjectDelete" => {
                Ok(EventKind::Deleted)
            }
            other => Err(SyncError::Classification {
                message: format!("unknown event type `{other}`"),
            }),
        }
    }
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Deleted => "deleted",
        }
    }
}

/// A notification as received, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub collection: String,
    pub key: String,
    pub event_type: String,
}

impl InboundEvent {
    pub fn new(
        collection: impl Into<String>,
        key: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
            event_type: event_type.into(),
        }
    }
}

/// A classified storage change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub collection: String,
    pub key: String,
    pub kind: EventKind,
}

impl TryFrom<InboundEvent> for Event {
    type Error = SyncError;

    fn try_from(inbound: InboundEvent) -> Result<Self, Self::Error> {
        if inbound.collection.is_empty() || inbound.key.is_empty() {
            return Err(SyncError::Classification {
                message: "event without collection or object key".to_string(),
            });
        }
        Ok(Event {
            kind: inbound.event_type.parse()?,
            collection: inbound.collection,
            key: inbound.key,
        })
    }
}

/// What a routed batch did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouteReport {
    /// Content events that produced a delta.
    pub derived: usize,
    /// Content events dropped for good.
    pub dropped: usize,
    /// Events outside the content namespace that needed no work.
    pub ignored: usize,
    pub segments_written: usize,
    pub compactions: usize,
}

pub struct EventRouter {
    worker: DerivationWorker,
    writer: SegmentWriter,
    compactor: Compactor,
    inline_compaction: bool,
    key_prefix: String,
}

impl EventRouter {
    pub fn new(worker: DerivationWorker, writer: SegmentWriter, compactor: Compactor) -> Self {
        Self {
            worker,
            writer,
            compactor,
            inline_compaction: false,
            key_prefix: String::new(),
        }
    }

    /// Notifications name raw bucket keys.  When the backend stores the
    /// collection under a prefix, strip it before classifying; keys outside
    /// the prefix are ignored.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Compact right after writing a segment, without waiting for the
    /// segment's own notification.
    pub fn with_inline_compaction(mut self, enabled: bool) -> Self {
        self.inline_compaction = enabled;
        self
    }

    pub fn compactor(&self) -> &Compactor {
        &self.compactor
    }

    /// Route one batch.
    ///
    /// An unrecognized event type fails the whole batch before anything is
    /// touched.  If some content events fail, the deltas of the others are
    /// still persisted and [`SyncError::BatchIncomplete`] asks the caller to
    /// redeliver the batch.
    pub async fn route(&self, batch: Vec<InboundEvent>) -> Result<RouteReport, SyncError> {
        let events = batch
            .into_iter()
            .map(Event::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let total = events.len();

        let mut by_collection: BTreeMap<String, Vec<Event>> = BTreeMap::new();
        for event in events {
            by_collection.entry(event.collection.clone()).or_default().push(event);
        }

        let mut report = RouteReport::default();
        let mut failed = 0;
        for (collection, events) in by_collection {
            failed += self.route_collection(&collection, events, &mut report).await?;
        }

        info!(
            events = total,
            derived = report.derived,
            dropped = report.dropped,
            ignored = report.ignored,
            segments = report.segments_written,
            compactions = report.compactions,
            failed,
            "routed event batch"
        );

        if failed > 0 {
            return Err(SyncError::BatchIncomplete { failed, total });
        }
        Ok(report)
    }

    /// Returns the number of failed events.
    async fn route_collection(
        &self,
        collection: &str,
        events: Vec<Event>,
        report: &mut RouteReport,
    ) -> Result<usize, SyncError> {
        let mut changes = Vec::new();
        let mut segment_created = false;

        for event in &events {
            let namespace = event
                .key
                .strip_prefix(self.key_prefix.as_str())
                .map_or(Namespace::Foreign, keys::classify);
            let label = match namespace {
                Namespace::Content(name) => {
                    changes.push(ContentChange {
                        name: name.to_string(),
                        kind: event.kind,
                    });
                    "content"
                }
                Namespace::Segment if event.kind == EventKind::Created => {
                    segment_created = true;
                    "segment"
                }
                _ => {
                    debug!(
                        collection,
                        key = %event.key,
                        kind = event.kind.as_str(),
                        "ignoring event"
                    );
                    report.ignored += 1;
                    "ignored"
                }
            };
            counter!(EVENTS_ROUTED_TOTAL, "kind" => label).increment(1);
        }

        let mut failed = 0;
        if !changes.is_empty() {
            // Pending segments count: a redelivered batch must see the
            // previews its first attempt already recorded.
            let baseline = self.compactor.current(collection).await?;
            let outcome = self.worker.process(collection, &changes, &baseline).await;
            report.derived += outcome.deltas.len();
            report.dropped += outcome.dropped;
            failed = outcome.failed;

            if self.writer.write(collection, &outcome.deltas).await?.is_some() {
                report.segments_written += 1;
                segment_created |= self.inline_compaction;
            }
        }

        if segment_created {
            self.compactor.compact(collection).await?;
            report.compactions += 1;
        }
        Ok(failed)
    }
}
