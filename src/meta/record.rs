//! Metadata records with per-field last-write-wins merge.
//!
//! Every field of a [`MetaRecord`] is an independent LWW register: a value
//! plus the timestamp it was written at.  A field is either present
//! (`Some`) or absent (`None`); absence never means "clear this field", it
//! only means the writer did not touch it.
//!
//! Merging is a per-field maximum over `(timestamp, value)`.  Because the
//! order is total the merge is commutative, associative and idempotent, so
//! deltas can be folded in any order, any number of times.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};

static LAST_STAMP: AtomicI64 = AtomicI64::new(0);

/// Current time in Unix milliseconds, strictly increasing within the
/// process so two deltas from one worker never tie.
pub fn next_stamp() -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    let mut last = LAST_STAMP.load(AtomicOrdering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_STAMP.compare_exchange_weak(
            last,
            next,
            AtomicOrdering::Relaxed,
            AtomicOrdering::Relaxed,
        ) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// A value tagged with the time it was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamped<T> {
    pub value: T,
    /// Unix milliseconds.
    pub at: i64,
}

impl<T: Ord> Stamped<T> {
    pub fn new(value: T, at: i64) -> Self {
        Self { value, at }
    }

    /// Whether `self` should replace `current`.
    ///
    /// Newer timestamps win.  On a timestamp tie the greater value wins so
    /// the outcome does not depend on arrival order.
    pub fn supersedes(&self, current: &Self) -> bool {
        match self.at.cmp(&current.at) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.value > current.value,
        }
    }
}

/// Merge one incoming field into a slot. Returns true if the slot changed.
fn merge_field<T: Ord + Clone>(
    slot: &mut Option<Stamped<T>>,
    incoming: &Option<Stamped<T>>,
) -> bool {
    let Some(incoming) = incoming else {
        return false;
    };
    match slot {
        Some(current) if !incoming.supersedes(current) => false,
        _ => {
            *slot = Some(incoming.clone());
            true
        }
    }
}

/// Derived metadata for one object, keyed by `object_id`.
///
/// The same type doubles as a delta: a delta is a record in which only the
/// fields a writer touched are present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRecord {
    /// Object name without the `origin/` prefix.
    pub object_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_content_type: Option<Stamped<String>>,
    /// Preview name without the `meta/preview/` prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_id: Option<Stamped<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_content_type: Option<Stamped<String>>,
    /// Last modification of the original, Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<Stamped<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<Stamped<bool>>,
}

/// A partial [`MetaRecord`] produced by one event.
pub type MetaDelta = MetaRecord;

impl MetaRecord {
    pub fn new(object_id: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
            ..Default::default()
        }
    }

    pub fn with_preview(
        mut self,
        preview_id: impl Into<String>,
        content_type: impl Into<String>,
        at: i64,
    ) -> Self {
        self.preview_id = Some(Stamped::new(preview_id.into(), at));
        self.preview_content_type = Some(Stamped::new(content_type.into(), at));
        self
    }

    pub fn with_object(
        mut self,
        content_type: impl Into<String>,
        last_modified: Option<i64>,
        at: i64,
    ) -> Self {
        self.object_content_type = Some(Stamped::new(content_type.into(), at));
        if let Some(last_modified) = last_modified {
            self.last_modified = Some(Stamped::new(last_modified, at));
        }
        self
    }

    pub fn with_deleted(mut self, deleted: bool, at: i64) -> Self {
        self.deleted = Some(Stamped::new(deleted, at));
        self
    }

    /// Fold `delta` into this record field by field.
    ///
    /// Returns true if any field changed.
    pub fn absorb(&mut self, delta: &MetaRecord) -> bool {
        debug_assert_eq!(self.object_id, delta.object_id);
        let mut changed = false;
        changed |= merge_field(&mut self.object_content_type, &delta.object_content_type);
        changed |= merge_field(&mut self.preview_id, &delta.preview_id);
        changed |= merge_field(&mut self.preview_content_type, &delta.preview_content_type);
        changed |= merge_field(&mut self.last_modified, &delta.last_modified);
        changed |= merge_field(&mut self.deleted, &delta.deleted);
        changed
    }

    pub fn preview(&self) -> Option<&str> {
        self.preview_id.as_ref().map(|p| p.value.as_str())
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.as_ref().is_some_and(|d| d.value)
    }
}

/// The authoritative set of records for a collection.
///
/// Serialized as a JSON array sorted by `object_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<MetaRecord>", into = "Vec<MetaRecord>")]
pub struct Baseline {
    records: BTreeMap<String, MetaRecord>,
}

impl From<Vec<MetaRecord>> for Baseline {
    fn from(records: Vec<MetaRecord>) -> Self {
        let mut baseline = Baseline::default();
        baseline.fold(&records);
        baseline
    }
}

impl From<Baseline> for Vec<MetaRecord> {
    fn from(baseline: Baseline) -> Self {
        baseline.records.into_values().collect()
    }
}

impl Baseline {
    /// Fold deltas into the baseline, creating records on first sight.
    ///
    /// Returns the number of deltas that changed at least one field.
    pub fn fold<'a>(&mut self, deltas: impl IntoIterator<Item = &'a MetaRecord>) -> usize {
        let mut applied = 0;
        for delta in deltas {
            let record = self
                .records
                .entry(delta.object_id.clone())
                .or_insert_with(|| MetaRecord::new(delta.object_id.clone()));
            if record.absorb(delta) {
                applied += 1;
            }
        }
        applied
    }

    pub fn get(&self, object_id: &str) -> Option<&MetaRecord> {
        self.records.get(object_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &MetaRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
