//! Derived metadata: per-field LWW records, WAL segments and compaction.

pub mod compactor;
pub mod record;
pub mod segment;

pub use compactor::{CompactionReport, Compactor};
pub use record::{next_stamp, Baseline, MetaDelta, MetaRecord, Stamped};
pub use segment::SegmentWriter;
