use std::cmp::Ordering;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sentinel for a sequence number that has not been assigned by a committed
/// manifest yet. Assigned sequences start at 1.
pub const SEQ_UNASSIGNED: u64 = 0;

/// A single versioned document record.
///
/// The visible version of an id is the record with the largest `at`
/// timestamp; ties are broken by the lexicographic order of the containing
/// shard filename, then by `seq`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    /// Stable application-assigned identifier
    pub id: String,

    /// Logical wall-clock timestamp in milliseconds, monotonic-ish per writer
    pub at: u64,

    /// Sequence number assigned on ingestion, `SEQ_UNASSIGNED` while pending
    pub seq: u64,

    /// Tombstone flag
    pub del: bool,

    /// Opaque application payload, absent for tombstones
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Document {
    /// Create a new live document stamped with the current wall clock.
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            at: now_millis(),
            seq: SEQ_UNASSIGNED,
            del: false,
            data: Some(data),
        }
    }

    /// Create a tombstone for a deleted id.
    pub fn tombstone(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            at: now_millis(),
            seq: SEQ_UNASSIGNED,
            del: true,
            data: None,
        }
    }

    /// Override the timestamp, mainly for deterministic ordering in callers
    /// that replay history.
    pub fn with_at(mut self, at: u64) -> Self {
        self.at = at;
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    /// Whether this record still awaits a committed sequence number.
    pub fn is_pending(&self) -> bool {
        self.seq == SEQ_UNASSIGNED
    }
}

/// Last-writer-wins ordering between two versions of the same id.
///
/// Returns `Ordering::Greater` when `(a, a_shard)` is the visible version.
pub fn compare_versions(
    a: &Document,
    a_shard: &str,
    b: &Document,
    b_shard: &str,
) -> Ordering {
    a.at.cmp(&b.at)
        .then_with(|| a_shard.cmp(b_shard))
        .then_with(|| a.seq.cmp(&b.seq))
}

/// Sort key used everywhere a batch of documents needs a deterministic
/// order: by `at` ascending, then by `id`.
pub fn batch_order(a: &Document, b: &Document) -> Ordering {
    a.at.cmp(&b.at).then_with(|| a.id.cmp(&b.id))
}

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
