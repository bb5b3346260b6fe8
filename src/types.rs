//! Core domain types for tidelog-db.
//!
//! An [`Event`] is one immutable record pulled back out of a stream file: the opaque
//! payload bytes plus the per-index back-pointer table that was persisted alongside
//! them. Index labels are opaque strings; the convention at the store boundary is
//! `name:value`, produced by [`label`].

use std::collections::HashMap;

use bytes::Bytes;

/// Join an index name and value into the opaque `name:value` label persisted on disk.
///
/// The storage layer never interprets the label; splitting it back apart is the
/// caller's concern.
pub fn label(name: &str, value: &str) -> String {
    format!("{name}:{value}")
}

/// A single event decoded from a stream file.
///
/// Events are immutable once written. The `offsets` table maps each index label the
/// event carries to the file offset of the previous event in the same file bearing
/// that label (0 if none), forming the per-index back-pointer chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Opaque payload bytes.
    pub data: Bytes,
    /// Back-pointer table: index label to previous offset carrying that label.
    pub offsets: HashMap<String, u64>,
}

impl Event {
    /// Offset of the previous event carrying the index `name:value`, or 0 if this
    /// event is the oldest in that chain.
    pub fn next(&self, name: &str, value: &str) -> u64 {
        self.back_offset(&label(name, value))
    }

    /// Back-pointer for a raw index label.
    pub(crate) fn back_offset(&self, label: &str) -> u64 {
        self.offsets.get(label).copied().unwrap_or(0)
    }
}
