//! Diff engine: compares two channel views.
//!
//! An entry's identity is its `(key, connection_id)` pair; two entries with
//! the same identity but different versions are a replacement, reported as
//! a join of the new entry and a leave of the old one. The diff of a view
//! against itself is empty joins and leaves with everything unchanged,
//! which is what makes replayed syncs idempotent.

use beacon_protocol::{ChannelView, PresenceEntry};
use std::collections::HashMap;

/// Result of diffing two views.
#[derive(Debug, Clone, Default)]
pub struct PresenceDiff {
    /// Entries present in `after` but not (identically) in `before`.
    pub joins: Vec<PresenceEntry>,
    /// Entries present in `before` but not (identically) in `after`.
    pub leaves: Vec<PresenceEntry>,
    /// Entries identical in both views.
    pub unchanged: Vec<PresenceEntry>,
}

impl PresenceDiff {
    /// Check whether the diff carries any change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.leaves.is_empty()
    }
}

/// Compute the transition from `before` to `after`.
///
/// Multiple simultaneous joins and leaves are reported together in one
/// diff, preserving the atomicity of a single state transition.
#[must_use]
pub fn diff(before: &ChannelView, after: &ChannelView) -> PresenceDiff {
    let before_idx: HashMap<(&str, &str), &PresenceEntry> =
        before.entries().map(|e| (e.identity(), e)).collect();
    let after_idx: HashMap<(&str, &str), &PresenceEntry> =
        after.entries().map(|e| (e.identity(), e)).collect();

    let mut result = PresenceDiff::default();

    for entry in after.entries() {
        match before_idx.get(&entry.identity()) {
            Some(prev) if **prev == *entry => result.unchanged.push(entry.clone()),
            _ => result.joins.push(entry.clone()),
        }
    }

    for entry in before.entries() {
        match after_idx.get(&entry.identity()) {
            Some(next) if **next == *entry => {}
            _ => result.leaves.push(entry.clone()),
        }
    }

    result
}
