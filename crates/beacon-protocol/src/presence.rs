//! Presence data model shared between client and server.
//!
//! Presence state is an opaque JSON object tracked per connection under a
//! channel-scoped key. A key can hold several concurrent entries when
//! multiple connections track under the same key; entries are told apart by
//! connection identity.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifier for a tracked participant within a channel.
pub type PresenceKey = String;

/// Opaque state payload attached to a presence entry.
pub type StateMap = serde_json::Map<String, serde_json::Value>;

/// One tracked presence: a key, the connection that tracks it, the state
/// payload, and the channel version at which it was applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    /// Presence key this entry is filed under.
    pub key: PresenceKey,
    /// Connection that tracked this entry.
    pub connection_id: String,
    /// Caller-supplied state payload.
    pub state: StateMap,
    /// Channel version assigned when the entry was applied.
    pub version: u64,
}

impl PresenceEntry {
    /// Create a new entry.
    #[must_use]
    pub fn new(
        key: impl Into<PresenceKey>,
        connection_id: impl Into<String>,
        state: StateMap,
        version: u64,
    ) -> Self {
        Self {
            key: key.into(),
            connection_id: connection_id.into(),
            state,
            version,
        }
    }

    /// Identity of this entry within a view: key plus connection.
    #[must_use]
    pub fn identity(&self) -> (&str, &str) {
        (&self.key, &self.connection_id)
    }
}

/// Snapshot of all presence entries in a channel, keyed by presence key.
///
/// Keys with no entries are absent from the view. Entries under a key are
/// ordered by the version they were applied at.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelView {
    entries: BTreeMap<PresenceKey, Vec<PresenceEntry>>,
}

impl ChannelView {
    /// Create an empty view.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the entries tracked under a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&[PresenceEntry]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    /// Check whether any entry exists under a key.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of keys with at least one entry.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    /// Total number of entries across all keys.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Check if the view has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over keys and their entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&PresenceKey, &[PresenceEntry])> {
        self.entries.iter().map(|(k, v)| (k, v.as_slice()))
    }

    /// Iterate over every entry in the view, in key order.
    pub fn entries(&self) -> impl Iterator<Item = &PresenceEntry> {
        self.entries.values().flatten()
    }

    /// Insert an entry, keeping entries under the key ordered by version.
    pub fn insert(&mut self, entry: PresenceEntry) {
        let slot = self.entries.entry(entry.key.clone()).or_default();
        let pos = slot.partition_point(|e| e.version <= entry.version);
        slot.insert(pos, entry);
    }

    /// Remove entries matching a predicate. Keys left without entries are
    /// dropped from the view entirely.
    ///
    /// Returns the removed entries.
    pub fn remove_where<F>(&mut self, mut pred: F) -> Vec<PresenceEntry>
    where
        F: FnMut(&PresenceEntry) -> bool,
    {
        let mut removed = Vec::new();
        self.entries.retain(|_, slot| {
            let mut i = 0;
            while i < slot.len() {
                if pred(&slot[i]) {
                    removed.push(slot.remove(i));
                } else {
                    i += 1;
                }
            }
            !slot.is_empty()
        });
        removed
    }
}
