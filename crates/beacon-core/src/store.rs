//! Per-channel presence state store.
//!
//! The store owns the authoritative `ChannelView` for one channel and a
//! monotonic version counter. Every applied change bumps the counter, so
//! observers can order changes and detect stale snapshots.
//!
//! Callers must serialize access per channel; the [`Registry`](crate::registry)
//! does this by keeping each store behind its channel's map entry, which is
//! the single ordering point for that channel.

use beacon_protocol::{ChannelView, PresenceEntry, StateMap};
use tracing::debug;

/// Entries added and removed by a single applied change.
///
/// A replacement (repeated track from the same connection) shows up as a
/// leave of the old entry plus a join of the new one.
#[derive(Debug, Clone, Default)]
pub struct EntryChangeSet {
    /// Entries that appeared.
    pub joins: Vec<PresenceEntry>,
    /// Entries that disappeared.
    pub leaves: Vec<PresenceEntry>,
}

impl EntryChangeSet {
    /// Check whether the change had any effect.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.leaves.is_empty()
    }
}

/// Authoritative presence state for one channel.
#[derive(Debug, Default)]
pub struct PresenceStore {
    view: ChannelView,
    version: u64,
}

impl PresenceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current channel version. Strictly increases with every applied change.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Total number of tracked entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.view.entry_count()
    }

    /// Check if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.view.is_empty()
    }

    /// Snapshot the current view.
    #[must_use]
    pub fn snapshot(&self) -> ChannelView {
        self.view.clone()
    }

    /// Apply a track or untrack for `(connection_id, key)`.
    ///
    /// `Some(state)` upserts the connection's entry under the key;
    /// `None` deletes it. Returns the resulting change set; an untrack of
    /// a non-existent entry is a no-op and does not bump the version.
    pub fn apply(
        &mut self,
        connection_id: &str,
        key: &str,
        state: Option<StateMap>,
    ) -> EntryChangeSet {
        match state {
            Some(state) => {
                let leaves = self
                    .view
                    .remove_where(|e| e.key == key && e.connection_id == connection_id);

                self.version += 1;
                let entry = PresenceEntry::new(key, connection_id, state, self.version);
                self.view.insert(entry.clone());

                debug!(key, connection = connection_id, version = self.version, "Presence tracked");
                EntryChangeSet {
                    joins: vec![entry],
                    leaves,
                }
            }
            None => {
                let leaves = self
                    .view
                    .remove_where(|e| e.key == key && e.connection_id == connection_id);

                if !leaves.is_empty() {
                    self.version += 1;
                    debug!(key, connection = connection_id, version = self.version, "Presence untracked");
                }
                EntryChangeSet {
                    joins: Vec::new(),
                    leaves,
                }
            }
        }
    }

    /// Remove every entry tracked by a connection, across all keys.
    ///
    /// Implicit leave on connection loss.
    pub fn remove_connection(&mut self, connection_id: &str) -> EntryChangeSet {
        let leaves = self.view.remove_where(|e| e.connection_id == connection_id);

        if !leaves.is_empty() {
            self.version += 1;
            debug!(
                connection = connection_id,
                removed = leaves.len(),
                "Presence dropped for lost connection"
            );
        }
        EntryChangeSet {
            joins: Vec::new(),
            leaves,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn state(value: serde_json::Value) -> StateMap {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_track_then_untrack() {
        let mut store = PresenceStore::new();

        let changes = store.apply("conn-a", "user:1", Some(state(json!({"user": "u1"}))));
        assert_eq!(changes.joins.len(), 1);
        assert!(changes.leaves.is_empty());
        assert_eq!(store.entry_count(), 1);

        let changes = store.apply("conn-a", "user:1", None);
        assert!(changes.joins.is_empty());
        assert_eq!(changes.leaves.len(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_retrack_replaces_entry() {
        let mut store = PresenceStore::new();

        store.apply("conn-a", "user:1", Some(state(json!({"status": "online"}))));
        let changes = store.apply("conn-a", "user:1", Some(state(json!({"status": "away"}))));

        // The replacement is a leave of the old entry plus a join of the new.
        assert_eq!(changes.joins.len(), 1);
        assert_eq!(changes.leaves.len(), 1);
        assert_eq!(store.entry_count(), 1);
        assert_eq!(
            store.snapshot().get("user:1").unwrap()[0].state["status"],
            json!("away")
        );
    }

    #[test]
    fn test_same_key_different_connections_coexist() {
        let mut store = PresenceStore::new();

        store.apply("conn-a", "userId-123", Some(StateMap::new()));
        store.apply("conn-b", "userId-123", Some(StateMap::new()));

        let view = store.snapshot();
        assert_eq!(view.get("userId-123").unwrap().len(), 2);

        // Untrack from one connection leaves the other entry alone.
        store.apply("conn-a", "userId-123", None);
        assert_eq!(store.snapshot().get("userId-123").unwrap().len(), 1);
        assert_eq!(
            store.snapshot().get("userId-123").unwrap()[0].connection_id,
            "conn-b"
        );
    }

    #[test]
    fn test_untrack_missing_is_noop() {
        let mut store = PresenceStore::new();

        let before = store.version();
        let changes = store.apply("conn-a", "user:1", None);
        assert!(changes.is_empty());
        assert_eq!(store.version(), before);
    }

    #[test]
    fn test_remove_connection_spans_keys() {
        let mut store = PresenceStore::new();

        store.apply("conn-a", "user:1", Some(StateMap::new()));
        store.apply("conn-a", "user:2", Some(StateMap::new()));
        store.apply("conn-b", "user:3", Some(StateMap::new()));

        let changes = store.remove_connection("conn-a");
        assert_eq!(changes.leaves.len(), 2);
        assert_eq!(store.entry_count(), 1);
        assert!(store.snapshot().contains_key("user:3"));
    }

    // Model operations for the fold property.
    #[derive(Debug, Clone)]
    enum Op {
        Track { conn: u8, key: u8, field: u8 },
        Untrack { conn: u8, key: u8 },
        Drop { conn: u8 },
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0u8..4, 0u8..4, any::<u8>())
                .prop_map(|(conn, key, field)| Op::Track { conn, key, field }),
            2 => (0u8..4, 0u8..4).prop_map(|(conn, key)| Op::Untrack { conn, key }),
            1 => (0u8..4).prop_map(|conn| Op::Drop { conn }),
        ]
    }

    proptest! {
        /// Folding each call's effect in issuance order reproduces the
        /// final view: the store is exactly the fold of its inputs.
        #[test]
        fn prop_final_view_equals_fold(ops in prop::collection::vec(arb_op(), 0..40)) {
            let mut store = PresenceStore::new();
            // Reference model: (key, conn) -> state payload.
            let mut model: BTreeMap<(String, String), StateMap> = BTreeMap::new();

            for op in &ops {
                match op {
                    Op::Track { conn, key, field } => {
                        let conn = format!("conn-{conn}");
                        let key = format!("user:{key}");
                        let payload = state(json!({"v": field}));
                        store.apply(&conn, &key, Some(payload.clone()));
                        model.insert((key, conn), payload);
                    }
                    Op::Untrack { conn, key } => {
                        let conn = format!("conn-{conn}");
                        let key = format!("user:{key}");
                        store.apply(&conn, &key, None);
                        model.remove(&(key, conn));
                    }
                    Op::Drop { conn } => {
                        let conn = format!("conn-{conn}");
                        store.remove_connection(&conn);
                        model.retain(|(_, c), _| *c != conn);
                    }
                }
            }

            let view = store.snapshot();
            let flattened: BTreeMap<(String, String), StateMap> = view
                .entries()
                .map(|e| ((e.key.clone(), e.connection_id.clone()), e.state.clone()))
                .collect();
            prop_assert_eq!(flattened, model);
        }

        /// Every effective change strictly increases the channel version,
        /// and entry versions never exceed the channel version.
        #[test]
        fn prop_versions_strictly_increase(ops in prop::collection::vec(arb_op(), 0..40)) {
            let mut store = PresenceStore::new();
            let mut last = store.version();

            for op in &ops {
                let changes = match op {
                    Op::Track { conn, key, .. } => store.apply(
                        &format!("conn-{conn}"),
                        &format!("user:{key}"),
                        Some(StateMap::new()),
                    ),
                    Op::Untrack { conn, key } => {
                        store.apply(&format!("conn-{conn}"), &format!("user:{key}"), None)
                    }
                    Op::Drop { conn } => store.remove_connection(&format!("conn-{conn}")),
                };

                if changes.is_empty() {
                    prop_assert_eq!(store.version(), last);
                } else {
                    prop_assert!(store.version() > last);
                }
                last = store.version();
            }

            for entry in store.snapshot().entries() {
                prop_assert!(entry.version <= store.version());
            }
        }
    }
}
