//! Event dispatcher.
//!
//! Handlers are registered per event kind and invoked sequentially on the
//! client's driver task. A panicking handler is caught and logged; it never
//! stops delivery to other handlers or corrupts the channel view. Closing
//! the dispatcher (on unsubscribe) stops new dispatches; a dispatch that
//! already snapshotted its handlers completes.

use beacon_protocol::{ChannelView, PresenceEntry, PresenceKey};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Presence event kinds a handler can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Full state was received and applied.
    Sync,
    /// Entries appeared under a key.
    Join,
    /// Entries disappeared from under a key.
    Leave,
}

/// A presence event delivered to handlers.
#[derive(Debug, Clone)]
pub enum PresenceEvent {
    /// The channel view was replaced by a full sync.
    Sync {
        /// The view after the sync was applied.
        view: ChannelView,
    },
    /// Entries joined under `key`.
    Join {
        /// Presence key the entries appeared under.
        key: PresenceKey,
        /// The entries that joined.
        joined: Vec<PresenceEntry>,
    },
    /// Entries left from under `key`.
    Leave {
        /// Presence key the entries disappeared from.
        key: PresenceKey,
        /// The entries that left.
        left: Vec<PresenceEntry>,
    },
}

impl PresenceEvent {
    /// The kind of this event.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            PresenceEvent::Sync { .. } => EventKind::Sync,
            PresenceEvent::Join { .. } => EventKind::Join,
            PresenceEvent::Leave { .. } => EventKind::Leave,
        }
    }
}

type Handler = dyn Fn(&PresenceEvent) + Send + Sync;

/// Per-channel handler registry.
#[derive(Default)]
pub(crate) struct Dispatcher {
    handlers: Vec<(EventKind, Arc<Handler>)>,
    closed: bool,
}

impl Dispatcher {
    /// Register a handler for an event kind.
    pub(crate) fn on(&mut self, kind: EventKind, handler: impl Fn(&PresenceEvent) + Send + Sync + 'static) {
        self.handlers.push((kind, Arc::new(handler)));
    }

    /// Stop all future dispatch. Idempotent.
    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    /// Resume dispatch after a close, keeping registered handlers.
    pub(crate) fn reopen(&mut self) {
        self.closed = false;
    }

    /// Snapshot the handlers registered for a kind, or `None` once closed.
    ///
    /// The snapshot is invoked outside the dispatcher lock, so a handler
    /// may freely call back into the channel.
    pub(crate) fn snapshot(&self, kind: EventKind) -> Option<Vec<Arc<Handler>>> {
        if self.closed {
            return None;
        }
        Some(
            self.handlers
                .iter()
                .filter(|(k, _)| *k == kind)
                .map(|(_, h)| Arc::clone(h))
                .collect(),
        )
    }
}

/// Invoke a handler snapshot, isolating each callback.
pub(crate) fn deliver(handlers: &[Arc<Handler>], event: &PresenceEvent) {
    for handler in handlers {
        if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
            warn!(kind = ?event.kind(), "Presence handler panicked; continuing with remaining handlers");
        }
    }
}

/// Group entries by presence key, in key order.
pub(crate) fn group_by_key(entries: &[PresenceEntry]) -> BTreeMap<PresenceKey, Vec<PresenceEntry>> {
    let mut grouped: BTreeMap<PresenceKey, Vec<PresenceEntry>> = BTreeMap::new();
    for entry in entries {
        grouped.entry(entry.key.clone()).or_default().push(entry.clone());
    }
    grouped
}
