//! Channel handles: the client-facing presence API.
//!
//! A handle wraps the shared per-channel state kept in sync by the client's
//! driver task: the local `ChannelView` replica, the sync state machine,
//! and the event dispatcher.

use crate::client::ClientInner;
use crate::dispatch::{deliver, group_by_key, Dispatcher, EventKind, PresenceEvent};
use crate::error::{ClientError, DeliveryStatus};
use beacon_core::diff;
use beacon_protocol::{ChannelView, Frame, PresenceEntry, StateMap};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Sync protocol states for a channel subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Not subscribed, or the connection dropped.
    Disconnected,
    /// Subscribe sent, waiting for the initial sync.
    Joining,
    /// Initial sync applied; diffs keep the view current.
    Synced,
}

/// Per-channel options.
#[derive(Debug, Clone, Default)]
pub struct ChannelConfig {
    /// Presence key to track under. The server assigns a time-ordered key
    /// when this is `None`.
    pub presence_key: Option<String>,
}

struct ViewState {
    sync_state: SyncState,
    view: ChannelView,
    version: u64,
    presence_key: Option<String>,
    tracked: Option<StateMap>,
    sync_waiters: Vec<oneshot::Sender<()>>,
}

/// State shared between a channel handle and the client driver task.
pub(crate) struct ChannelShared {
    topic: String,
    state: Mutex<ViewState>,
    dispatcher: Mutex<Dispatcher>,
}

impl ChannelShared {
    pub(crate) fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            state: Mutex::new(ViewState {
                sync_state: SyncState::Disconnected,
                view: ChannelView::new(),
                version: 0,
                presence_key: None,
                tracked: None,
                sync_waiters: Vec::new(),
            }),
            dispatcher: Mutex::new(Dispatcher::default()),
        }
    }

    /// Apply a full sync: replace the view, wake subscribe waiters, then
    /// fire `sync` followed by the joins/leaves the replacement implied.
    /// Replaying an identical sync fires `sync` alone.
    pub(crate) fn apply_sync(&self, version: u64, presence_key: String, view: ChannelView) {
        let (changes, waiters) = {
            let mut st = self.state.lock().unwrap();
            let changes = diff(&st.view, &view);
            st.view = view.clone();
            st.version = version;
            st.presence_key = Some(presence_key);
            st.sync_state = SyncState::Synced;
            (changes, std::mem::take(&mut st.sync_waiters))
        };
        for waiter in waiters {
            let _ = waiter.send(());
        }

        debug!(channel = %self.topic, version, "Sync applied");
        self.dispatch(EventKind::Sync, &PresenceEvent::Sync { view });
        self.dispatch_changes(&changes.joins, &changes.leaves);
    }

    /// Apply an incremental diff to the local view, then fire `join` and
    /// `leave` events.
    pub(crate) fn apply_diff(
        &self,
        version: u64,
        joins: Vec<PresenceEntry>,
        leaves: Vec<PresenceEntry>,
    ) {
        {
            let mut st = self.state.lock().unwrap();
            if st.sync_state != SyncState::Synced {
                warn!(channel = %self.topic, "Dropping diff received outside synced state");
                return;
            }
            for leave in &leaves {
                st.view
                    .remove_where(|e| e.identity() == leave.identity() && e.version == leave.version);
            }
            for join in &joins {
                st.view.insert(join.clone());
            }
            st.version = version;
        }

        self.dispatch_changes(&joins, &leaves);
    }

    /// Drop to `Disconnected`; pending subscribe waiters observe the loss.
    pub(crate) fn mark_disconnected(&self) {
        let mut st = self.state.lock().unwrap();
        st.sync_state = SyncState::Disconnected;
        st.sync_waiters.clear();
    }

    fn dispatch(&self, kind: EventKind, event: &PresenceEvent) {
        // Handlers are snapshotted under the lock but invoked outside it,
        // so a callback may call back into the channel.
        let handlers = self.dispatcher.lock().unwrap().snapshot(kind);
        if let Some(handlers) = handlers {
            deliver(&handlers, event);
        }
    }

    fn dispatch_changes(&self, joins: &[PresenceEntry], leaves: &[PresenceEntry]) {
        for (key, joined) in group_by_key(joins) {
            self.dispatch(EventKind::Join, &PresenceEvent::Join { key, joined });
        }
        for (key, left) in group_by_key(leaves) {
            self.dispatch(EventKind::Leave, &PresenceEvent::Leave { key, left });
        }
    }
}

/// Handle to one channel on a connected client.
///
/// Cheap to clone; all clones share the same channel state.
#[derive(Clone)]
pub struct ChannelHandle {
    shared: Arc<ChannelShared>,
    client: Arc<ClientInner>,
    config: ChannelConfig,
}

impl ChannelHandle {
    pub(crate) fn new(
        shared: Arc<ChannelShared>,
        client: Arc<ClientInner>,
        config: ChannelConfig,
    ) -> Self {
        Self {
            shared,
            client,
            config,
        }
    }

    /// Get the channel topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    /// Begin the join protocol.
    ///
    /// Sends `Subscribe`, awaits the server's acknowledgment, and then the
    /// initial full sync. Returns once the channel is `Synced`. Also used
    /// to rejoin after `ConnectionLost`; the server answers with a fresh
    /// full sync rather than replaying missed diffs.
    ///
    /// # Errors
    ///
    /// Returns an error if the server refuses the subscription or the
    /// handshake times out.
    pub async fn subscribe(&self) -> Result<(), ClientError> {
        let rx = {
            let mut st = self.shared.state.lock().unwrap();
            st.sync_state = SyncState::Joining;
            let (tx, rx) = oneshot::channel();
            st.sync_waiters.push(tx);
            rx
        };
        self.shared.dispatcher.lock().unwrap().reopen();

        let id = self.client.next_request_id();
        let frame = Frame::subscribe(id, self.topic(), self.config.presence_key.clone());
        let status = self.client.request(id, frame).await;

        let failure = match status {
            Ok(DeliveryStatus::Ok) => None,
            Ok(DeliveryStatus::Error { code, message }) => {
                Some(ClientError::SubscribeFailed { code, message })
            }
            Ok(DeliveryStatus::Timeout) => Some(ClientError::Timeout),
            Err(e) => Some(e),
        };
        if let Some(err) = failure {
            self.shared.mark_disconnected();
            return Err(err);
        }

        match tokio::time::timeout(self.client.ack_timeout(), rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ClientError::ConnectionLost),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Leave the channel.
    ///
    /// Event dispatch stops before this method returns; an event already
    /// being delivered may complete, but no new dispatch begins afterward.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is lost or the server does not
    /// acknowledge in time.
    pub async fn unsubscribe(&self) -> Result<(), ClientError> {
        self.shared.dispatcher.lock().unwrap().close();
        self.shared.mark_disconnected();

        let id = self.client.next_request_id();
        let status = self
            .client
            .request(id, Frame::unsubscribe(id, self.topic()))
            .await?;
        match status {
            DeliveryStatus::Ok => Ok(()),
            DeliveryStatus::Error { code, message } => {
                // Local teardown already happened; a server-side refusal
                // (e.g. not subscribed) leaves nothing to undo.
                warn!(channel = %self.topic(), code, %message, "Unsubscribe refused by server");
                Ok(())
            }
            DeliveryStatus::Timeout => Err(ClientError::Timeout),
        }
    }

    /// Upsert this connection's presence state.
    ///
    /// Suspends until the server acknowledges or the ack timeout elapses.
    /// On anything but `Ok` the locally tracked state rolls back to its
    /// pre-call value.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is lost.
    pub async fn track(&self, state: StateMap) -> Result<DeliveryStatus, ClientError> {
        let prev = {
            let mut st = self.shared.state.lock().unwrap();
            std::mem::replace(&mut st.tracked, Some(state.clone()))
        };

        let id = self.client.next_request_id();
        let result = self
            .client
            .request(id, Frame::track(id, self.topic(), state))
            .await;

        match &result {
            Ok(DeliveryStatus::Ok) => {}
            _ => {
                let mut st = self.shared.state.lock().unwrap();
                st.tracked = prev;
            }
        }
        result
    }

    /// Remove this connection's presence.
    ///
    /// Same acknowledgment and rollback contract as [`track`](Self::track).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is lost.
    pub async fn untrack(&self) -> Result<DeliveryStatus, ClientError> {
        let prev = {
            let mut st = self.shared.state.lock().unwrap();
            st.tracked.take()
        };

        let id = self.client.next_request_id();
        let result = self
            .client
            .request(id, Frame::untrack(id, self.topic()))
            .await;

        match &result {
            Ok(DeliveryStatus::Ok) => {}
            _ => {
                let mut st = self.shared.state.lock().unwrap();
                st.tracked = prev;
            }
        }
        result
    }

    /// Register a handler for a presence event kind.
    pub fn on(&self, kind: EventKind, handler: impl Fn(&PresenceEvent) + Send + Sync + 'static) {
        self.shared.dispatcher.lock().unwrap().on(kind, handler);
    }

    /// Read-only snapshot of the current channel view.
    #[must_use]
    pub fn presence_state(&self) -> ChannelView {
        self.shared.state.lock().unwrap().view.clone()
    }

    /// Channel version of the last applied sync or diff.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.shared.state.lock().unwrap().version
    }

    /// The presence key assigned at subscribe time.
    #[must_use]
    pub fn presence_key(&self) -> Option<String> {
        self.shared.state.lock().unwrap().presence_key.clone()
    }

    /// Current sync protocol state.
    #[must_use]
    pub fn sync_state(&self) -> SyncState {
        self.shared.state.lock().unwrap().sync_state
    }

    /// The state this connection believes it has tracked.
    #[must_use]
    pub fn local_state(&self) -> Option<StateMap> {
        self.shared.state.lock().unwrap().tracked.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry(key: &str, conn: &str, version: u64) -> PresenceEntry {
        PresenceEntry::new(key, conn, StateMap::new(), version)
    }

    fn view(entries: Vec<PresenceEntry>) -> ChannelView {
        let mut view = ChannelView::new();
        for e in entries {
            view.insert(e);
        }
        view
    }

    fn record_events(shared: &ChannelShared) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = shared.dispatcher.lock().unwrap();
        for kind in [EventKind::Sync, EventKind::Join, EventKind::Leave] {
            let log = Arc::clone(&log);
            dispatcher.on(kind, move |event| {
                let label = match event {
                    PresenceEvent::Sync { .. } => "sync".to_string(),
                    PresenceEvent::Join { key, .. } => format!("join:{key}"),
                    PresenceEvent::Leave { key, .. } => format!("leave:{key}"),
                };
                log.lock().unwrap().push(label);
            });
        }
        log
    }

    #[test]
    fn test_sync_fires_sync_then_joins() {
        let shared = ChannelShared::new("room:lobby");
        let log = record_events(&shared);

        shared.apply_sync(
            2,
            "me".into(),
            view(vec![entry("user:1", "conn-a", 1), entry("user:2", "conn-b", 2)]),
        );

        let log = log.lock().unwrap();
        assert_eq!(*log, vec!["sync", "join:user:1", "join:user:2"]);
    }

    #[test]
    fn test_replayed_sync_is_noop_beyond_sync_event() {
        let shared = ChannelShared::new("room:lobby");
        let v = view(vec![entry("user:1", "conn-a", 1)]);

        shared.apply_sync(1, "me".into(), v.clone());
        let log = record_events(&shared);
        shared.apply_sync(1, "me".into(), v);

        // Identical view replayed: sync fires, no joins or leaves.
        assert_eq!(*log.lock().unwrap(), vec!["sync"]);
    }

    #[test]
    fn test_diff_updates_view_and_fires_in_order() {
        let shared = ChannelShared::new("room:lobby");
        shared.apply_sync(1, "me".into(), view(vec![entry("user:1", "conn-a", 1)]));

        let log = record_events(&shared);
        shared.apply_diff(
            2,
            vec![entry("user:2", "conn-b", 2)],
            vec![entry("user:1", "conn-a", 1)],
        );

        assert_eq!(*log.lock().unwrap(), vec!["join:user:2", "leave:user:1"]);

        let st = shared.state.lock().unwrap();
        assert!(!st.view.contains_key("user:1"));
        assert!(st.view.contains_key("user:2"));
        assert_eq!(st.version, 2);
    }

    #[test]
    fn test_diff_before_sync_is_dropped() {
        let shared = ChannelShared::new("room:lobby");
        let log = record_events(&shared);

        shared.apply_diff(1, vec![entry("user:1", "conn-a", 1)], vec![]);

        assert!(log.lock().unwrap().is_empty());
        assert!(shared.state.lock().unwrap().view.is_empty());
    }

    #[test]
    fn test_sync_event_carries_full_view() {
        let shared = ChannelShared::new("room:lobby");
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = Arc::clone(&seen);
            shared.dispatcher.lock().unwrap().on(EventKind::Sync, move |event| {
                if let PresenceEvent::Sync { view } = event {
                    seen.store(view.entry_count(), Ordering::SeqCst);
                }
            });
        }

        let mut state = StateMap::new();
        state.insert("user".into(), json!("u1"));
        let mut v = ChannelView::new();
        v.insert(PresenceEntry::new("user:1", "conn-a", state, 1));
        shared.apply_sync(1, "me".into(), v);

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
