//! Channel registry: the single ordering point per channel.
//!
//! The registry owns every channel's store and subscriber list behind a
//! sharded map. All track/untrack applications for one channel go through
//! its map entry, so changes are linearized per channel and every observer
//! sees the same join/leave order. Channels are independent: no lock spans
//! more than one channel.

use crate::channel::{validate_channel_name, Channel, ChannelId, PresenceUpdate};
use crate::key::generate_presence_key;
use crate::store::{EntryChangeSet, PresenceStore};
use beacon_protocol::{ChannelView, StateMap};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Invalid channel name.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),

    /// Not subscribed to channel.
    #[error("Not subscribed to channel: {0}")]
    NotSubscribed(String),

    /// Already subscribed to channel.
    #[error("Already subscribed to channel: {0}")]
    AlreadySubscribed(String),

    /// Maximum subscriptions reached for the connection.
    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,

    /// Maximum number of channels reached.
    #[error("Maximum number of channels reached")]
    MaxChannelsReached,
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of channels.
    pub max_channels: usize,
    /// Maximum subscriptions per connection.
    pub max_subscriptions_per_connection: usize,
    /// Broadcast queue capacity per channel.
    pub channel_capacity: usize,
    /// Whether to delete channels that lose their last subscriber.
    pub auto_delete_empty_channels: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_channels: 10_000,
            max_subscriptions_per_connection: 100,
            channel_capacity: 1024,
            auto_delete_empty_channels: true,
        }
    }
}

/// Result of a successful subscribe: the update receiver plus the state
/// needed for the initial sync frame, captured atomically so no diff can
/// fall between the snapshot and the first received update.
pub struct Subscription {
    /// Receiver for presence updates on the channel.
    pub receiver: broadcast::Receiver<Arc<PresenceUpdate>>,
    /// Presence key assigned to the connection, generated when the caller
    /// did not supply one.
    pub presence_key: String,
    /// Channel version at subscribe time.
    pub version: u64,
    /// Full channel view at subscribe time.
    pub view: ChannelView,
}

/// Channel entry: subscribers, store, and each connection's presence key.
struct ChannelSlot {
    channel: Channel,
    store: PresenceStore,
    keys: std::collections::HashMap<String, String>,
}

impl ChannelSlot {
    fn new(name: impl Into<ChannelId>, capacity: usize) -> Self {
        Self {
            channel: Channel::with_capacity(name, capacity),
            store: PresenceStore::new(),
            keys: std::collections::HashMap::new(),
        }
    }
}

/// The central channel registry.
pub struct Registry {
    channels: DashMap<ChannelId, ChannelSlot>,
    /// connection_id -> set of subscribed channel names.
    subscriptions: DashMap<String, dashmap::DashSet<ChannelId>>,
    /// connection_id -> last activity, for heartbeat pruning.
    liveness: DashMap<String, Instant>,
    config: RegistryConfig,
}

impl Registry {
    /// Create a new registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        info!("Creating registry with config: {:?}", config);
        Self {
            channels: DashMap::new(),
            subscriptions: DashMap::new(),
            liveness: DashMap::new(),
            config,
        }
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            channel_count: self.channels.len(),
            connection_count: self.subscriptions.len(),
            total_subscriptions: self.subscriptions.iter().map(|s| s.len()).sum(),
            tracked_entries: self.channels.iter().map(|s| s.store.entry_count()).sum(),
        }
    }

    /// Subscribe a connection to a channel.
    ///
    /// Returns the update receiver together with the snapshot for the
    /// initial sync.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel name is invalid or limits are
    /// exceeded.
    pub fn subscribe(
        &self,
        connection_id: &str,
        channel_name: &str,
        presence_key: Option<String>,
    ) -> Result<Subscription, RegistryError> {
        validate_channel_name(channel_name).map_err(RegistryError::InvalidChannel)?;

        let conn_subs = self
            .subscriptions
            .entry(connection_id.to_string())
            .or_default();

        if conn_subs.len() >= self.config.max_subscriptions_per_connection {
            return Err(RegistryError::MaxSubscriptionsReached);
        }
        if conn_subs.contains(channel_name) {
            return Err(RegistryError::AlreadySubscribed(channel_name.to_string()));
        }

        if !self.channels.contains_key(channel_name) && self.channels.len() >= self.config.max_channels
        {
            return Err(RegistryError::MaxChannelsReached);
        }

        let mut slot = self
            .channels
            .entry(channel_name.to_string())
            .or_insert_with(|| {
                debug!(channel = %channel_name, "Creating new channel");
                ChannelSlot::new(channel_name, self.config.channel_capacity)
            });

        // Receiver, key, and snapshot are taken under the same entry lock,
        // so the view plus subsequent updates form a gapless sequence.
        let receiver = slot.channel.subscribe(connection_id);
        let key = presence_key.unwrap_or_else(generate_presence_key);
        slot.keys.insert(connection_id.to_string(), key.clone());
        let version = slot.store.version();
        let view = slot.store.snapshot();

        conn_subs.insert(channel_name.to_string());

        debug!(
            channel = %channel_name,
            connection = %connection_id,
            presence_key = %key,
            subscribers = slot.channel.subscriber_count(),
            "Subscribed"
        );

        Ok(Subscription {
            receiver,
            presence_key: key,
            version,
            view,
        })
    }

    /// Unsubscribe a connection from a channel, dropping its presence.
    ///
    /// Remaining subscribers observe the resulting leaves.
    ///
    /// # Errors
    ///
    /// Returns an error if not subscribed.
    pub fn unsubscribe(&self, connection_id: &str, channel_name: &str) -> Result<(), RegistryError> {
        let subscribed = self
            .subscriptions
            .get(connection_id)
            .map(|subs| subs.remove(channel_name).is_some())
            .unwrap_or(false);
        if !subscribed {
            return Err(RegistryError::NotSubscribed(channel_name.to_string()));
        }

        self.leave_channel(connection_id, channel_name);
        Ok(())
    }

    /// Upsert a connection's presence state in a channel.
    ///
    /// The resulting diff is broadcast to every subscriber, including the
    /// sender. Returns the channel version after the change.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not subscribed.
    pub fn track(
        &self,
        connection_id: &str,
        channel_name: &str,
        state: StateMap,
    ) -> Result<u64, RegistryError> {
        self.apply(connection_id, channel_name, Some(state))
    }

    /// Remove a connection's presence from a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not subscribed.
    pub fn untrack(&self, connection_id: &str, channel_name: &str) -> Result<u64, RegistryError> {
        self.apply(connection_id, channel_name, None)
    }

    fn apply(
        &self,
        connection_id: &str,
        channel_name: &str,
        state: Option<StateMap>,
    ) -> Result<u64, RegistryError> {
        let mut slot = self
            .channels
            .get_mut(channel_name)
            .ok_or_else(|| RegistryError::NotSubscribed(channel_name.to_string()))?;

        let key = slot
            .keys
            .get(connection_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotSubscribed(channel_name.to_string()))?;

        let changes = slot.store.apply(connection_id, &key, state);
        let version = slot.store.version();
        Self::broadcast_changes(&slot, channel_name, version, changes);

        Ok(version)
    }

    /// Drop a connection entirely: unsubscribe everywhere and broadcast
    /// the implicit leaves. Used on disconnect and heartbeat expiry.
    pub fn connection_lost(&self, connection_id: &str) {
        self.liveness.remove(connection_id);

        if let Some((_, channels)) = self.subscriptions.remove(connection_id) {
            for channel_name in channels.iter() {
                self.leave_channel(connection_id, channel_name.as_str());
            }
        }

        debug!(connection = %connection_id, "Connection removed from all channels");
    }

    /// Record activity for a connection.
    pub fn touch(&self, connection_id: &str) {
        self.liveness
            .insert(connection_id.to_string(), Instant::now());
    }

    /// Drop connections idle for longer than `timeout`.
    ///
    /// Their presence entries leave every channel they were tracked in, so
    /// peers observe an ungraceful disconnect within the heartbeat window.
    /// Returns the pruned connection IDs.
    pub fn prune_stale(&self, timeout: Duration) -> Vec<String> {
        let stale: Vec<String> = self
            .liveness
            .iter()
            .filter(|entry| entry.value().elapsed() > timeout)
            .map(|entry| entry.key().clone())
            .collect();

        for connection_id in &stale {
            warn!(connection = %connection_id, "Pruning stale connection");
            self.connection_lost(connection_id);
        }

        stale
    }

    /// Check if a channel exists.
    #[must_use]
    pub fn channel_exists(&self, channel_name: &str) -> bool {
        self.channels.contains_key(channel_name)
    }

    /// Get the subscriber count for a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel_name: &str) -> usize {
        self.channels
            .get(channel_name)
            .map(|s| s.channel.subscriber_count())
            .unwrap_or(0)
    }

    /// Snapshot a channel's presence view, with its version.
    #[must_use]
    pub fn snapshot(&self, channel_name: &str) -> Option<(u64, ChannelView)> {
        self.channels
            .get(channel_name)
            .map(|s| (s.store.version(), s.store.snapshot()))
    }

    /// Remove a connection's presence and subscription from one channel,
    /// deleting the channel if it ends up empty.
    fn leave_channel(&self, connection_id: &str, channel_name: &str) {
        if let Some(mut slot) = self.channels.get_mut(channel_name) {
            let changes = slot.store.remove_connection(connection_id);
            let version = slot.store.version();
            Self::broadcast_changes(&slot, channel_name, version, changes);

            slot.keys.remove(connection_id);
            slot.channel.unsubscribe(connection_id);

            if self.config.auto_delete_empty_channels && slot.channel.is_empty() {
                drop(slot); // Release the entry lock
                self.channels.remove(channel_name);
                debug!(channel = %channel_name, "Deleted empty channel");
            }
        }
    }

    fn broadcast_changes(
        slot: &ChannelSlot,
        channel_name: &str,
        version: u64,
        changes: EntryChangeSet,
    ) {
        if changes.is_empty() {
            return;
        }
        slot.channel.broadcast(PresenceUpdate {
            channel: channel_name.to_string(),
            version,
            joins: changes.joins,
            leaves: changes.leaves,
        });
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry statistics.
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// Number of active channels.
    pub channel_count: usize,
    /// Number of known connections.
    pub connection_count: usize,
    /// Total number of subscriptions.
    pub total_subscriptions: usize,
    /// Total number of tracked presence entries.
    pub tracked_entries: usize,
}
