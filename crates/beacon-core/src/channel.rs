//! Channel abstraction.
//!
//! A channel groups the connections subscribed to one topic and fans
//! presence updates out to them over a broadcast queue.

use beacon_protocol::PresenceEntry;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Default broadcast queue capacity.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// A channel identifier.
pub type ChannelId = String;

/// A presence change fanned out to every subscriber of a channel,
/// including the connection that caused it.
#[derive(Debug, Clone)]
pub struct PresenceUpdate {
    /// Channel the change happened in.
    pub channel: ChannelId,
    /// Channel version after the change.
    pub version: u64,
    /// Entries that appeared.
    pub joins: Vec<PresenceEntry>,
    /// Entries that disappeared.
    pub leaves: Vec<PresenceEntry>,
}

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if name.starts_with('$') {
        return Err("Channel names starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

/// Subscriber bookkeeping and update fan-out for one channel.
#[derive(Debug)]
pub struct Channel {
    name: ChannelId,
    sender: broadcast::Sender<Arc<PresenceUpdate>>,
    subscribers: HashSet<String>,
}

impl Channel {
    /// Create a new channel.
    #[must_use]
    pub fn new(name: impl Into<ChannelId>) -> Self {
        Self::with_capacity(name, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new channel with a specific broadcast capacity.
    #[must_use]
    pub fn with_capacity(name: impl Into<ChannelId>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            name: name.into(),
            sender,
            subscribers: HashSet::new(),
        }
    }

    /// Get the channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the number of subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Check if a connection is subscribed.
    #[must_use]
    pub fn is_subscribed(&self, connection_id: &str) -> bool {
        self.subscribers.contains(connection_id)
    }

    /// Subscribe a connection, returning a receiver for updates.
    pub fn subscribe(
        &mut self,
        connection_id: impl Into<String>,
    ) -> broadcast::Receiver<Arc<PresenceUpdate>> {
        let conn_id = connection_id.into();
        self.subscribers.insert(conn_id.clone());
        debug!(channel = %self.name, connection = %conn_id, "Connection subscribed");
        self.sender.subscribe()
    }

    /// Unsubscribe a connection.
    ///
    /// Returns `true` if the connection was subscribed.
    pub fn unsubscribe(&mut self, connection_id: &str) -> bool {
        let removed = self.subscribers.remove(connection_id);
        if removed {
            debug!(channel = %self.name, connection = %connection_id, "Connection unsubscribed");
        }
        removed
    }

    /// Broadcast an update to every subscriber.
    ///
    /// Returns the number of receivers that got the update.
    pub fn broadcast(&self, update: PresenceUpdate) -> usize {
        trace!(channel = %self.name, version = update.version, "Broadcasting presence update");
        self.sender.send(Arc::new(update)).unwrap_or_default()
    }

    /// Check if the channel has no subscribers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_creation() {
        let channel = Channel::new("room:lobby");
        assert_eq!(channel.name(), "room:lobby");
        assert_eq!(channel.subscriber_count(), 0);
        assert!(channel.is_empty());
    }

    #[test]
    fn test_channel_subscribe_unsubscribe() {
        let mut channel = Channel::new("room:lobby");

        let _rx = channel.subscribe("conn-a");
        assert_eq!(channel.subscriber_count(), 1);
        assert!(channel.is_subscribed("conn-a"));

        assert!(channel.unsubscribe("conn-a"));
        assert!(!channel.is_subscribed("conn-a"));
        assert!(!channel.unsubscribe("conn-a"));
    }

    #[test]
    fn test_channel_name_validation() {
        assert!(validate_channel_name("room:lobby").is_ok());
        assert!(validate_channel_name("").is_err());
        assert!(validate_channel_name("$system").is_err());

        let long_name = "a".repeat(MAX_CHANNEL_NAME_LENGTH + 1);
        assert!(validate_channel_name(&long_name).is_err());
    }

    #[tokio::test]
    async fn test_channel_broadcast_reaches_all_subscribers() {
        let mut channel = Channel::new("room:lobby");
        let mut rx1 = channel.subscribe("conn-a");
        let mut rx2 = channel.subscribe("conn-b");

        let count = channel.broadcast(PresenceUpdate {
            channel: "room:lobby".into(),
            version: 1,
            joins: vec![],
            leaves: vec![],
        });
        assert_eq!(count, 2);

        assert_eq!(rx1.recv().await.unwrap().version, 1);
        assert_eq!(rx2.recv().await.unwrap().version, 1);
    }
}
