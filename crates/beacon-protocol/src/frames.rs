//! Frame types for the Beacon protocol.
//!
//! Frames are the unit of exchange between clients and servers. Requests
//! that expect acknowledgment carry a client-assigned `id` echoed back in
//! the matching `Ack` or `Error` frame.

use crate::presence::{ChannelView, PresenceEntry, StateMap};
use serde::{Deserialize, Serialize};

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Connect = 0x01,
    Connected = 0x02,
    Subscribe = 0x03,
    Unsubscribe = 0x04,
    Track = 0x05,
    Untrack = 0x06,
    Sync = 0x07,
    Diff = 0x08,
    Ack = 0x09,
    Error = 0x0A,
    Ping = 0x0B,
    Pong = 0x0C,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Connect),
            0x02 => Ok(FrameType::Connected),
            0x03 => Ok(FrameType::Subscribe),
            0x04 => Ok(FrameType::Unsubscribe),
            0x05 => Ok(FrameType::Track),
            0x06 => Ok(FrameType::Untrack),
            0x07 => Ok(FrameType::Sync),
            0x08 => Ok(FrameType::Diff),
            0x09 => Ok(FrameType::Ack),
            0x0A => Ok(FrameType::Error),
            0x0B => Ok(FrameType::Ping),
            0x0C => Ok(FrameType::Pong),
            _ => Err("Invalid frame type"),
        }
    }
}

/// Protocol error codes carried in `Error` frames.
pub mod codes {
    /// Frame could not be decoded or violated the protocol.
    pub const MALFORMED: u16 = 1001;
    /// Subscribe was refused (invalid channel, limits exceeded).
    pub const SUBSCRIBE_FAILED: u16 = 1002;
    /// Track was refused by the server (e.g. payload too large).
    pub const TRACK_REJECTED: u16 = 1003;
    /// Operation on a channel the connection is not subscribed to.
    pub const NOT_SUBSCRIBED: u16 = 1004;
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Initial connection handshake.
    #[serde(rename = "connect")]
    Connect {
        /// Protocol version.
        version: u8,
        /// Optional authentication token, opaque to this protocol.
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Connection established response.
    #[serde(rename = "connected")]
    Connected {
        /// Server-assigned connection identifier.
        connection_id: String,
        /// Negotiated protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Begin the join protocol for a channel.
    #[serde(rename = "subscribe")]
    Subscribe {
        /// Request ID for acknowledgment.
        id: u64,
        /// Channel name.
        channel: String,
        /// Presence key to track under; the server assigns a time-ordered
        /// key when omitted.
        #[serde(skip_serializing_if = "Option::is_none")]
        presence_key: Option<String>,
    },

    /// Leave a channel.
    #[serde(rename = "unsubscribe")]
    Unsubscribe {
        /// Request ID for acknowledgment.
        id: u64,
        /// Channel name.
        channel: String,
    },

    /// Upsert the sender's presence state in a channel.
    #[serde(rename = "track")]
    Track {
        /// Request ID for acknowledgment.
        id: u64,
        /// Channel name.
        channel: String,
        /// Opaque state payload.
        state: StateMap,
    },

    /// Remove the sender's presence from a channel.
    #[serde(rename = "untrack")]
    Untrack {
        /// Request ID for acknowledgment.
        id: u64,
        /// Channel name.
        channel: String,
    },

    /// Full presence state, sent once per join (and on resubscribe).
    ///
    /// Unicast to the joining connection, never broadcast.
    #[serde(rename = "sync")]
    Sync {
        /// Channel name.
        channel: String,
        /// Channel version at the time of the snapshot.
        version: u64,
        /// Presence key assigned to the receiving connection.
        presence_key: String,
        /// Complete channel view.
        view: ChannelView,
    },

    /// Incremental presence change broadcast to all subscribers.
    #[serde(rename = "diff")]
    Diff {
        /// Channel name.
        channel: String,
        /// Channel version after the change was applied.
        version: u64,
        /// Entries that appeared.
        joins: Vec<PresenceEntry>,
        /// Entries that disappeared.
        leaves: Vec<PresenceEntry>,
    },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged request.
        id: u64,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not tied to a request).
        id: u64,
        /// Error code, see [`codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Subscribe { .. } => FrameType::Subscribe,
            Frame::Unsubscribe { .. } => FrameType::Unsubscribe,
            Frame::Track { .. } => FrameType::Track,
            Frame::Untrack { .. } => FrameType::Untrack,
            Frame::Sync { .. } => FrameType::Sync,
            Frame::Diff { .. } => FrameType::Diff,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Create a new Connect frame.
    #[must_use]
    pub fn connect(version: u8, token: Option<String>) -> Self {
        Frame::Connect { version, token }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version,
            heartbeat,
        }
    }

    /// Create a new Subscribe frame.
    #[must_use]
    pub fn subscribe(id: u64, channel: impl Into<String>, presence_key: Option<String>) -> Self {
        Frame::Subscribe {
            id,
            channel: channel.into(),
            presence_key,
        }
    }

    /// Create a new Unsubscribe frame.
    #[must_use]
    pub fn unsubscribe(id: u64, channel: impl Into<String>) -> Self {
        Frame::Unsubscribe {
            id,
            channel: channel.into(),
        }
    }

    /// Create a new Track frame.
    #[must_use]
    pub fn track(id: u64, channel: impl Into<String>, state: StateMap) -> Self {
        Frame::Track {
            id,
            channel: channel.into(),
            state,
        }
    }

    /// Create a new Untrack frame.
    #[must_use]
    pub fn untrack(id: u64, channel: impl Into<String>) -> Self {
        Frame::Untrack {
            id,
            channel: channel.into(),
        }
    }

    /// Create a new Sync frame.
    #[must_use]
    pub fn sync(
        channel: impl Into<String>,
        version: u64,
        presence_key: impl Into<String>,
        view: ChannelView,
    ) -> Self {
        Frame::Sync {
            channel: channel.into(),
            version,
            presence_key: presence_key.into(),
            view,
        }
    }

    /// Create a new Diff frame.
    #[must_use]
    pub fn diff(
        channel: impl Into<String>,
        version: u64,
        joins: Vec<PresenceEntry>,
        leaves: Vec<PresenceEntry>,
    ) -> Self {
        Frame::Diff {
            channel: channel.into(),
            version,
            joins,
            leaves,
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping(timestamp: Option<u64>) -> Self {
        Frame::Ping { timestamp }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type() {
        let subscribe = Frame::subscribe(1, "room:lobby", None);
        assert_eq!(subscribe.frame_type(), FrameType::Subscribe);

        let track = Frame::track(2, "room:lobby", StateMap::new());
        assert_eq!(track.frame_type(), FrameType::Track);

        let diff = Frame::diff("room:lobby", 3, vec![], vec![]);
        assert_eq!(diff.frame_type(), FrameType::Diff);
    }

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::try_from(0x05), Ok(FrameType::Track));
        assert_eq!(FrameType::try_from(0x07), Ok(FrameType::Sync));
        assert!(FrameType::try_from(0x0D).is_err());
    }
}
