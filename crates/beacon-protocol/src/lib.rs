//! # beacon-protocol
//!
//! Wire protocol definitions for the Beacon presence sync engine.
//!
//! This crate defines the binary protocol spoken between Beacon clients and
//! servers: frame types, the MessagePack codec with length-prefixed framing,
//! protocol versioning, and the presence data model that travels on the wire.
//!
//! ## Frame Types
//!
//! - `Connect` / `Connected` - Connection handshake
//! - `Subscribe` / `Unsubscribe` - Channel membership
//! - `Track` / `Untrack` - Presence state upsert and removal
//! - `Sync` - Full presence state for a newly joined subscriber
//! - `Diff` - Incremental joins/leaves after the initial sync
//! - `Ack` / `Error` - Request acknowledgments
//!
//! ## Example
//!
//! ```rust
//! use beacon_protocol::{Frame, codec};
//!
//! let frame = Frame::untrack(7, "room:lobby");
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod presence;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{codes, Frame, FrameType};
pub use presence::{ChannelView, PresenceEntry, PresenceKey, StateMap};
pub use version::{Version, PROTOCOL_VERSION};
