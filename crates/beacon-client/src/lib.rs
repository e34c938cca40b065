//! # beacon-client
//!
//! Client SDK for the Beacon presence sync engine.
//!
//! A [`Client`] drives one connection to a Beacon server. Channels are
//! obtained from the client and expose the presence API: subscribe to run
//! the join protocol, track/untrack to publish state, and event handlers
//! for `sync`, `join`, and `leave`.
//!
//! ```ignore
//! use beacon_client::{transport, Client, ChannelConfig, EventKind};
//!
//! let (sink, stream) = transport::websocket::connect("ws://localhost:4000/ws").await?;
//! let client = Client::connect(sink, stream).await?;
//!
//! let room = client.channel("room:lobby", ChannelConfig::default());
//! room.on(EventKind::Join, |event| println!("{event:?}"));
//! room.subscribe().await?;
//!
//! let mut state = beacon_protocol::StateMap::new();
//! state.insert("user".into(), serde_json::json!("u1"));
//! let status = room.track(state).await?;
//! ```
//!
//! Callbacks for one channel run sequentially on the client's driver task,
//! never overlapping, in the order updates were received.

pub mod channel;
pub mod client;
pub mod dispatch;
pub mod error;
pub mod transport;

pub use channel::{ChannelConfig, ChannelHandle, SyncState};
pub use client::{Client, ClientConfig};
pub use dispatch::{EventKind, PresenceEvent};
pub use error::{ClientError, DeliveryStatus};
pub use transport::{FrameSink, FrameStream, TransportError};
