//! # beacon-core
//!
//! Server-side presence engine for Beacon.
//!
//! This crate provides the pieces behind the sync protocol:
//!
//! - **PresenceStore** - Per-channel state store with a monotonic version
//! - **Diff** - Computes joins/leaves/unchanged between two views
//! - **Channel** - Subscriber bookkeeping and diff broadcast
//! - **Registry** - Linearizes application per channel and fans diffs out
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│  Registry   │────▶│   Channel   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │
//!                            ▼
//!                     ┌──────────────┐
//!                     │ PresenceStore│
//!                     └──────────────┘
//! ```

pub mod channel;
pub mod diff;
pub mod key;
pub mod registry;
pub mod store;

pub use channel::{Channel, ChannelId, PresenceUpdate};
pub use diff::{diff, PresenceDiff};
pub use registry::{Registry, RegistryConfig, RegistryError, Subscription};
pub use store::{EntryChangeSet, PresenceStore};
