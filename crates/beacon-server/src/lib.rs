//! # beacon-server
//!
//! Realtime presence synchronization server.
//!
//! The binary in `main.rs` wires configuration, logging, and metrics
//! around [`handlers::run_server`]. The pieces are exposed as a library
//! so integration tests can run a server on an ephemeral port.

pub mod config;
pub mod handlers;
pub mod metrics;

pub use config::Config;
pub use handlers::{run_server, serve, AppState};
