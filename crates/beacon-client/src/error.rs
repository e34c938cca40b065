//! Client error types and delivery statuses.

use crate::transport::TransportError;
use thiserror::Error;

/// Outcome of a track/untrack request, reported once the server has
/// accepted, refused, or failed to acknowledge it in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// The server applied the change; it is visible to peers.
    Ok,
    /// The server refused the request (e.g. payload too large).
    Error {
        /// Protocol error code.
        code: u16,
        /// Server-provided message.
        message: String,
    },
    /// No acknowledgment arrived within the ack timeout. The request is
    /// not retried; the caller must re-invoke.
    Timeout,
}

impl DeliveryStatus {
    /// Check for the `Ok` status.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, DeliveryStatus::Ok)
    }
}

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The connection to the server was lost. Subscribed channels fall
    /// back to `Disconnected`; resubscribing triggers a fresh full sync.
    #[error("Connection lost")]
    ConnectionLost,

    /// A request timed out before the server acknowledged it.
    #[error("Request timed out")]
    Timeout,

    /// The connection handshake failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The server refused a subscribe request.
    #[error("Subscribe failed ({code}): {message}")]
    SubscribeFailed {
        /// Protocol error code.
        code: u16,
        /// Server-provided message.
        message: String,
    },

    /// Transport failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
