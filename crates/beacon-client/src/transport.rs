//! Transport seam for the client.
//!
//! The client drives frames through a pair of halves: a [`FrameSink`] for
//! outbound frames and a [`FrameStream`] for inbound ones. The WebSocket
//! implementation is the production transport; the in-memory pair wires a
//! client directly to a test double without a socket.

use async_trait::async_trait;
use beacon_protocol::{codec, Frame, ProtocolError};
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport was closed.
    #[error("Transport closed")]
    Closed,

    /// Establishing the connection failed.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Failed to send a frame.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive a frame.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error while encoding or decoding.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Outbound half of a frame transport.
#[async_trait]
pub trait FrameSink: Send {
    /// Send a frame.
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Close the transport gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Inbound half of a frame transport.
#[async_trait]
pub trait FrameStream: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` when the transport is closed cleanly.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;
}

/// In-memory frame transport, used to wire a client to a test peer.
pub mod memory {
    use super::*;

    /// Sending half of an in-memory transport.
    pub struct MemorySink {
        tx: mpsc::UnboundedSender<Frame>,
    }

    /// Receiving half of an in-memory transport.
    pub struct MemoryStream {
        rx: mpsc::UnboundedReceiver<Frame>,
    }

    /// Create a connected pair of in-memory transports. Frames sent on one
    /// side's sink arrive on the other side's stream.
    #[must_use]
    pub fn pair() -> ((MemorySink, MemoryStream), (MemorySink, MemoryStream)) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            (MemorySink { tx: a_tx }, MemoryStream { rx: a_rx }),
            (MemorySink { tx: b_tx }, MemoryStream { rx: b_rx }),
        )
    }

    #[async_trait]
    impl FrameSink for MemorySink {
        async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
            self.tx.send(frame).map_err(|_| TransportError::Closed)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[async_trait]
    impl FrameStream for MemoryStream {
        async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
            Ok(self.rx.recv().await)
        }
    }
}

/// WebSocket frame transport built on tokio-tungstenite.
pub mod websocket {
    use super::*;
    use bytes::BytesMut;
    use futures_util::stream::{SplitSink, SplitStream};
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
    use tracing::{debug, warn};

    type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;

    /// Sending half of a WebSocket transport.
    pub struct WsSink {
        sink: SplitSink<WsConnection, Message>,
    }

    /// Receiving half of a WebSocket transport.
    pub struct WsStream {
        stream: SplitStream<WsConnection>,
        read_buffer: BytesMut,
    }

    /// Connect to a Beacon server over WebSocket.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or handshake fails.
    pub async fn connect(url: &str) -> Result<(WsSink, WsStream), TransportError> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        debug!(url, "WebSocket connected");

        let (sink, stream) = ws.split();
        Ok((
            WsSink { sink },
            WsStream {
                stream,
                read_buffer: BytesMut::with_capacity(4096),
            },
        ))
    }

    #[async_trait]
    impl FrameSink for WsSink {
        async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
            let data = codec::encode(&frame)?;
            self.sink
                .send(Message::Binary(data.to_vec()))
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string()))
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.sink
                .close()
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string()))
        }
    }

    #[async_trait]
    impl FrameStream for WsStream {
        async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
            // Drain any frame already buffered from a previous read.
            if let Some(frame) = codec::decode_from(&mut self.read_buffer)? {
                return Ok(Some(frame));
            }

            loop {
                match self.stream.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        self.read_buffer.extend_from_slice(&data);
                        if let Some(frame) = codec::decode_from(&mut self.read_buffer)? {
                            return Ok(Some(frame));
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Treat text as binary for compatibility.
                        self.read_buffer.extend_from_slice(text.as_bytes());
                        if let Some(frame) = codec::decode_from(&mut self.read_buffer)? {
                            return Ok(Some(frame));
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                        // WebSocket-level keepalives are handled by the stack.
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!("Received close frame");
                        return Ok(None);
                    }
                    Some(Err(WsError::ConnectionClosed)) => {
                        return Ok(None);
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        return Err(TransportError::ReceiveFailed(e.to_string()));
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        return Ok(None);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_delivers_frames() {
        let ((mut client_sink, _client_stream), (_server_sink, mut server_stream)) =
            memory::pair();

        client_sink.send(Frame::ack(7)).await.unwrap();
        let frame = server_stream.recv().await.unwrap().unwrap();
        assert_eq!(frame, Frame::ack(7));
    }

    #[tokio::test]
    async fn test_memory_stream_ends_when_peer_drops() {
        let ((client_sink, _client_stream), (_server_sink, mut server_stream)) = memory::pair();

        drop(client_sink);
        assert!(server_stream.recv().await.unwrap().is_none());
    }
}
