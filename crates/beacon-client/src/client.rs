//! Connection driver.
//!
//! `Client::connect` performs the handshake and spawns three tasks: a
//! writer draining the outbound queue into the transport, a reader routing
//! inbound frames, and an optional heartbeat. All presence callbacks for a
//! connection run on the reader task, so per-channel delivery is sequential
//! and in receive order.

use crate::channel::{ChannelConfig, ChannelHandle, ChannelShared};
use crate::error::{ClientError, DeliveryStatus};
use crate::transport::{FrameSink, FrameStream};
use beacon_protocol::{Frame, Version, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, warn};

/// Client tuning knobs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long to wait for the server to acknowledge a request before the
    /// caller sees [`DeliveryStatus::Timeout`].
    pub ack_timeout: Duration,
    /// How long to wait for the `Connected` handshake response.
    pub connect_timeout: Duration,
    /// Authentication token sent with the handshake, opaque to the client.
    pub token: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            token: None,
        }
    }
}

enum AckResult {
    Ok,
    Err { code: u16, message: String },
}

pub(crate) struct ClientInner {
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Mutex<HashMap<u64, oneshot::Sender<AckResult>>>,
    next_id: AtomicU64,
    channels: Mutex<HashMap<String, Arc<ChannelShared>>>,
    connection_id: String,
    alive: AtomicBool,
    shutdown: Notify,
    config: ClientConfig,
}

impl ClientInner {
    pub(crate) fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn ack_timeout(&self) -> Duration {
        self.config.ack_timeout
    }

    /// Send a request frame and wait for its `Ack`/`Error` response.
    pub(crate) async fn request(&self, id: u64, frame: Frame) -> Result<DeliveryStatus, ClientError> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(ClientError::ConnectionLost);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        if self.outbound.send(frame).is_err() {
            self.pending.lock().unwrap().remove(&id);
            return Err(ClientError::ConnectionLost);
        }

        match tokio::time::timeout(self.config.ack_timeout, rx).await {
            Ok(Ok(AckResult::Ok)) => Ok(DeliveryStatus::Ok),
            Ok(Ok(AckResult::Err { code, message })) => Ok(DeliveryStatus::Error { code, message }),
            // Pending sender dropped: the reader task saw the connection die.
            Ok(Err(_)) => Err(ClientError::ConnectionLost),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Ok(DeliveryStatus::Timeout)
            }
        }
    }

    fn resolve(&self, id: u64, result: AckResult) {
        match self.pending.lock().unwrap().remove(&id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(id, "Response for unknown or timed-out request"),
        }
    }

    fn channel_shared(&self, channel: &str) -> Option<Arc<ChannelShared>> {
        self.channels.lock().unwrap().get(channel).cloned()
    }

    fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Ack { id } => self.resolve(id, AckResult::Ok),
            Frame::Error { id, code, message } => {
                if id == 0 {
                    warn!(code, %message, "Server error");
                } else {
                    self.resolve(id, AckResult::Err { code, message });
                }
            }
            Frame::Sync {
                channel,
                version,
                presence_key,
                view,
            } => match self.channel_shared(&channel) {
                Some(shared) => shared.apply_sync(version, presence_key, view),
                None => warn!(%channel, "Sync for unknown channel"),
            },
            Frame::Diff {
                channel,
                version,
                joins,
                leaves,
            } => match self.channel_shared(&channel) {
                Some(shared) => shared.apply_diff(version, joins, leaves),
                None => warn!(%channel, "Diff for unknown channel"),
            },
            Frame::Ping { timestamp } => {
                let _ = self.outbound.send(Frame::pong(timestamp));
            }
            Frame::Pong { .. } => {}
            other => {
                warn!(frame_type = ?other.frame_type(), "Unexpected frame from server");
            }
        }
    }

    fn connection_lost(&self) {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        info!(connection_id = %self.connection_id, "Connection lost");

        // Dropping the pending senders fails every in-flight request.
        self.pending.lock().unwrap().clear();
        for shared in self.channels.lock().unwrap().values() {
            shared.mark_disconnected();
        }
    }
}

/// A connection to a Beacon server.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connection_id", &self.inner.connection_id)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connect over an established transport with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails or times out.
    pub async fn connect<S, R>(sink: S, stream: R) -> Result<Self, ClientError>
    where
        S: FrameSink + 'static,
        R: FrameStream + 'static,
    {
        Self::connect_with_config(sink, stream, ClientConfig::default()).await
    }

    /// Connect over an established transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails or times out.
    pub async fn connect_with_config<S, R>(
        mut sink: S,
        mut stream: R,
        config: ClientConfig,
    ) -> Result<Self, ClientError>
    where
        S: FrameSink + 'static,
        R: FrameStream + 'static,
    {
        sink.send(Frame::connect(PROTOCOL_VERSION.major, config.token.clone()))
            .await?;

        let frame = tokio::time::timeout(config.connect_timeout, stream.recv())
            .await
            .map_err(|_| ClientError::Timeout)??
            .ok_or(ClientError::ConnectionLost)?;

        let (connection_id, heartbeat) = match frame {
            Frame::Connected {
                connection_id,
                version,
                heartbeat,
            } => {
                let server = Version::new(version, 0);
                if !PROTOCOL_VERSION.is_compatible_with(&server) {
                    return Err(ClientError::Handshake(format!(
                        "incompatible protocol version {version}"
                    )));
                }
                (connection_id, heartbeat)
            }
            other => {
                return Err(ClientError::Handshake(format!(
                    "expected connected frame, got {:?}",
                    other.frame_type()
                )))
            }
        };

        info!(connection_id = %connection_id, heartbeat, "Connected");

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let inner = Arc::new(ClientInner {
            outbound: outbound_tx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            channels: Mutex::new(HashMap::new()),
            connection_id,
            alive: AtomicBool::new(true),
            shutdown: Notify::new(),
            config,
        });

        // Writer: drain the outbound queue into the transport.
        let writer = Arc::clone(&inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = outbound_rx.recv() => match frame {
                        Some(frame) => {
                            if let Err(e) = sink.send(frame).await {
                                debug!("Writer stopping: {}", e);
                                break;
                            }
                        }
                        None => break,
                    },
                    () = writer.shutdown.notified() => break,
                }
            }
            let _ = sink.close().await;
        });

        // Reader: route inbound frames; presence callbacks run here.
        let reader = Arc::clone(&inner);
        tokio::spawn(async move {
            loop {
                match stream.recv().await {
                    Ok(Some(frame)) => reader.handle_frame(frame),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Receive error: {}", e);
                        break;
                    }
                }
            }
            reader.connection_lost();
        });

        if heartbeat > 0 {
            let hb = Arc::clone(&inner);
            let period = Duration::from_millis(u64::from(heartbeat));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if !hb.alive.load(Ordering::Acquire) {
                        break;
                    }
                    if hb.outbound.send(Frame::ping(Some(now_millis()))).is_err() {
                        break;
                    }
                }
            });
        }

        Ok(Self { inner })
    }

    /// Server-assigned connection identifier.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.inner.connection_id
    }

    /// Whether the connection is still up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Close the connection.
    ///
    /// The transport is shut down gracefully; the server drops this
    /// connection's presence from every channel, and peers observe the
    /// resulting leaves. Subscribed channels fall back to `Disconnected`.
    pub fn close(&self) {
        self.inner.connection_lost();
        // notify_one stores a permit, so the writer sees the shutdown even
        // if it is mid-send rather than parked in the select.
        self.inner.shutdown.notify_one();
    }

    /// Get a handle to a channel. Handles for the same channel name share
    /// state; the view and handlers survive across handle clones.
    #[must_use]
    pub fn channel(&self, name: impl Into<String>, config: ChannelConfig) -> ChannelHandle {
        let name = name.into();
        let shared = {
            let mut channels = self.inner.channels.lock().unwrap();
            Arc::clone(
                channels
                    .entry(name.clone())
                    .or_insert_with(|| Arc::new(ChannelShared::new(name.clone()))),
            )
        };
        ChannelHandle::new(shared, Arc::clone(&self.inner), config)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
