//! Connection handlers for the Beacon server.
//!
//! Each WebSocket connection runs its own task: handshake, frame loop,
//! and cleanup. Presence diffs arrive over the per-channel broadcast and
//! are merged into the frame loop through an mpsc queue, so everything a
//! connection sends goes through one writer.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use beacon_core::key::generate_connection_id;
use beacon_core::{PresenceUpdate, Registry, RegistryConfig, RegistryError};
use beacon_protocol::{codec, codes, Frame, Version, PROTOCOL_VERSION};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The presence registry.
    pub registry: Registry,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let registry_config = RegistryConfig {
            max_channels: config.limits.max_channels,
            max_subscriptions_per_connection: config.limits.max_subscriptions_per_connection,
            channel_capacity: 1024,
            auto_delete_empty_channels: true,
        };

        Self {
            registry: Registry::with_config(registry_config),
            config,
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Beacon server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, config.websocket_path);

    serve(listener, Arc::new(AppState::new(config))).await
}

/// Serve connections on an already-bound listener.
///
/// Split out from [`run_server`] so tests can bind an ephemeral port.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    // Sweep idle connections: their presence leaves every channel within
    // the heartbeat window even when the socket never closed cleanly.
    let sweeper_state = Arc::clone(&state);
    tokio::spawn(async move {
        let timeout = sweeper_state.config.heartbeat.timeout();
        // Tick at a quarter of the timeout so a silent connection is
        // detected no later than ~1.25x the configured window.
        let mut ticker = tokio::time::interval(timeout / 4);
        loop {
            ticker.tick().await;
            let pruned = sweeper_state.registry.prune_stale(timeout);
            if !pruned.is_empty() {
                info!(count = pruned.len(), "Pruned stale connections");
                let stats = sweeper_state.registry.stats();
                metrics::set_active_channels(stats.channel_count);
                metrics::set_presence_entries(stats.tracked_entries);
            }
        }
    });

    let ws_path = state.config.websocket_path.clone();
    let app = Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = generate_connection_id();
    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();
    let mut read_buffer = BytesMut::with_capacity(4096);

    // Handshake: the client speaks first with a Connect frame.
    match read_frame(&mut receiver, &mut read_buffer).await {
        Ok(Some(Frame::Connect { version, token })) => {
            let client = Version::new(version, 0);
            if !PROTOCOL_VERSION.is_compatible_with(&client) {
                let frame = Frame::error(
                    0,
                    codes::MALFORMED,
                    format!("unsupported protocol version {version}"),
                );
                let _ = send_frame(&mut sender, &frame).await;
                return;
            }
            // Tokens are carried opaquely; validation is out of scope here.
            debug!(connection = %connection_id, has_token = token.is_some(), "Handshake");
        }
        Ok(Some(frame)) => {
            warn!(connection = %connection_id, frame_type = ?frame.frame_type(), "Expected connect frame");
            let frame = Frame::error(0, codes::MALFORMED, "expected connect frame");
            let _ = send_frame(&mut sender, &frame).await;
            return;
        }
        Ok(None) | Err(_) => return,
    }

    let heartbeat_ms = u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX);
    let connected = Frame::connected(&connection_id, PROTOCOL_VERSION.major, heartbeat_ms);
    if send_frame(&mut sender, &connected).await.is_err() {
        error!(connection = %connection_id, "Failed to send Connected frame");
        return;
    }
    state.registry.touch(&connection_id);

    // Per-channel forward tasks, aborted on unsubscribe and disconnect.
    let mut forward_tasks: HashMap<String, tokio::task::JoinHandle<()>> = HashMap::new();

    // Updates from all subscribed channels merge into one queue.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ChannelEvent>();

    loop {
        tokio::select! {
            biased;

            Some(event) = event_rx.recv() => {
                let frame = match event {
                    ChannelEvent::Update(update) => Frame::diff(
                        update.channel.clone(),
                        update.version,
                        update.joins.clone(),
                        update.leaves.clone(),
                    ),
                    ChannelEvent::Resync { channel, presence_key } => {
                        match state.registry.snapshot(&channel) {
                            Some((version, view)) => {
                                Frame::sync(channel, version, presence_key, view)
                            }
                            // Channel deleted while the marker was queued.
                            None => continue,
                        }
                    }
                };
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        read_buffer.extend_from_slice(&data);

                        let mut reset = false;
                        loop {
                            let buffered = read_buffer.len();
                            match codec::decode_from(&mut read_buffer) {
                                Ok(Some(frame)) => {
                                    // Bytes consumed by this frame alone; a
                                    // message may carry several frames.
                                    metrics::record_frame(buffered - read_buffer.len(), "inbound");
                                    state.registry.touch(&connection_id);

                                    if let Err(e) = handle_frame(
                                        &frame,
                                        &connection_id,
                                        &state,
                                        &mut sender,
                                        &mut forward_tasks,
                                        &event_tx,
                                    ).await {
                                        error!(connection = %connection_id, error = %e, "Frame handling error");
                                        reset = true;
                                        break;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    // Undecodable input: the stream can no
                                    // longer be trusted, reset the connection.
                                    warn!(connection = %connection_id, error = %e, "Malformed frame");
                                    metrics::record_error("malformed");
                                    let frame = Frame::error(0, codes::MALFORMED, e.to_string());
                                    let _ = send_frame(&mut sender, &frame).await;
                                    reset = true;
                                    break;
                                }
                            }
                        }
                        if reset {
                            break;
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_) | Message::Text(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    for (_, handle) in forward_tasks {
        handle.abort();
    }

    // Implicit leave: peers in every channel observe the departure.
    state.registry.connection_lost(&connection_id);
    let stats = state.registry.stats();
    metrics::set_active_channels(stats.channel_count);
    metrics::set_presence_entries(stats.tracked_entries);

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// What a per-channel forward task feeds the connection's writer.
enum ChannelEvent {
    /// An incremental change to relay as a `Diff` frame.
    Update(Arc<PresenceUpdate>),
    /// The subscriber's queue overflowed and updates were lost; the
    /// connection must be sent fresh full state.
    Resync {
        channel: String,
        presence_key: String,
    },
}

/// Relay broadcast updates from one channel into the connection's queue.
///
/// A lagging subscriber has lost diffs it can never recover, so its local
/// replica would stay wrong until resubscribe. Instead of dropping the
/// updates silently, a resync marker is queued; the connection answers it
/// with a full `Sync` built from the current channel snapshot.
async fn forward_updates(
    mut rx: broadcast::Receiver<Arc<PresenceUpdate>>,
    tx: mpsc::UnboundedSender<ChannelEvent>,
    channel: String,
    presence_key: String,
) {
    loop {
        match rx.recv().await {
            Ok(update) => {
                if tx.send(ChannelEvent::Update(update)).is_err() {
                    break; // Connection task gone
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(channel = %channel, lagged = n, "Subscriber lagged, forcing full resync");
                metrics::record_error("subscriber_lagged");
                let resync = ChannelEvent::Resync {
                    channel: channel.clone(),
                    presence_key: presence_key.clone(),
                };
                if tx.send(resync).is_err() {
                    break;
                }
            }
        }
    }
}

/// Handle a decoded frame.
async fn handle_frame(
    frame: &Frame,
    connection_id: &str,
    state: &Arc<AppState>,
    sender: &mut SplitSink<WebSocket, Message>,
    forward_tasks: &mut HashMap<String, tokio::task::JoinHandle<()>>,
    event_tx: &mpsc::UnboundedSender<ChannelEvent>,
) -> Result<()> {
    match frame {
        Frame::Subscribe {
            id,
            channel,
            presence_key,
        } => {
            debug!(connection = %connection_id, channel = %channel, "Subscribe request");

            match state
                .registry
                .subscribe(connection_id, channel, presence_key.clone())
            {
                Ok(subscription) => {
                    let handle = tokio::spawn(forward_updates(
                        subscription.receiver,
                        event_tx.clone(),
                        channel.clone(),
                        subscription.presence_key.clone(),
                    ));
                    forward_tasks.insert(channel.clone(), handle);
                    metrics::record_subscription();
                    metrics::set_active_channels(state.registry.stats().channel_count);

                    // Ack first, then the full state. The snapshot was taken
                    // atomically with the receiver, so every later diff
                    // follows this sync without gaps.
                    send_frame(sender, &Frame::ack(*id)).await?;
                    let sync = Frame::sync(
                        channel.clone(),
                        subscription.version,
                        subscription.presence_key,
                        subscription.view,
                    );
                    send_frame(sender, &sync).await?;
                }
                Err(e) => {
                    warn!(connection = %connection_id, channel = %channel, error = %e, "Subscribe failed");
                    send_frame(sender, &Frame::error(*id, codes::SUBSCRIBE_FAILED, e.to_string()))
                        .await?;
                }
            }
        }

        Frame::Unsubscribe { id, channel } => {
            debug!(connection = %connection_id, channel = %channel, "Unsubscribe request");

            if let Some(handle) = forward_tasks.remove(channel) {
                handle.abort();
            }

            let response = match state.registry.unsubscribe(connection_id, channel) {
                Ok(()) => {
                    metrics::set_active_channels(state.registry.stats().channel_count);
                    Frame::ack(*id)
                }
                Err(e) => Frame::error(*id, codes::NOT_SUBSCRIBED, e.to_string()),
            };
            send_frame(sender, &response).await?;
        }

        Frame::Track { id, channel, state: payload } => {
            debug!(connection = %connection_id, channel = %channel, "Track");

            let size = serde_json::to_vec(payload).map(|v| v.len()).unwrap_or(0);
            let response = if size > state.config.limits.max_state_bytes {
                metrics::record_error("state_too_large");
                Frame::error(
                    *id,
                    codes::TRACK_REJECTED,
                    format!(
                        "state payload of {size} bytes exceeds limit of {} bytes",
                        state.config.limits.max_state_bytes
                    ),
                )
            } else {
                match state.registry.track(connection_id, channel, payload.clone()) {
                    Ok(_version) => {
                        metrics::set_presence_entries(state.registry.stats().tracked_entries);
                        Frame::ack(*id)
                    }
                    Err(e) => Frame::error(*id, error_code(&e), e.to_string()),
                }
            };
            send_frame(sender, &response).await?;
        }

        Frame::Untrack { id, channel } => {
            debug!(connection = %connection_id, channel = %channel, "Untrack");

            let response = match state.registry.untrack(connection_id, channel) {
                Ok(_version) => {
                    metrics::set_presence_entries(state.registry.stats().tracked_entries);
                    Frame::ack(*id)
                }
                Err(e) => Frame::error(*id, error_code(&e), e.to_string()),
            };
            send_frame(sender, &response).await?;
        }

        Frame::Ping { timestamp } => {
            send_frame(sender, &Frame::pong(*timestamp)).await?;
        }

        Frame::Pong { .. } => {
            // Liveness already refreshed in the read loop
        }

        Frame::Connect { version, token } => {
            debug!(
                connection = %connection_id,
                version = version,
                has_token = token.is_some(),
                "Connect frame (already connected)"
            );
        }

        _ => {
            warn!(connection = %connection_id, frame_type = ?frame.frame_type(), "Unexpected frame type");
        }
    }

    Ok(())
}

fn error_code(err: &RegistryError) -> u16 {
    match err {
        RegistryError::NotSubscribed(_) => codes::NOT_SUBSCRIBED,
        _ => codes::TRACK_REJECTED,
    }
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    metrics::record_frame(data.len(), "outbound");
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}

/// Read one frame off the socket, buffering partial input.
async fn read_frame(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    read_buffer: &mut BytesMut,
) -> Result<Option<Frame>> {
    loop {
        if let Some(frame) = codec::decode_from(read_buffer)? {
            return Ok(Some(frame));
        }
        match receiver.next().await {
            Some(Ok(Message::Binary(data))) => read_buffer.extend_from_slice(&data),
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}
