//! End-to-end presence tests: real server on an ephemeral port, real
//! clients over WebSocket.

use beacon_client::{
    transport, ChannelConfig, Client, DeliveryStatus, EventKind, FrameSink, FrameStream,
    PresenceEvent, SyncState,
};
use beacon_protocol::{codes, Frame, StateMap, PROTOCOL_VERSION};
use beacon_server::{serve, AppState, Config};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

async fn start_server(config: Config) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(AppState::new(config));
    tokio::spawn(async move {
        let _ = serve(listener, state).await;
    });
    format!("ws://{addr}/ws")
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.metrics.enabled = false;
    config
}

async fn connect(url: &str) -> Client {
    let (sink, stream) = transport::websocket::connect(url).await.unwrap();
    Client::connect(sink, stream).await.unwrap()
}

fn user_state(user: &str) -> StateMap {
    let mut state = StateMap::new();
    state.insert("user".into(), json!(user));
    state
}

/// Forward join and leave events into a queue the test can await.
fn watch(room: &beacon_client::ChannelHandle) -> mpsc::UnboundedReceiver<PresenceEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    for kind in [EventKind::Join, EventKind::Leave] {
        let tx = tx.clone();
        room.on(kind, move |event| {
            let _ = tx.send(event.clone());
        });
    }
    rx
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<PresenceEvent>) -> PresenceEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for presence event")
        .expect("event channel closed")
}

#[tokio::test]
async fn track_and_untrack_propagate_between_clients() {
    let url = start_server(test_config()).await;

    let alice = connect(&url).await;
    let bob = connect(&url).await;
    assert_ne!(alice.connection_id(), bob.connection_id());

    let room_a = alice.channel("room:lobby", ChannelConfig::default());
    let room_b = bob.channel("room:lobby", ChannelConfig::default());

    let mut events = watch(&room_b);
    room_b.subscribe().await.unwrap();
    room_a.subscribe().await.unwrap();

    let alice_key = room_a.presence_key().unwrap();

    let status = room_a.track(user_state("alice")).await.unwrap();
    assert_eq!(status, DeliveryStatus::Ok);

    let PresenceEvent::Join { key, joined } = next_event(&mut events).await else {
        panic!("expected join");
    };
    assert_eq!(key, alice_key);
    assert_eq!(joined.len(), 1);
    assert_eq!(joined[0].state["user"], json!("alice"));
    assert!(room_b.presence_state().contains_key(&alice_key));

    let status = room_a.untrack().await.unwrap();
    assert_eq!(status, DeliveryStatus::Ok);

    let PresenceEvent::Leave { key, left } = next_event(&mut events).await else {
        panic!("expected leave");
    };
    assert_eq!(key, alice_key);
    assert_eq!(left.len(), 1);
    assert!(!room_b.presence_state().contains_key(&alice_key));
}

#[tokio::test]
async fn late_joiner_receives_full_state_in_sync() {
    let url = start_server(test_config()).await;

    let alice = connect(&url).await;
    let room_a = alice.channel("room:lobby", ChannelConfig::default());
    room_a.subscribe().await.unwrap();
    room_a.track(user_state("alice")).await.unwrap();
    let alice_key = room_a.presence_key().unwrap();

    // Bob joins after alice tracked; the initial sync carries her entry.
    let bob = connect(&url).await;
    let room_b = bob.channel("room:lobby", ChannelConfig::default());
    room_b.subscribe().await.unwrap();

    assert_eq!(room_b.sync_state(), SyncState::Synced);
    let view = room_b.presence_state();
    let entries = view.get(&alice_key).expect("alice present in sync");
    assert_eq!(entries[0].state["user"], json!("alice"));
}

#[tokio::test]
async fn closed_connection_leaves_every_channel() {
    let url = start_server(test_config()).await;

    let alice = connect(&url).await;
    let room_a = alice.channel("room:lobby", ChannelConfig::default());
    room_a.subscribe().await.unwrap();
    room_a.track(user_state("alice")).await.unwrap();
    let alice_key = room_a.presence_key().unwrap();

    let bob = connect(&url).await;
    let room_b = bob.channel("room:lobby", ChannelConfig::default());
    let mut events = watch(&room_b);
    room_b.subscribe().await.unwrap();
    assert!(room_b.presence_state().contains_key(&alice_key));

    alice.close();

    let PresenceEvent::Leave { key, .. } = next_event(&mut events).await else {
        panic!("expected leave");
    };
    assert_eq!(key, alice_key);
    assert!(!room_b.presence_state().contains_key(&alice_key));
}

#[tokio::test]
async fn shared_presence_key_entries_coexist() {
    let url = start_server(test_config()).await;

    let key_config = ChannelConfig {
        presence_key: Some("user-1".into()),
    };

    let alice = connect(&url).await;
    let room_a = alice.channel("room:lobby", key_config.clone());
    room_a.subscribe().await.unwrap();

    let bob = connect(&url).await;
    let room_b = bob.channel("room:lobby", key_config);
    let mut events = watch(&room_b);
    room_b.subscribe().await.unwrap();

    assert_eq!(room_a.presence_key().as_deref(), Some("user-1"));
    assert_eq!(room_b.presence_key().as_deref(), Some("user-1"));

    room_a.track(user_state("laptop")).await.unwrap();
    room_b.track(user_state("phone")).await.unwrap();

    // Two joins under the same key, one per device.
    for _ in 0..2 {
        let PresenceEvent::Join { key, .. } = next_event(&mut events).await else {
            panic!("expected join");
        };
        assert_eq!(key, "user-1");
    }

    let view = room_b.presence_state();
    assert_eq!(view.key_count(), 1);
    assert_eq!(view.get("user-1").unwrap().len(), 2);
}

#[tokio::test]
async fn oversized_state_is_rejected() {
    let mut config = test_config();
    config.limits.max_state_bytes = 64;
    let url = start_server(config).await;

    let alice = connect(&url).await;
    let room = alice.channel("room:lobby", ChannelConfig::default());
    room.subscribe().await.unwrap();

    let mut state = StateMap::new();
    state.insert("blob".into(), json!("x".repeat(256)));

    let status = room.track(state).await.unwrap();
    assert!(matches!(
        status,
        DeliveryStatus::Error { code, .. } if code == codes::TRACK_REJECTED
    ));
    // The rejected state never became the local tracked state.
    assert!(room.local_state().is_none());
    assert!(room.presence_state().is_empty());
}

#[tokio::test]
async fn silent_connection_is_pruned_within_heartbeat_window() {
    let mut config = test_config();
    config.heartbeat.interval_ms = 100;
    config.heartbeat.timeout_ms = 600;
    let url = start_server(config).await;

    // Bob's client pings on the advertised interval, so he stays live.
    let bob = connect(&url).await;
    let room_b = bob.channel("room:lobby", ChannelConfig::default());
    let mut events = watch(&room_b);
    room_b.subscribe().await.unwrap();

    // Alice speaks raw frames over her own socket and never pings.
    let (mut sink, mut stream) = transport::websocket::connect(&url).await.unwrap();
    sink.send(Frame::connect(PROTOCOL_VERSION.major, None))
        .await
        .unwrap();
    assert!(matches!(
        stream.recv().await.unwrap(),
        Some(Frame::Connected { .. })
    ));

    sink.send(Frame::subscribe(1, "room:lobby", None))
        .await
        .unwrap();
    assert!(matches!(stream.recv().await.unwrap(), Some(Frame::Ack { id: 1 })));
    assert!(matches!(stream.recv().await.unwrap(), Some(Frame::Sync { .. })));

    sink.send(Frame::track(2, "room:lobby", user_state("alice")))
        .await
        .unwrap();
    assert!(matches!(stream.recv().await.unwrap(), Some(Frame::Ack { id: 2 })));

    let PresenceEvent::Join { key, .. } = next_event(&mut events).await else {
        panic!("expected join");
    };

    // Alice goes silent. The sweeper must evict her and bob must see the
    // implicit leave within the heartbeat timeout window.
    let waited = Instant::now();
    let PresenceEvent::Leave { key: left, .. } = next_event(&mut events).await else {
        panic!("expected leave");
    };
    assert_eq!(left, key);
    assert!(waited.elapsed() < Duration::from_secs(2));
    assert!(!room_b.presence_state().contains_key(&key));
}

#[tokio::test]
async fn reserved_channel_names_are_refused() {
    let url = start_server(test_config()).await;

    let alice = connect(&url).await;
    let room = alice.channel("$internal", ChannelConfig::default());

    let err = room.subscribe().await.unwrap_err();
    assert!(matches!(
        err,
        beacon_client::ClientError::SubscribeFailed { code, .. }
            if code == codes::SUBSCRIBE_FAILED
    ));
}
