//! Codec benchmarks for beacon-protocol.

use beacon_protocol::{codec, ChannelView, Frame, PresenceEntry, StateMap};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;

fn sample_state(i: usize) -> StateMap {
    let mut state = StateMap::new();
    state.insert("user".into(), json!(format!("user-{i}")));
    state.insert("status".into(), json!("online"));
    state
}

fn bench_encode_track(c: &mut Criterion) {
    let frame = Frame::track(1, "room:lobby", sample_state(0));
    let encoded = codec::encode(&frame).unwrap();

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("track", |b| b.iter(|| codec::encode(black_box(&frame))));
    group.finish();
}

fn bench_decode_track(c: &mut Criterion) {
    let frame = Frame::track(1, "room:lobby", sample_state(0));
    let encoded = codec::encode(&frame).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("track", |b| b.iter(|| codec::decode(black_box(&encoded))));
    group.finish();
}

fn bench_sync_100_entries(c: &mut Criterion) {
    let mut view = ChannelView::new();
    for i in 0..100 {
        view.insert(PresenceEntry::new(
            format!("user:{i}"),
            format!("conn-{i}"),
            sample_state(i),
            i as u64 + 1,
        ));
    }
    let frame = Frame::sync("room:lobby", 100, "user:0", view);

    c.bench_function("roundtrip_sync_100", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&frame)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_track,
    bench_decode_track,
    bench_sync_100_entries
);
criterion_main!(benches);
