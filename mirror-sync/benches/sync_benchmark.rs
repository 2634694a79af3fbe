use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use mirror_core::Update;
use mirror_sync::client::evtsrc::EventDecoder;
use serde_json::value::RawValue;
use serde_json::{json, Value};

fn board(cards: usize) -> Arc<RawValue> {
    let cards: serde_json::Map<String, Value> = (0..cards)
        .map(|i| (format!("card-{i}"), json!({"title": format!("Card {i}"), "done": false})))
        .collect();
    let raw = serde_json::value::to_raw_value(&json!({"title": "Board", "cards": cards})).unwrap();
    Arc::from(raw)
}

fn bench_update_encode(c: &mut Criterion) {
    let snapshot = Update::snapshot(42, Some(board(100))).with_id("0f3a");
    let delta = Update::delta(43, Arc::from(RawValue::from_string(r#"{"cards":{"card-7":{"done":true}}}"#.into()).unwrap()));

    c.bench_function("snapshot_encode_100_cards", |b| {
        b.iter(|| black_box(snapshot.encode().unwrap()))
    });
    c.bench_function("delta_encode", |b| b.iter(|| black_box(delta.encode().unwrap())));

    let encoded = snapshot.encode().unwrap();
    c.bench_function("snapshot_decode_100_cards", |b| {
        b.iter(|| black_box(Update::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_event_stream_decode(c: &mut Criterion) {
    let mut wire = String::new();
    for version in 1..=1000u64 {
        wire.push_str("data: {\"ping\":true}\n\n");
        wire.push_str(&format!(
            "data: {{\"delta\":true,\"version\":{version},\"body\":{{\"n\":{version}}}}}\nid: {version}\n\n"
        ));
    }
    let bytes = wire.into_bytes();

    let mut group = c.benchmark_group("Event Stream");
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("decode_2k_events_4k_chunks", |b| {
        b.iter(|| {
            let mut decoder = EventDecoder::new();
            let mut events = 0;
            for chunk in bytes.chunks(4096) {
                events += decoder.feed(black_box(chunk)).len();
            }
            assert_eq!(events, 2000);
        })
    });
    group.finish();
}

criterion_group!(benches, bench_update_encode, bench_event_stream_decode);
criterion_main!(benches);
