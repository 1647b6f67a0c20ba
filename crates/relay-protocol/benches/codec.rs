//! Codec benchmarks for flowrelay-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use flowrelay_protocol::{codec, Message, MAX_CONTENT_LENGTH};

fn bench_encode(c: &mut Criterion) {
    let message = Message::chat("alice", "x".repeat(64)).unwrap();

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(1));
    group.bench_function("chat_64", |b| b.iter(|| codec::encode(black_box(&message))));
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let message = Message::task("x".repeat(MAX_CONTENT_LENGTH)).unwrap();
    let encoded = codec::encode(&message).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("task_max", |b| {
        b.iter(|| codec::decode(black_box(&encoded)))
    });
    group.finish();
}

fn bench_roundtrip(c: &mut Criterion) {
    let message = Message::notification("x".repeat(256)).unwrap();

    c.bench_function("roundtrip_256", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&message)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_roundtrip);
criterion_main!(benches);
