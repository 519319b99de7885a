//! 패킷 인코딩/디코딩 벤치마크

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use rft::packet::{self, PacketKind};
use rft::{Packet, MAX_PAYLOAD_SIZE};

fn bench_encode(c: &mut Criterion) {
    let payload = vec![0xA5u8; MAX_PAYLOAD_SIZE];
    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(payload.len() as u64));

    group.bench_function("data_full", |b| {
        b.iter(|| packet::encode(PacketKind::Data, black_box(42), black_box(7), &payload))
    });
    group.bench_function("ack", |b| {
        b.iter(|| Packet::ack(black_box(42), black_box(7)).encode())
    });
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let full = Packet::data(42, 7, vec![0xA5u8; MAX_PAYLOAD_SIZE]).encode();
    let mut corrupted = full.to_vec();
    corrupted[500] ^= 0x10;

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(full.len() as u64));

    group.bench_function("data_full", |b| b.iter(|| Packet::decode(black_box(&full))));
    group.bench_function("checksum_mismatch", |b| {
        b.iter(|| Packet::decode(black_box(&corrupted)))
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
