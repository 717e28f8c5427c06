//! Benchmarks for the frame codec and command codec
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use vesc_link::config::FramingConfig;
use vesc_link::protocol::commands::encode_values;
use vesc_link::protocol::{crc16, Checksum, FrameCodec, Request, Response};
use vesc_link::types::McValues;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn codec(checksum: Checksum) -> FrameCodec {
    FrameCodec::new(&FramingConfig {
        checksum,
        ..FramingConfig::default()
    })
}

fn bench_checksum(c: &mut Criterion) {
    let mut group = c.benchmark_group("checksum");

    for size in [64, 512, 4096].iter() {
        let data = payload(*size);
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("crc16", size), &data, |b, data| {
            b.iter(|| black_box(crc16(black_box(data))))
        });
        group.bench_with_input(BenchmarkId::new("crc32c", size), &data, |b, data| {
            b.iter(|| black_box(Checksum::Crc32c.compute(black_box(data))))
        });
    }

    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    // one size per length prefix width
    for size in [200, 4096, 70_000].iter() {
        let data = payload(*size);
        let mut codec = codec(Checksum::Crc16);
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("encode", size), &data, |b, data| {
            b.iter(|| black_box(codec.encode(black_box(data))))
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for size in [200, 4096].iter() {
        let frame = codec(Checksum::Crc16).encode(&payload(*size)).unwrap();
        group.throughput(Throughput::Bytes(frame.len() as u64));

        group.bench_with_input(BenchmarkId::new("whole", size), &frame, |b, frame| {
            let mut codec = codec(Checksum::Crc16);
            b.iter(|| black_box(codec.feed(black_box(frame))))
        });

        // serial ports often deliver a few bytes per read
        group.bench_with_input(BenchmarkId::new("split_16", size), &frame, |b, frame| {
            let mut codec = codec(Checksum::Crc16);
            b.iter(|| {
                for part in frame.chunks(16) {
                    black_box(codec.feed(black_box(part)).ok());
                }
            })
        });
    }

    // garbage before each frame forces resynchronization
    let frame = codec(Checksum::Crc16).encode(&payload(200)).unwrap();
    let mut noisy = vec![0x02, 0x00, 0xFF, 0x55, 0x10, 0xAA];
    noisy.extend_from_slice(&frame);
    group.bench_function("resync_200", |b| {
        let mut codec = codec(Checksum::Crc16);
        b.iter(|| {
            black_box(codec.feed(black_box(&noisy)).ok());
            codec.reset();
        })
    });

    group.finish();
}

fn bench_commands(c: &mut Criterion) {
    let mut group = c.benchmark_group("commands");

    let values = encode_values(&McValues {
        v_in: 48.2,
        rpm: 1200.0,
        ..McValues::default()
    });
    group.bench_function("decode_values", |b| {
        b.iter(|| black_box(Response::decode(black_box(&values))))
    });

    let write = Request::WriteNewAppData {
        offset: 6,
        data: payload(200),
    };
    group.bench_function("encode_write", |b| b.iter(|| black_box(write.encode())));

    group.finish();
}

criterion_group!(
    benches,
    bench_checksum,
    bench_encode,
    bench_decode,
    bench_commands
);
criterion_main!(benches);
