//! Benchmarks for the stream demultiplexer
//!
//! Measures the per-message cost of the capture loop's hot path:
//! - `frame.world` decode, size validation and BGR to RGB conversion at camera resolutions
//! - `pupil.*` decode and EMA update
//! - rejection of malformed frames

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use gazelink::Demultiplexer;
use gazelink::test_utils::{pupil_message, world_frame_message};
use std::hint::black_box;

const RESOLUTIONS: &[(u32, u32)] = &[(320, 240), (640, 480), (1280, 720), (1920, 1080)];

fn bench_world_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("world_frame");

    for &(width, height) in RESOLUTIONS {
        let len = (width * height * 3) as usize;
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let message = world_frame_message(width, height, &payload);

        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{width}x{height}")),
            &message,
            |b, message| {
                let mut demux = Demultiplexer::new(0.03);
                b.iter(|| black_box(demux.handle(black_box(message.clone()))))
            },
        );
    }

    group.finish();
}

fn bench_pupil_samples(c: &mut Criterion) {
    let message = pupil_message("pupil.0.2d", 0.42, 0.58);
    let mut demux = Demultiplexer::new(0.03);

    c.bench_function("pupil_sample", |b| {
        b.iter(|| black_box(demux.handle(black_box(message.clone()))))
    });
}

fn bench_rejected_frame(c: &mut Criterion) {
    // Declares 640x480 but carries 10 bytes
    let message = world_frame_message(640, 480, &[0u8; 10]);
    let mut demux = Demultiplexer::new(0.03);

    c.bench_function("rejected_frame", |b| {
        b.iter(|| black_box(demux.handle(black_box(message.clone()))))
    });
}

criterion_group!(benches, bench_world_frames, bench_pupil_samples, bench_rejected_frame);
criterion_main!(benches);
