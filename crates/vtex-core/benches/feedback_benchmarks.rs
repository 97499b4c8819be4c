//! Feedback Benchmarks
//!
//! Performance benchmarks for readback decoding, compaction and mip fallback expansion

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use glam::UVec2;
use vtex_core::feedback::{FeedbackHeader, compact_feedback, decode_feedback, encode_feedback};
use vtex_core::{GpuTileId, TextureId, TextureLayout, TileId, expand_mip_fallback, sort_and_dedup};

fn raw_feedback(count: u32) -> Vec<GpuTileId> {
    (0..count)
        .map(|i| GpuTileId::new(TextureId(i % 8), TileId::new(i % 32, (i / 32) % 32, 0)))
        .collect()
}

fn bench_decode(c: &mut Criterion) {
    let records = raw_feedback(2048);
    let mut buffer = vec![0u8; 2 * 1024 * 1024];
    encode_feedback(&FeedbackHeader::default(), &records, &mut buffer);

    c.bench_function("decode_feedback_2048", |b| {
        b.iter(|| black_box(decode_feedback(&buffer, 2048)));
    });
}

fn bench_compaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("compact_feedback");

    for count in [4096u32, 16384, 65536].iter() {
        let raw = raw_feedback(*count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &raw, |b, raw| {
            b.iter(|| black_box(compact_feedback(raw, 2048)));
        });
    }

    group.finish();
}

fn bench_expansion(c: &mut Criterion) {
    let layout = TextureLayout::new(UVec2::new(8192, 8192), 14, UVec2::new(256, 256));
    let mut requests = raw_feedback(2048);
    sort_and_dedup(&mut requests);

    c.bench_function("expand_mip_fallback_2048", |b| {
        b.iter(|| black_box(expand_mip_fallback(&requests, |_| Some(layout))));
    });
}

criterion_group!(benches, bench_decode, bench_compaction, bench_expansion);

criterion_main!(benches);
