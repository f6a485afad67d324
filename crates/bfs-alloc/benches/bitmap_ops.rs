//! Benchmark: bitmap scans used by the block allocator.
//!
//! A mostly-full group bitmap (about 5% free, in 32-bit clusters) is the
//! expensive case: every free range has to be found by walking bytes.

use bfs_alloc::{
    bitmap_best_fit, bitmap_count_free, bitmap_find_contiguous, bitmap_find_free, free_ranges,
};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

const BITS: u32 = 65_536;

fn make_bitmap() -> Vec<u8> {
    let mut bm = vec![0xFF_u8; (BITS / 8) as usize];
    let mut pos = 100_usize;
    let mut width = 8_usize;
    while pos + width < BITS as usize {
        for i in pos..pos + width {
            bm[i / 8] &= !(1 << (i % 8));
        }
        pos += 650;
        width = if width >= 48 { 8 } else { width + 8 };
    }
    bm
}

fn bench_scans(c: &mut Criterion) {
    let bm = make_bitmap();
    let mut group = c.benchmark_group("bitmap_scan");

    group.bench_function("count_free", |b| {
        b.iter(|| black_box(bitmap_count_free(black_box(&bm), BITS)));
    });
    group.bench_function("find_free_from_middle", |b| {
        b.iter(|| black_box(bitmap_find_free(black_box(&bm), BITS, BITS / 2)));
    });
    group.bench_function("free_ranges", |b| {
        b.iter(|| black_box(free_ranges(black_box(&bm), BITS)));
    });

    group.finish();
}

fn bench_placement(c: &mut Criterion) {
    let bm = make_bitmap();
    let mut group = c.benchmark_group("bitmap_placement");

    group.bench_function("first_fit_40", |b| {
        b.iter(|| black_box(bitmap_find_contiguous(black_box(&bm), BITS, 40)));
    });
    group.bench_function("best_fit_40", |b| {
        b.iter(|| black_box(bitmap_best_fit(black_box(&bm), BITS, 40, 0)));
    });
    group.bench_function("best_fit_hinted", |b| {
        b.iter(|| black_box(bitmap_best_fit(black_box(&bm), BITS, 8, 100)));
    });

    group.finish();
}

criterion_group!(benches, bench_scans, bench_placement);
criterion_main!(benches);
