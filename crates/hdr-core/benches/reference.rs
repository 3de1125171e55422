//! Benchmarks for the reference tone-mapping operators.
//!
//! Run with: `cargo bench -p hdr-core`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hdr_core::tonemap::{self, GradDomParams, ReinhardGlobalParams, ReinhardLocalParams};
use hdr_core::{Image, ImageSize};

fn scene(size: u32) -> Image {
    let mut img = Image::new(size, size).unwrap();
    for y in 0..size {
        for x in 0..size {
            let v = ((x * 7 + y * 3) % 256) as u8;
            img.set(x, y, [v, v / 2, 255 - v, 255]);
        }
    }
    img
}

fn bench_operators(c: &mut Criterion) {
    let mut group = c.benchmark_group("reference");

    for size in [128u32, 512].iter() {
        let input = scene(*size);
        let dims = ImageSize::new(*size, *size).unwrap();
        let mut output = vec![0u8; dims.byte_len()];
        group.throughput(Throughput::Elements(dims.pixel_count() as u64));

        group.bench_with_input(BenchmarkId::new("hist_eq", size), &input, |b, img| {
            b.iter(|| tonemap::hist_eq(black_box(img.as_bytes()), &mut output, dims).unwrap())
        });

        let global = ReinhardGlobalParams::default();
        group.bench_with_input(BenchmarkId::new("reinhard_global", size), &input, |b, img| {
            b.iter(|| {
                tonemap::reinhard_global(black_box(img.as_bytes()), &mut output, dims, &global)
                    .unwrap()
            })
        });

        let local = ReinhardLocalParams::default();
        group.bench_with_input(BenchmarkId::new("reinhard_local", size), &input, |b, img| {
            b.iter(|| {
                tonemap::reinhard_local(black_box(img.as_bytes()), &mut output, dims, &local)
                    .unwrap()
            })
        });
    }

    // The Poisson solve dominates; keep the image small.
    let input = scene(96);
    let dims = input.size();
    let mut output = vec![0u8; dims.byte_len()];
    let params = GradDomParams::default();
    group.bench_function("grad_dom/96", |b| {
        b.iter(|| tonemap::grad_dom(black_box(input.as_bytes()), &mut output, dims, &params).unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_operators);
criterion_main!(benches);
