//! Benchmark tests for rewatch-core operations
//!
//! Run with: cargo bench -p rewatch-core

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use rewatch_core::manifest::{hls, ManifestDocument};
use rewatch_core::types::*;
use rewatch_core::QualityResolver;

// ============================================================================
// Helpers
// ============================================================================

fn wide_ladder(count: u64) -> Vec<QualityVariant> {
    (0..count)
        .map(|i| {
            QualityVariant::new(
                format!("q{}", i),
                10_000_000 - i * 100_000,
                Resolution::new(1920, 1080),
            )
        })
        .collect()
}

fn mixed_list(ladder: &[QualityVariant]) -> Vec<QualityPermission> {
    ladder
        .iter()
        .enumerate()
        .map(|(i, q)| {
            let status = match i % 3 {
                0 => PermissionStatus::Allow,
                1 => PermissionStatus::Deny,
                _ => PermissionStatus::RequireLogin,
            };
            QualityPermission::new(q.name.to_uppercase(), status)
        })
        .rev()
        .collect()
}

// ============================================================================
// Permission Resolution
// ============================================================================

fn bench_resolve_with_list(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve_with_list");
    let content = ContentRef::standalone("bench");

    for size in [4u64, 16, 64] {
        let ladder = wide_ladder(size);
        let list = mixed_list(&ladder);
        let resolver = QualityResolver::new(ladder);

        group.bench_with_input(BenchmarkId::from_parameter(size), &list, |b, list| {
            b.iter(|| resolver.resolve_with_list(black_box(&content), black_box(list.clone())))
        });
    }
    group.finish();
}

// ============================================================================
// Manifest Rendering
// ============================================================================

fn bench_render_manifest(c: &mut Criterion) {
    let ladder = default_ladder();

    c.bench_function("render_default_ladder", |b| {
        b.iter(|| {
            ManifestDocument::render(
                black_box("bench"),
                black_box(ladder.clone()),
                "https://cdn.example.com/videos",
                "m3u8",
            )
        })
    });
}

fn bench_read_master(c: &mut Criterion) {
    let document = ManifestDocument::render(
        "bench",
        wide_ladder(16),
        "https://cdn.example.com/videos",
        "m3u8",
    )
    .unwrap();

    c.bench_function("read_master_16_variants", |b| {
        b.iter(|| hls::read_master(black_box(&document.text)))
    });
}

criterion_group!(
    benches,
    bench_resolve_with_list,
    bench_render_manifest,
    bench_read_master,
);
criterion_main!(benches);
