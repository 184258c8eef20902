//! Benchmarks for the synchronous parts of a commit
//!
//! Everything here runs on the submission path or inside the worker between
//! hardware waits, so regressions show up directly as commit latency.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use shadowcommit::arbiter::{ChannelClaim, GlobalResourceMap};
use shadowcommit::bandwidth::{BandwidthEstimator, LinearEstimator, PanelTiming, WindowLoad};
use shadowcommit::buffer::BufferHandle;
use shadowcommit::config::DisplayConfig;
use shadowcommit::fence::FenceRegistry;
use shadowcommit::frame::{self, BufferWindow, FrameDesc, FrameLimits, Rect, WindowConfig};

fn claims(count: usize, offset: u32) -> Vec<ChannelClaim> {
    (0..count)
        .map(|window| ChannelClaim {
            window,
            channel: offset + window as u32,
        })
        .collect()
}

/// Bind, latch, and re-bind across pipelines
fn bench_arbiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("arbiter");

    for windows in [2usize, 6, 16].iter() {
        group.bench_function(format!("bind_commit_{}_windows", windows), |b| {
            b.iter_batched(
                || GlobalResourceMap::new(64),
                |mut map| {
                    for pipeline in 0..3u32 {
                        let _ = map.bind(pipeline, &claims(*windows, pipeline * 16));
                        black_box(map.commit_latched(pipeline));
                    }
                    map
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.bench_function("conflicting_bind", |b| {
        let mut map = GlobalResourceMap::new(64);
        let _ = map.bind(0, &claims(6, 0));
        map.commit_latched(0);
        b.iter(|| black_box(map.bind(1, &claims(6, 0)).is_err()));
    });

    group.finish();
}

fn bench_validation(c: &mut Criterion) {
    let config = DisplayConfig::default();
    let pipeline = &config.pipelines[0];
    let limits = FrameLimits {
        max_windows: pipeline.window_count,
        width: pipeline.width,
        height: pipeline.height,
        channels: &config.channels,
        writeback: false,
    };
    let desc = FrameDesc::new(
        (0..pipeline.window_count as u32)
            .map(|i| {
                WindowConfig::Buffer(BufferWindow::simple(
                    i,
                    Rect::new(i as i32 * 10, 0, 256, 256),
                    BufferHandle(i as u64 + 1),
                ))
            })
            .collect(),
    );

    c.bench_function("validate_full_frame", |b| {
        b.iter(|| frame::validate(black_box(&desc), &limits))
    });
}

fn bench_estimator(c: &mut Criterion) {
    let timing = PanelTiming {
        width: 1080,
        height: 2400,
        fps: 120,
    };
    let loads: Vec<WindowLoad> = (0..6)
        .map(|i| WindowLoad {
            channel: Some(i),
            src: Rect::new(0, 0, 1080, 2400),
            dst: Rect::new(0, 0, 540, 1200),
            bits_per_pixel: 32,
            compressed: i % 2 == 0,
            rotated: i == 3,
            write: false,
        })
        .collect();

    c.bench_function("linear_estimate_6_windows", |b| {
        b.iter(|| LinearEstimator.estimate(black_box(&loads), &timing))
    });
}

fn bench_fences(c: &mut Criterion) {
    let registry = FenceRegistry::new();
    c.bench_function("fence_create_signal", |b| {
        b.iter(|| {
            let (producer, fence) = registry.create("retire");
            producer.signal(Ok(()));
            black_box(fence.is_pending())
        })
    });
}

criterion_group!(benches, bench_arbiter, bench_validation, bench_estimator, bench_fences);
criterion_main!(benches);
