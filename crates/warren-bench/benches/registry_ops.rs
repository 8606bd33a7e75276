//! Criterion micro-benchmarks for registry views and entity lifecycle.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use warren_bench::{populated_registry, BenchPos, BenchVel};
use warren_registry::Registry;

fn bench_view_each(c: &mut Criterion) {
    let registry = populated_registry(100_000);
    c.bench_function("view_each_pos_vel_100k", |b| {
        b.iter(|| {
            let mut sum = 0f32;
            registry
                .view::<(BenchPos, BenchVel)>()
                .each(|_, (pos, vel)| {
                    sum += pos.x + vel.dx;
                });
            black_box(sum)
        })
    });
}

fn bench_entity_lifecycle(c: &mut Criterion) {
    c.bench_function("take_add_destroy_1k", |b| {
        let registry = Registry::new();
        b.iter(|| {
            let ids: Vec<u32> = (0..1000)
                .map(|_| {
                    let e = registry.take_entity();
                    registry.add_component(e, BenchPos::default());
                    e
                })
                .collect();
            registry.destroy_entities(&ids);
            registry.update(true);
            black_box(registry.entity_count())
        })
    });
}

criterion_group!(benches, bench_view_each, bench_entity_lifecycle);
criterion_main!(benches);
