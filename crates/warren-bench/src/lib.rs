//! Shared helpers for Warren benchmarks.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use warren_registry::Registry;

/// Benchmark-sized position component.
#[derive(Clone, Copy, Debug, Default)]
pub struct BenchPos {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Benchmark-sized velocity component.
#[derive(Clone, Copy, Debug, Default)]
pub struct BenchVel {
    pub dx: f32,
    pub dy: f32,
    pub dz: f32,
}

/// Build a registry with `n` entities carrying positions, and velocities
/// on every other entity.
pub fn populated_registry(n: u32) -> Registry {
    let registry = Registry::new();
    for i in 0..n {
        let e = registry.take_entity();
        registry.add_component(
            e,
            BenchPos {
                x: i as f32,
                ..Default::default()
            },
        );
        if i % 2 == 0 {
            registry.add_component(e, BenchVel::default());
        }
    }
    registry
}
