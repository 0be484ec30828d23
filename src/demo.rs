//! Synthetic scene generators for the demo binary and benchmarks.

use std::f32::consts::TAU;

use rand::{Rng, SeedableRng};

use crate::coordinator::SceneDescriptor;
use crate::keys::{pack_dynamic_keys, pack_static_keys, DynamicSplatKey, SceneKind, ScenePayload};

// Smaller radii so the whole knot fits the demo camera's orbit.
const KNOT_P: f32 = 2.0;
const KNOT_Q: f32 = 3.0;
const KNOT_MAJOR: f32 = 1.4;
const KNOT_MINOR: f32 = 0.38;

fn torus_knot_positions(count: usize, seed: u64) -> Vec<[f32; 3]> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut positions = Vec::with_capacity(count);

    for i in 0..count {
        let t = i as f32 / count.max(1) as f32 * TAU * 2.0;
        let base = [
            (KNOT_MAJOR + KNOT_MINOR * (KNOT_Q * t).cos()) * (KNOT_P * t).cos(),
            KNOT_MINOR * (KNOT_Q * t).sin(),
            (KNOT_MAJOR + KNOT_MINOR * (KNOT_Q * t).cos()) * (KNOT_P * t).sin(),
        ];
        positions.push([
            base[0] + rng.random_range(-0.04_f32..0.04_f32),
            base[1] + rng.random_range(-0.04_f32..0.04_f32),
            base[2] + rng.random_range(-0.04_f32..0.04_f32),
        ]);
    }

    positions
}

pub fn generate_static_scene(count: usize, seed: u64) -> SceneDescriptor {
    let positions = torus_knot_positions(count, seed);
    SceneDescriptor {
        splat_count: count as u32,
        kind: SceneKind::Static,
        depth_keys: pack_static_keys(&positions),
        aux: None,
    }
}

/// A time-varying scene: knot splats drifting along randomized directions
/// with a touch of curvature, temporal centers spread over one second.
pub fn generate_dynamic_scene(count: usize, seed: u64) -> SceneDescriptor {
    let positions = torus_knot_positions(count, seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed.wrapping_add(1));

    let keys: Vec<DynamicSplatKey> = positions
        .into_iter()
        .map(|position| DynamicSplatKey {
            position,
            c1: [
                rng.random_range(-0.5_f32..0.5_f32),
                rng.random_range(-0.5_f32..0.5_f32),
                rng.random_range(-0.5_f32..0.5_f32),
            ],
            c2: [
                rng.random_range(-0.1_f32..0.1_f32),
                rng.random_range(-0.1_f32..0.1_f32),
                rng.random_range(-0.1_f32..0.1_f32),
            ],
            c3: [0.0; 3],
            temporal_center: rng.random_range(0.0_f32..1.0_f32),
        })
        .collect();

    SceneDescriptor {
        splat_count: count as u32,
        kind: SceneKind::Dynamic,
        depth_keys: pack_dynamic_keys(&keys),
        aux: Some(ScenePayload {
            scene_indexes: vec![0u32; count],
            transforms: vec![identity_transform()],
        }),
    }
}

fn identity_transform() -> [f32; 16] {
    let mut m = [0.0f32; 16];
    m[0] = 1.0;
    m[5] = 1.0;
    m[10] = 1.0;
    m[15] = 1.0;
    m
}
