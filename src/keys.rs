//! Depth-key buffers: the per-splat data the counting sort derives its
//! ordering keys from.
//!
//! Loaders hand the engine an opaque little-endian byte buffer plus a
//! [`SceneKind`] telling the kernel how to evaluate it. Static scenes carry
//! four quantized integers per splat; dynamic scenes carry the coefficients
//! of a cubic motion polynomial plus a temporal center.

/// Fixed factor world positions are scaled by before rounding to integers.
/// Quantizing once at load time gives the static sort a deterministic
/// integer ordering independent of per-frame float math.
pub const POSITION_SCALE: f32 = 1000.0;

/// Scale applied to projected dynamic depths before the integer cast, so
/// sub-unit depth differences survive quantization.
pub const DYNAMIC_DEPTH_SCALE: f32 = 4096.0;

/// Static entry: quantized `(x, y, z, scale)`.
pub const STATIC_INTS_PER_SPLAT: usize = 4;

/// Dynamic entry: `[p0 | c1 | c2 | c3 | temporal_center]`.
pub const DYNAMIC_FLOATS_PER_SPLAT: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneKind {
    Static,
    Dynamic,
}

impl SceneKind {
    pub fn bytes_per_splat(self) -> usize {
        match self {
            Self::Static => STATIC_INTS_PER_SPLAT * 4,
            Self::Dynamic => DYNAMIC_FLOATS_PER_SPLAT * 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Dynamic => "dynamic",
        }
    }
}

/// Motion description for one splat of a time-varying scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DynamicSplatKey {
    pub position: [f32; 3],
    pub c1: [f32; 3],
    pub c2: [f32; 3],
    pub c3: [f32; 3],
    pub temporal_center: f32,
}

/// Per-splat scene indirection for dynamic scenes: which sub-scene each
/// splat belongs to, plus one 4x4 transform per sub-scene.
#[derive(Debug, Clone, Default)]
pub struct ScenePayload {
    pub scene_indexes: Vec<u32>,
    pub transforms: Vec<[f32; 16]>,
}

pub fn quantize_position(v: f32) -> i32 {
    (v * POSITION_SCALE).round() as i32
}

/// Pack world positions into the opaque static key buffer a loader would
/// produce: little-endian `i32` quads of `(x, y, z, scale) * 1000`.
pub fn pack_static_keys(positions: &[[f32; 3]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(positions.len() * SceneKind::Static.bytes_per_splat());
    for pos in positions {
        for &coord in pos {
            out.extend_from_slice(&quantize_position(coord).to_le_bytes());
        }
        out.extend_from_slice(&(POSITION_SCALE as i32).to_le_bytes());
    }
    out
}

/// Pack motion keys into the opaque dynamic key buffer: 13 little-endian
/// `f32` per splat, `[p0 | c1 | c2 | c3 | temporal_center]`.
pub fn pack_dynamic_keys(keys: &[DynamicSplatKey]) -> Vec<u8> {
    let mut out = Vec::with_capacity(keys.len() * SceneKind::Dynamic.bytes_per_splat());
    for key in keys {
        for group in [&key.position, &key.c1, &key.c2, &key.c3] {
            for &coord in group {
                out.extend_from_slice(&coord.to_le_bytes());
            }
        }
        out.extend_from_slice(&key.temporal_center.to_le_bytes());
    }
    out
}

/// Evaluate one dynamic entry's position at `timestamp`.
///
/// `entry` is a [`DYNAMIC_FLOATS_PER_SPLAT`]-float slice. The polynomial is
/// evaluated in Horner form: `p0 + (c1 + (c2 + c3*dt)*dt)*dt`.
pub fn evaluate_motion(entry: &[f32], timestamp: f32) -> [f32; 3] {
    let dt = timestamp - entry[12];
    let mut out = [0.0f32; 3];
    for axis in 0..3 {
        let p0 = entry[axis];
        let c1 = entry[3 + axis];
        let c2 = entry[6 + axis];
        let c3 = entry[9 + axis];
        out[axis] = p0 + (c1 + (c2 + c3 * dt) * dt) * dt;
    }
    out
}
