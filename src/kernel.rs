//! The counting-sort kernel: derive an integer depth per splat, bin into
//! `distance_map_range` buckets, prefix-sum, scatter. O(n + k) per call.
//!
//! The static path is all-integer (quantized positions against a quantized
//! depth row) so an unchanged scene re-sorts to an identical order with no
//! float drift. The dynamic path evaluates each splat's motion polynomial
//! at the requested timestamp and projects in f32.

use rayon::prelude::*;

use crate::keys::{
    self, DYNAMIC_DEPTH_SCALE, DYNAMIC_FLOATS_PER_SPLAT, POSITION_SCALE, STATIC_INTS_PER_SPLAT,
};

/// Key-evaluation strategy, fixed at init; never re-checked per splat.
#[derive(Debug, Clone, Copy)]
pub enum DepthKeys<'a> {
    /// Quantized `(x, y, z, scale)` integers, four per splat.
    Static(&'a [i32]),
    /// Motion polynomial coefficients, thirteen floats per splat.
    Dynamic(&'a [f32]),
}

#[derive(Debug, Clone, Copy)]
pub struct SortParams {
    pub distance_map_range: u32,
    /// How many trailing indexes to actually sort.
    pub sort_count: u32,
    /// Total indexes produced; the leading `render_count - sort_count`
    /// pass through unchanged.
    pub render_count: u32,
    pub timestamp: f32,
}

/// Run one full sort. `histogram` must arrive zeroed; `sorted_indexes` is
/// left holding a back-to-front (farthest first) ordering of the trailing
/// `sort_count` entries of `indexes_to_sort`.
pub fn sort_splat_indexes(
    depth_keys: DepthKeys<'_>,
    indexes_to_sort: &[u32],
    model_view_proj: &[f32],
    mapped_distances: &mut [i32],
    histogram: &mut [u32],
    sorted_indexes: &mut [u32],
    params: SortParams,
) {
    let render_count = params.render_count as usize;
    let sort_count = (params.sort_count as usize).min(render_count);
    let sort_start = render_count - sort_count;

    sorted_indexes[..sort_start].copy_from_slice(&indexes_to_sort[..sort_start]);
    if sort_count == 0 {
        return;
    }

    let tail_indexes = &indexes_to_sort[sort_start..render_count];
    let tail_mapped = &mut mapped_distances[sort_start..render_count];

    let (min, max) = derive_mapped_distances(
        depth_keys,
        tail_indexes,
        model_view_proj,
        params.timestamp,
        tail_mapped,
    );
    bin_distances(tail_mapped, histogram, min, max, params.distance_map_range);
    prefix_sum_in_place(histogram);
    debug_assert_eq!(
        histogram.last().copied().unwrap_or(0) as usize,
        sort_count,
        "histogram must account for every binned splat"
    );
    scatter(
        tail_indexes,
        tail_mapped,
        histogram,
        sorted_indexes,
        render_count,
    );
}

/// Per-splat depth derivation. Returns the (min, max) mapped distance.
fn derive_mapped_distances(
    depth_keys: DepthKeys<'_>,
    indexes: &[u32],
    model_view_proj: &[f32],
    timestamp: f32,
    mapped: &mut [i32],
) -> (i32, i32) {
    let minmax = |a: (i32, i32), b: (i32, i32)| (a.0.min(b.0), a.1.max(b.1));

    match depth_keys {
        DepthKeys::Static(centers) => {
            let row = [
                (model_view_proj[2] * POSITION_SCALE) as i64,
                (model_view_proj[6] * POSITION_SCALE) as i64,
                (model_view_proj[10] * POSITION_SCALE) as i64,
            ];
            mapped
                .par_iter_mut()
                .zip(indexes.par_iter())
                .fold(
                    || (i32::MAX, i32::MIN),
                    |acc, (slot, &index)| {
                        let base = index as usize * STATIC_INTS_PER_SPLAT;
                        let dot = row[0] * centers[base] as i64
                            + row[1] * centers[base + 1] as i64
                            + row[2] * centers[base + 2] as i64;
                        let distance = dot.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
                        *slot = distance;
                        minmax(acc, (distance, distance))
                    },
                )
                .reduce(|| (i32::MAX, i32::MIN), minmax)
        }
        DepthKeys::Dynamic(entries) => {
            let row = [model_view_proj[2], model_view_proj[6], model_view_proj[10]];
            mapped
                .par_iter_mut()
                .zip(indexes.par_iter())
                .fold(
                    || (i32::MAX, i32::MIN),
                    |acc, (slot, &index)| {
                        let base = index as usize * DYNAMIC_FLOATS_PER_SPLAT;
                        let entry = &entries[base..base + DYNAMIC_FLOATS_PER_SPLAT];
                        let position = keys::evaluate_motion(entry, timestamp);
                        let depth = row[0] * position[0]
                            + row[1] * position[1]
                            + row[2] * position[2];
                        // `as` saturates, keeping the bucket index in range
                        // even for wildly out-of-band depths.
                        let distance = (depth * DYNAMIC_DEPTH_SCALE) as i32;
                        *slot = distance;
                        minmax(acc, (distance, distance))
                    },
                )
                .reduce(|| (i32::MAX, i32::MIN), minmax)
        }
    }
}

/// Map raw distances into `[0, range)` buckets and count per bucket.
/// Overwrites each mapped distance with its bucket index.
fn bin_distances(mapped: &mut [i32], histogram: &mut [u32], min: i32, max: i32, range: u32) {
    let top = range - 1;
    let span = max as i64 - min as i64;
    let bucket_scale = if span > 0 { top as f32 / span as f32 } else { 0.0 };

    for slot in mapped.iter_mut() {
        let bucket = (((*slot as i64 - min as i64) as f32) * bucket_scale) as u32;
        let bucket = bucket.min(top);
        histogram[bucket as usize] += 1;
        *slot = bucket as i32;
    }
}

/// In-place inclusive prefix sum; afterwards `histogram[last]` equals the
/// number of splats binned.
fn prefix_sum_in_place(histogram: &mut [u32]) {
    let mut cumulative = 0u32;
    for slot in histogram.iter_mut() {
        cumulative += *slot;
        *slot = cumulative;
    }
}

/// Stable scatter, farthest bucket first: walking splats in input order,
/// each lands at `render_count - remaining(bucket)`, so higher buckets fill
/// earlier output positions and ties keep their input order.
fn scatter(
    indexes: &[u32],
    mapped: &[i32],
    histogram: &mut [u32],
    sorted_indexes: &mut [u32],
    render_count: usize,
) {
    for (&index, &bucket) in indexes.iter().zip(mapped.iter()) {
        let remaining = &mut histogram[bucket as usize];
        sorted_indexes[render_count - *remaining as usize] = index;
        *remaining -= 1;
    }
}
