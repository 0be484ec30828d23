//! The sort arena: one contiguous, page-granular buffer holding every array
//! the counting sort touches. Region offsets are computed exactly once at
//! init and never change for the worker's lifetime.
//!
//! In shared-memory mode the coordinator reads the sorted-index region
//! directly out of the same arena the worker writes. There is no lock; the
//! coordinator's at-most-one-sort-in-flight rule is the synchronization
//! discipline, and the channel hand-off orders the accesses.

use std::cell::UnsafeCell;

use crate::error::SortError;
use crate::keys::SceneKind;

/// Allocation granularity, matching a wasm linear-memory page.
pub const MEMORY_PAGE_BYTES: usize = 64 * 1024;

/// Hard allocation ceiling; an init that would exceed it fails fatally.
pub const MAX_ARENA_BYTES: usize = 2 * 1024 * 1024 * 1024;

/// Upper bound on per-scene transforms in dynamic mode.
pub const MAX_SCENES: usize = 32;

const WORD_BYTES: usize = 4;
const MAT4_BYTES: usize = 16 * WORD_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub offset: usize,
    pub bytes: usize,
}

impl Region {
    pub fn words(&self) -> usize {
        self.bytes / WORD_BYTES
    }

    pub fn end(&self) -> usize {
        self.offset + self.bytes
    }

    fn word_offset(&self) -> usize {
        self.offset / WORD_BYTES
    }
}

/// Byte offsets and sizes of every arena region, in allocation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaLayout {
    pub splat_count: u32,
    pub kind: SceneKind,
    pub distance_map_range: u32,
    pub indexes_to_sort: Region,
    pub centers: Region,
    pub model_view_proj: Region,
    pub mapped_distances: Region,
    pub histogram: Region,
    pub sorted_indexes: Region,
    pub scene_indexes: Region,
    pub transforms: Region,
    pub total_bytes: usize,
}

impl ArenaLayout {
    pub fn compute(
        splat_count: u32,
        kind: SceneKind,
        distance_map_range: u32,
    ) -> Result<Self, SortError> {
        if distance_map_range == 0 || !distance_map_range.is_power_of_two() {
            return Err(SortError::InvalidDistanceMapRange {
                value: distance_map_range,
            });
        }

        let n = splat_count as usize;
        let index_bytes = sized(n, WORD_BYTES, "splat indexes")?;
        let center_bytes = sized(n, kind.bytes_per_splat(), "centers")?;
        let histogram_bytes = sized(distance_map_range as usize, WORD_BYTES, "histogram")?;
        let (scene_index_bytes, transform_bytes) = match kind {
            SceneKind::Static => (0, 0),
            SceneKind::Dynamic => (index_bytes, MAX_SCENES * MAT4_BYTES),
        };

        let mut cursor = 0usize;
        let mut take = |bytes: usize, region: &'static str| -> Result<Region, SortError> {
            let offset = cursor;
            cursor = cursor
                .checked_add(bytes)
                .ok_or(SortError::ArenaSizeOverflow { region })?;
            Ok(Region { offset, bytes })
        };

        let indexes_to_sort = take(index_bytes, "indexes to sort")?;
        let centers = take(center_bytes, "centers")?;
        let model_view_proj = take(MAT4_BYTES, "model-view-projection")?;
        let mapped_distances = take(index_bytes, "mapped distances")?;
        let histogram = take(histogram_bytes, "histogram")?;
        let sorted_indexes = take(index_bytes, "sorted indexes")?;
        let scene_indexes = take(scene_index_bytes, "scene indexes")?;
        let transforms = take(transform_bytes, "scene transforms")?;

        // Round up to whole pages, then one extra page of margin.
        let pages = cursor.div_ceil(MEMORY_PAGE_BYTES) + 1;
        let total_bytes = pages
            .checked_mul(MEMORY_PAGE_BYTES)
            .ok_or(SortError::ArenaSizeOverflow { region: "total" })?;
        if total_bytes > MAX_ARENA_BYTES {
            return Err(SortError::ArenaExceedsCeiling {
                requested_bytes: total_bytes,
                ceiling_bytes: MAX_ARENA_BYTES,
            });
        }

        Ok(Self {
            splat_count,
            kind,
            distance_map_range,
            indexes_to_sort,
            centers,
            model_view_proj,
            mapped_distances,
            histogram,
            sorted_indexes,
            scene_indexes,
            transforms,
            total_bytes,
        })
    }
}

fn sized(count: usize, entry_bytes: usize, region: &'static str) -> Result<usize, SortError> {
    count
        .checked_mul(entry_bytes)
        .ok_or(SortError::ArenaSizeOverflow { region })
}

/// Mutable typed views over every region at once, in layout order.
pub(crate) struct ArenaViews<'a> {
    pub indexes_to_sort: &'a mut [u32],
    pub centers: &'a mut [u32],
    pub model_view_proj: &'a mut [f32],
    pub mapped_distances: &'a mut [i32],
    pub histogram: &'a mut [u32],
    pub sorted_indexes: &'a mut [u32],
    pub scene_indexes: &'a mut [u32],
    pub transforms: &'a mut [f32],
}

pub struct SortArena {
    words: UnsafeCell<Box<[u32]>>,
    layout: ArenaLayout,
}

// The worker writes the arena, and in shared mode the coordinator reads the
// sorted-index region; accesses never overlap in time (single sort in
// flight) and are ordered by the channel messages between the contexts.
unsafe impl Send for SortArena {}
unsafe impl Sync for SortArena {}

impl SortArena {
    pub fn allocate(layout: ArenaLayout) -> Self {
        let words = vec![0u32; layout.total_bytes / WORD_BYTES].into_boxed_slice();
        Self {
            words: UnsafeCell::new(words),
            layout,
        }
    }

    pub fn layout(&self) -> &ArenaLayout {
        &self.layout
    }

    /// Split the arena into per-region mutable views.
    ///
    /// Caller must be the only context touching the arena until the views
    /// are dropped; the coordinator's single-in-flight rule guarantees it.
    pub(crate) unsafe fn views(&self) -> ArenaViews<'_> {
        let words: &mut [u32] = &mut *self.words.get();
        let layout = &self.layout;

        let (indexes_to_sort, rest) = words.split_at_mut(layout.indexes_to_sort.words());
        let (centers, rest) = rest.split_at_mut(layout.centers.words());
        let (model_view_proj, rest) = rest.split_at_mut(layout.model_view_proj.words());
        let (mapped_distances, rest) = rest.split_at_mut(layout.mapped_distances.words());
        let (histogram, rest) = rest.split_at_mut(layout.histogram.words());
        let (sorted_indexes, rest) = rest.split_at_mut(layout.sorted_indexes.words());
        let (scene_indexes, rest) = rest.split_at_mut(layout.scene_indexes.words());
        let (transforms, _margin) = rest.split_at_mut(layout.transforms.words());

        ArenaViews {
            indexes_to_sort,
            centers,
            model_view_proj: bytemuck::cast_slice_mut(model_view_proj),
            mapped_distances: bytemuck::cast_slice_mut(mapped_distances),
            histogram,
            sorted_indexes,
            scene_indexes,
            transforms: bytemuck::cast_slice_mut(transforms),
        }
    }

    /// Read the leading `count` sorted indexes (shared-memory mode).
    ///
    /// Caller must ensure no sort is in flight.
    pub(crate) unsafe fn sorted_slice(&self, count: usize) -> &[u32] {
        let words: &[u32] = &*self.words.get();
        let region = self.layout.sorted_indexes;
        let start = region.word_offset();
        &words[start..start + count.min(region.words())]
    }
}
