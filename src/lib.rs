//! Depth-sort engine for 3D/4D Gaussian-splat rendering.
//!
//! On every meaningful camera or time change the engine recomputes a
//! back-to-front draw order for up to millions of splats with an O(n + k)
//! counting sort, run on a dedicated worker thread against a fixed-size,
//! page-granular memory arena. The coordinator on the caller's thread
//! decides whether a frame's camera delta warrants a re-sort, keeps at
//! most one sort in flight, and republishes the sorted index array to the
//! rendering layer.
//!
//! Loaders and renderers are external collaborators: a loader delivers a
//! [`coordinator::SceneDescriptor`] when a scene finishes parsing, the
//! renderer delivers one camera signal per frame via
//! [`coordinator::SortCoordinator::request_sort`] and consumes the
//! published order from
//! [`coordinator::SortCoordinator::sorted_indexes`].

pub mod arena;
pub mod coordinator;
pub mod demo;
pub mod error;
pub mod kernel;
pub mod keys;
pub mod math;
mod worker;

pub use coordinator::{
    EngineState, SceneDescriptor, SortCoordinator, SortEvent, SortRequestOutcome, SorterOptions,
};
pub use error::SortError;
pub use keys::{DynamicSplatKey, SceneKind, ScenePayload};
