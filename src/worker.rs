//! The sort worker host: an isolated thread that owns the kernel and the
//! arena, answering `init` and `sort` requests over a pair of channels and
//! reporting timing back to the coordinator.
//!
//! The worker never shares mutable state with the coordinator except
//! through the arena rules in `arena.rs`; everything else crosses the
//! boundary as an owned message.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::arena::{ArenaLayout, ArenaViews, SortArena, MAX_SCENES};
use crate::error::SortError;
use crate::kernel::{self, DepthKeys, SortParams};
use crate::keys::{SceneKind, ScenePayload};

pub(crate) struct InitConfig {
    pub splat_count: u32,
    pub kind: SceneKind,
    pub distance_map_range: u32,
    pub use_shared_memory: bool,
    pub depth_keys: Vec<u8>,
    pub aux: Option<ScenePayload>,
}

pub(crate) struct SortCommand {
    pub model_view_proj: [f32; 16],
    pub camera_position: [f32; 3],
    pub timestamp: f32,
    pub sort_count: u32,
    /// Non-shared mode: the output buffer, moved back from the coordinator.
    pub return_buffer: Option<Vec<u32>>,
}

pub(crate) enum WorkerRequest {
    Init(InitConfig),
    Sort(SortCommand),
}

pub(crate) enum WorkerResponse {
    InitDone {
        /// Shared-memory mode: the coordinator's handle onto the arena.
        shared_arena: Option<Arc<SortArena>>,
    },
    InitFailed {
        error: SortError,
    },
    SortDone {
        /// Non-shared mode: the filled output buffer, moved to the
        /// coordinator until the next sort call.
        sorted_indexes: Option<Vec<u32>>,
        sorted_count: u32,
        duration: Duration,
    },
}

pub(crate) fn spawn_sort_worker() -> (Sender<WorkerRequest>, Receiver<WorkerResponse>) {
    let (request_tx, request_rx) = mpsc::channel();
    let (response_tx, response_rx) = mpsc::channel();
    thread::spawn(move || worker_loop(request_rx, response_tx));
    (request_tx, response_rx)
}

fn worker_loop(requests: Receiver<WorkerRequest>, responses: Sender<WorkerResponse>) {
    let mut host: Option<WorkerHost> = None;
    while let Ok(request) = requests.recv() {
        let response = match request {
            WorkerRequest::Init(config) => match WorkerHost::initialize(config) {
                Ok(new_host) => {
                    let shared_arena = new_host.shared_handle();
                    host = Some(new_host);
                    WorkerResponse::InitDone { shared_arena }
                }
                Err(error) => {
                    host = None;
                    warn!("sort worker init failed: {error}");
                    WorkerResponse::InitFailed { error }
                }
            },
            WorkerRequest::Sort(command) => match host.as_mut() {
                Some(active) => active.run_sort(command),
                None => {
                    debug!("dropping sort request: worker has no initialized scene");
                    continue;
                }
            },
        };
        if responses.send(response).is_err() {
            break;
        }
    }
}

/// One instance per active scene; replaced wholesale on scene switch.
struct WorkerHost {
    arena: Arc<SortArena>,
    use_shared_memory: bool,
}

impl WorkerHost {
    fn initialize(config: InitConfig) -> Result<Self, SortError> {
        let layout =
            ArenaLayout::compute(config.splat_count, config.kind, config.distance_map_range)?;
        if config.depth_keys.len() != layout.centers.bytes {
            return Err(SortError::KeyBufferSizeMismatch {
                expected_bytes: layout.centers.bytes,
                actual_bytes: config.depth_keys.len(),
            });
        }
        if config.kind == SceneKind::Dynamic {
            if let Some(payload) = &config.aux {
                if payload.scene_indexes.len() != config.splat_count as usize {
                    return Err(SortError::SceneIndexCountMismatch {
                        expected: config.splat_count as usize,
                        actual: payload.scene_indexes.len(),
                    });
                }
                if payload.transforms.len() > MAX_SCENES {
                    return Err(SortError::TooManySceneTransforms {
                        count: payload.transforms.len(),
                        max: MAX_SCENES,
                    });
                }
            }
        }

        let arena = SortArena::allocate(layout);
        // Sole owner until the Arc is shared below, so the views are ours.
        let views = unsafe { arena.views() };
        write_initial_state(views, &config);

        info!(
            "sort worker initialized: {} {} splats, {} buckets, {} KiB arena",
            config.splat_count,
            config.kind.name(),
            config.distance_map_range,
            layout.total_bytes / 1024
        );

        Ok(Self {
            arena: Arc::new(arena),
            use_shared_memory: config.use_shared_memory,
        })
    }

    fn shared_handle(&self) -> Option<Arc<SortArena>> {
        self.use_shared_memory.then(|| Arc::clone(&self.arena))
    }

    fn run_sort(&mut self, command: SortCommand) -> WorkerResponse {
        let start = Instant::now();
        let layout = *self.arena.layout();
        let render_count = layout.splat_count;
        let sorted_count = command.sort_count.min(render_count);

        {
            // The coordinator keeps at most one sort in flight, so the
            // arena is ours for the duration of this call.
            let views = unsafe { self.arena.views() };
            let ArenaViews {
                indexes_to_sort,
                centers,
                model_view_proj,
                mapped_distances,
                histogram,
                sorted_indexes,
                ..
            } = views;

            model_view_proj.copy_from_slice(&command.model_view_proj);
            histogram.fill(0);

            let depth_keys = match layout.kind {
                SceneKind::Static => DepthKeys::Static(bytemuck::cast_slice(&*centers)),
                SceneKind::Dynamic => DepthKeys::Dynamic(bytemuck::cast_slice(&*centers)),
            };
            kernel::sort_splat_indexes(
                depth_keys,
                indexes_to_sort,
                model_view_proj,
                mapped_distances,
                histogram,
                sorted_indexes,
                SortParams {
                    distance_map_range: layout.distance_map_range,
                    sort_count: sorted_count,
                    render_count,
                    timestamp: command.timestamp,
                },
            );
        }

        let sorted_indexes = if self.use_shared_memory {
            None
        } else {
            let count = render_count as usize;
            let mut out = command
                .return_buffer
                .unwrap_or_else(|| vec![0u32; count]);
            if out.len() < count {
                out.resize(count, 0);
            }
            out[..count].copy_from_slice(unsafe { self.arena.sorted_slice(count) });
            Some(out)
        };

        let duration = start.elapsed();
        debug!(
            "sorted {}/{} splats at t={} (camera {:?}) in {:.2}ms",
            sorted_count,
            render_count,
            command.timestamp,
            command.camera_position,
            duration.as_secs_f64() * 1e3
        );

        WorkerResponse::SortDone {
            sorted_indexes,
            sorted_count,
            duration,
        }
    }
}

fn write_initial_state(views: ArenaViews<'_>, config: &InitConfig) {
    for (word, chunk) in views
        .centers
        .iter_mut()
        .zip(config.depth_keys.chunks_exact(4))
    {
        *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }

    for (i, slot) in views.indexes_to_sort.iter_mut().enumerate() {
        *slot = i as u32;
    }

    if config.kind == SceneKind::Dynamic {
        for (scene, transform) in views.transforms.chunks_exact_mut(16).enumerate() {
            match config.aux.as_ref().and_then(|p| p.transforms.get(scene)) {
                Some(provided) => transform.copy_from_slice(provided),
                None => {
                    transform[0] = 1.0;
                    transform[5] = 1.0;
                    transform[10] = 1.0;
                    transform[15] = 1.0;
                }
            }
        }
        if let Some(payload) = &config.aux {
            views
                .scene_indexes
                .copy_from_slice(&payload.scene_indexes);
        }
    }
}
