//! The sort coordinator: the only component allowed to decide whether a
//! sort happens this frame. It shapes requests, enforces the
//! one-sort-in-flight rule, and republishes the sorted index array to the
//! rendering layer.
//!
//! `request_sort` never blocks. A request refused by a guard is dropped,
//! not queued; the next frame will ask again with fresher camera state.

use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::arena::SortArena;
use crate::error::SortError;
use crate::keys::{SceneKind, ScenePayload};
use crate::math::{Mat4, Vec3};
use crate::worker::{self, InitConfig, SortCommand, WorkerRequest, WorkerResponse};

/// Camera-delta hysteresis band: a re-sort is skipped while the view
/// direction dot product stays above this and the position delta stays
/// below [`POSITION_DELTA_THRESHOLD`]. Prevents full re-sorts on
/// sub-pixel camera jitter.
pub const ANGLE_DELTA_THRESHOLD: f32 = 0.995;
pub const POSITION_DELTA_THRESHOLD: f32 = 1.0;

pub const DEFAULT_DISTANCE_MAP_RANGE: u32 = 1 << 16;

#[derive(Debug, Clone, Copy)]
pub struct SorterOptions {
    /// Share one arena between both contexts (zero-copy) or ping-pong an
    /// owned output buffer per sort.
    pub shared_memory: bool,
    /// Counting-sort bucket count; power of two.
    pub distance_map_range: u32,
    /// Latency fallback: sort only this fraction of splats per call.
    /// `None` sorts the full set.
    pub sort_fraction: Option<f32>,
}

impl Default for SorterOptions {
    fn default() -> Self {
        Self {
            shared_memory: true,
            distance_map_range: DEFAULT_DISTANCE_MAP_RANGE,
            sort_fraction: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Ready,
    Sorting,
}

/// Why `request_sort` did or did not dispatch. The refusals are normal
/// control flow, expected every frame, and harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortRequestOutcome {
    Dispatched,
    NotInitialized,
    SortInFlight,
    AwaitingResultBuffer,
    WithinHysteresis,
}

#[derive(Debug)]
pub enum SortEvent {
    Ready,
    InitFailed(SortError),
    SortComplete {
        sorted_count: u32,
        duration: Duration,
    },
}

/// Scene-ready signal from a loader. The depth-key buffer's byte layout is
/// opaque beyond the static/dynamic distinction.
#[derive(Debug, Clone)]
pub struct SceneDescriptor {
    pub splat_count: u32,
    pub kind: SceneKind,
    pub depth_keys: Vec<u8>,
    pub aux: Option<ScenePayload>,
}

pub struct SortCoordinator {
    options: SorterOptions,
    requests: Option<Sender<WorkerRequest>>,
    responses: Option<Receiver<WorkerResponse>>,
    state: EngineState,
    splat_count: u32,
    force_next_sort: bool,
    last_view_dir: Vec3,
    last_camera_position: Vec3,
    pending_view_dir: Vec3,
    pending_camera_position: Vec3,
    /// Non-shared mode: `Some` while we hold the output buffer, `None`
    /// while it is away at the worker.
    return_buffer: Option<Vec<u32>>,
    shared_arena: Option<Arc<SortArena>>,
    published_count: Option<u32>,
    last_sort_duration: Option<Duration>,
}

impl SortCoordinator {
    pub fn new(options: SorterOptions) -> Self {
        Self {
            options,
            requests: None,
            responses: None,
            state: EngineState::Uninitialized,
            splat_count: 0,
            force_next_sort: false,
            last_view_dir: Vec3::ZERO,
            last_camera_position: Vec3::ZERO,
            pending_view_dir: Vec3::ZERO,
            pending_camera_position: Vec3::ZERO,
            return_buffer: None,
            shared_arena: None,
            published_count: None,
            last_sort_duration: None,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn options(&self) -> &SorterOptions {
        &self.options
    }

    pub fn last_sort_duration(&self) -> Option<Duration> {
        self.last_sort_duration
    }

    /// Tear down any previous worker and initialize a fresh one for the
    /// new scene. The engine is not ready until the worker acknowledges;
    /// the next dispatched sort bypasses the hysteresis guard once.
    pub fn on_scene_ready(&mut self, scene: SceneDescriptor) {
        let (requests, responses) = worker::spawn_sort_worker();

        self.state = EngineState::Initializing;
        self.splat_count = scene.splat_count;
        self.force_next_sort = true;
        self.return_buffer = None;
        self.shared_arena = None;
        self.published_count = None;
        self.last_sort_duration = None;

        let config = InitConfig {
            splat_count: scene.splat_count,
            kind: scene.kind,
            distance_map_range: self.options.distance_map_range,
            use_shared_memory: self.options.shared_memory,
            depth_keys: scene.depth_keys,
            aux: scene.aux,
        };
        // A freshly spawned worker is always receiving; a failed send will
        // surface through the disconnected response channel in poll().
        let _ = requests.send(WorkerRequest::Init(config));
        self.requests = Some(requests);
        self.responses = Some(responses);
    }

    /// Ask for a re-sort for the given camera state. Returns immediately;
    /// the guards run in spec order and the first refusal wins.
    pub fn request_sort(
        &mut self,
        view_projection: &Mat4,
        camera_position: Vec3,
        timestamp: f32,
        force: bool,
    ) -> SortRequestOutcome {
        match self.state {
            EngineState::Uninitialized | EngineState::Initializing => {
                return SortRequestOutcome::NotInitialized;
            }
            EngineState::Sorting => return SortRequestOutcome::SortInFlight,
            EngineState::Ready => {}
        }
        if !self.options.shared_memory && self.return_buffer.is_none() {
            return SortRequestOutcome::AwaitingResultBuffer;
        }

        let row = view_projection.depth_row();
        let view_dir = Vec3::new(row[0], row[1], row[2]).normalize();

        if !(force || self.force_next_sort) {
            let angle_delta = view_dir.dot(self.last_view_dir);
            let position_delta = (camera_position - self.last_camera_position).length();
            if angle_delta > ANGLE_DELTA_THRESHOLD && position_delta < POSITION_DELTA_THRESHOLD {
                return SortRequestOutcome::WithinHysteresis;
            }
        }

        let command = SortCommand {
            model_view_proj: view_projection.elements,
            camera_position: [camera_position.x, camera_position.y, camera_position.z],
            timestamp,
            sort_count: self.sort_count_for_request(),
            return_buffer: if self.options.shared_memory {
                None
            } else {
                self.return_buffer.take()
            },
        };
        let Some(requests) = &self.requests else {
            return SortRequestOutcome::NotInitialized;
        };
        match requests.send(WorkerRequest::Sort(command)) {
            Ok(()) => {
                self.force_next_sort = false;
                self.pending_view_dir = view_dir;
                self.pending_camera_position = camera_position;
                self.state = EngineState::Sorting;
                SortRequestOutcome::Dispatched
            }
            Err(send_error) => {
                // Worker gone mid-scene: fatal for this scene.
                if let WorkerRequest::Sort(mut command) = send_error.0 {
                    self.return_buffer = command.return_buffer.take();
                }
                warn!("sort worker is no longer running; scene sorting disabled");
                self.state = EngineState::Uninitialized;
                SortRequestOutcome::NotInitialized
            }
        }
    }

    /// Drain one pending worker response, if any. Never blocks; the render
    /// loop calls this once (or a few times) per frame.
    pub fn poll(&mut self) -> Option<SortEvent> {
        let received = match &self.responses {
            Some(responses) => responses.try_recv(),
            None => return None,
        };

        match received {
            Ok(WorkerResponse::InitDone { shared_arena }) => {
                self.shared_arena = shared_arena;
                if !self.options.shared_memory {
                    self.return_buffer = Some(vec![0u32; self.splat_count as usize]);
                }
                self.state = EngineState::Ready;
                Some(SortEvent::Ready)
            }
            Ok(WorkerResponse::InitFailed { error }) => {
                self.state = EngineState::Uninitialized;
                self.requests = None;
                self.responses = None;
                Some(SortEvent::InitFailed(error))
            }
            Ok(WorkerResponse::SortDone {
                sorted_indexes,
                sorted_count,
                duration,
            }) => {
                if let Some(buffer) = sorted_indexes {
                    self.return_buffer = Some(buffer);
                }
                self.state = EngineState::Ready;
                self.last_view_dir = self.pending_view_dir;
                self.last_camera_position = self.pending_camera_position;
                self.published_count = Some(self.splat_count);
                self.last_sort_duration = Some(duration);
                Some(SortEvent::SortComplete {
                    sorted_count,
                    duration,
                })
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                if self.state == EngineState::Uninitialized {
                    return None;
                }
                self.state = EngineState::Uninitialized;
                self.requests = None;
                self.responses = None;
                Some(SortEvent::InitFailed(SortError::WorkerUnavailable))
            }
        }
    }

    /// The most recently published back-to-front order, or `None` while no
    /// order is available (before the first sort, or in non-shared mode
    /// while the buffer is away at the worker). Anything previously
    /// returned is stale the moment a new sort completes.
    pub fn sorted_indexes(&self) -> Option<&[u32]> {
        let count = self.published_count? as usize;
        if self.options.shared_memory {
            if self.state == EngineState::Sorting {
                return None;
            }
            let arena = self.shared_arena.as_ref()?;
            // No sort in flight, so the worker is not writing the region.
            Some(unsafe { arena.sorted_slice(count) })
        } else {
            self.return_buffer.as_deref().map(|buffer| &buffer[..count])
        }
    }

    fn sort_count_for_request(&self) -> u32 {
        match self.options.sort_fraction {
            Some(fraction) => {
                let scaled = self.splat_count as f32 * fraction.clamp(0.0, 1.0);
                (scaled.ceil() as u32).min(self.splat_count)
            }
            None => self.splat_count,
        }
    }
}

impl Default for SortCoordinator {
    fn default() -> Self {
        Self::new(SorterOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{pack_dynamic_keys, pack_static_keys, DynamicSplatKey};
    use std::thread;
    use std::time::Instant;

    fn x_depth_matrix() -> Mat4 {
        let mut elements = [0.0f32; 16];
        elements[2] = 1.0;
        Mat4::from_elements(elements)
    }

    fn rotated_depth_matrix(y_component: f32) -> Mat4 {
        let mut elements = [0.0f32; 16];
        elements[2] = 1.0;
        elements[6] = y_component;
        Mat4::from_elements(elements)
    }

    fn static_scene(xs: &[f32]) -> SceneDescriptor {
        let positions: Vec<[f32; 3]> = xs.iter().map(|&x| [x, 0.0, 0.0]).collect();
        SceneDescriptor {
            splat_count: xs.len() as u32,
            kind: SceneKind::Static,
            depth_keys: pack_static_keys(&positions),
            aux: None,
        }
    }

    fn wait_for_event(coordinator: &mut SortCoordinator) -> SortEvent {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(event) = coordinator.poll() {
                return event;
            }
            assert!(Instant::now() < deadline, "timed out waiting on worker");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn ready_coordinator(options: SorterOptions, scene: SceneDescriptor) -> SortCoordinator {
        let mut coordinator = SortCoordinator::new(options);
        coordinator.on_scene_ready(scene);
        match wait_for_event(&mut coordinator) {
            SortEvent::Ready => {}
            other => panic!("expected Ready, got {other:?}"),
        }
        coordinator
    }

    fn complete_one_sort(coordinator: &mut SortCoordinator) -> u32 {
        loop {
            match wait_for_event(coordinator) {
                SortEvent::SortComplete { sorted_count, .. } => return sorted_count,
                SortEvent::Ready => continue,
                SortEvent::InitFailed(error) => panic!("unexpected failure: {error}"),
            }
        }
    }

    #[test]
    fn shared_mode_publishes_back_to_front_order() {
        let mut coordinator =
            ready_coordinator(SorterOptions::default(), static_scene(&[5.0, 1.0, 3.0, 2.0, 4.0]));

        let outcome =
            coordinator.request_sort(&x_depth_matrix(), Vec3::ZERO, 0.0, false);
        assert_eq!(outcome, SortRequestOutcome::Dispatched);
        assert_eq!(coordinator.state(), EngineState::Sorting);
        assert!(coordinator.sorted_indexes().is_none());

        assert_eq!(complete_one_sort(&mut coordinator), 5);
        assert_eq!(coordinator.state(), EngineState::Ready);
        assert_eq!(
            coordinator.sorted_indexes().expect("published order"),
            &[0, 4, 2, 3, 1]
        );
        assert!(coordinator.last_sort_duration().is_some());
    }

    #[test]
    fn requests_before_init_are_dropped() {
        let mut coordinator = SortCoordinator::new(SorterOptions::default());
        assert_eq!(
            coordinator.request_sort(&x_depth_matrix(), Vec3::ZERO, 0.0, true),
            SortRequestOutcome::NotInitialized
        );

        coordinator.on_scene_ready(static_scene(&[1.0]));
        assert_eq!(coordinator.state(), EngineState::Initializing);
        assert_eq!(
            coordinator.request_sort(&x_depth_matrix(), Vec3::ZERO, 0.0, true),
            SortRequestOutcome::NotInitialized
        );
    }

    #[test]
    fn at_most_one_sort_is_in_flight() {
        let mut coordinator =
            ready_coordinator(SorterOptions::default(), static_scene(&[3.0, 1.0, 2.0]));

        assert_eq!(
            coordinator.request_sort(&x_depth_matrix(), Vec3::ZERO, 0.0, true),
            SortRequestOutcome::Dispatched
        );
        assert_eq!(
            coordinator.request_sort(&x_depth_matrix(), Vec3::ZERO, 0.0, true),
            SortRequestOutcome::SortInFlight
        );

        complete_one_sort(&mut coordinator);
        // Exactly one kernel invocation happened: nothing further arrives.
        thread::sleep(Duration::from_millis(20));
        assert!(coordinator.poll().is_none());
    }

    #[test]
    fn hysteresis_band_suppresses_jitter() {
        let mut coordinator =
            ready_coordinator(SorterOptions::default(), static_scene(&[1.0, 2.0]));
        let camera = Vec3::new(10.0, 0.0, 0.0);

        assert_eq!(
            coordinator.request_sort(&x_depth_matrix(), camera, 0.0, false),
            SortRequestOutcome::Dispatched,
            "first sort after scene ready is forced"
        );
        complete_one_sort(&mut coordinator);

        // Sub-threshold jitter: dot ~0.9988, position delta 0.5.
        assert_eq!(
            coordinator.request_sort(
                &rotated_depth_matrix(0.05),
                camera + Vec3::new(0.5, 0.0, 0.0),
                0.0,
                false
            ),
            SortRequestOutcome::WithinHysteresis
        );
        assert_eq!(
            coordinator.request_sort(&x_depth_matrix(), camera, 0.0, false),
            SortRequestOutcome::WithinHysteresis
        );

        // Rotation beyond the band (dot ~0.98) triggers exactly one sort.
        assert_eq!(
            coordinator.request_sort(&rotated_depth_matrix(0.2), camera, 0.0, false),
            SortRequestOutcome::Dispatched
        );
        complete_one_sort(&mut coordinator);

        // Position delta beyond the band triggers as well.
        assert_eq!(
            coordinator.request_sort(
                &rotated_depth_matrix(0.2),
                camera + Vec3::new(2.0, 0.0, 0.0),
                0.0,
                false
            ),
            SortRequestOutcome::Dispatched
        );
        complete_one_sort(&mut coordinator);
    }

    #[test]
    fn force_first_sort_fires_exactly_once() {
        let mut coordinator =
            ready_coordinator(SorterOptions::default(), static_scene(&[1.0, 2.0]));
        let camera = Vec3::new(3.0, 0.0, 0.0);

        // Establish a last-sort camera state.
        coordinator.request_sort(&x_depth_matrix(), camera, 0.0, false);
        complete_one_sort(&mut coordinator);

        // Same scene again: the force flag must bypass a zero camera delta
        // exactly once.
        coordinator.on_scene_ready(static_scene(&[1.0, 2.0]));
        match wait_for_event(&mut coordinator) {
            SortEvent::Ready => {}
            other => panic!("expected Ready, got {other:?}"),
        }
        assert_eq!(
            coordinator.request_sort(&x_depth_matrix(), camera, 0.0, false),
            SortRequestOutcome::Dispatched
        );
        complete_one_sort(&mut coordinator);
        assert_eq!(
            coordinator.request_sort(&x_depth_matrix(), camera, 0.0, false),
            SortRequestOutcome::WithinHysteresis
        );
    }

    #[test]
    fn non_shared_mode_ping_pongs_the_result_buffer() {
        let options = SorterOptions {
            shared_memory: false,
            ..SorterOptions::default()
        };
        let mut coordinator = ready_coordinator(options, static_scene(&[2.0, 4.0, 1.0]));

        assert_eq!(
            coordinator.request_sort(&x_depth_matrix(), Vec3::ZERO, 0.0, true),
            SortRequestOutcome::Dispatched
        );
        // Buffer is away at the worker: nothing to read.
        assert!(coordinator.sorted_indexes().is_none());

        complete_one_sort(&mut coordinator);
        assert_eq!(
            coordinator.sorted_indexes().expect("buffer returned"),
            &[1, 0, 2]
        );

        // Guard (3): Ready but with the buffer gone means no dispatch.
        let held = coordinator.return_buffer.take();
        assert_eq!(
            coordinator.request_sort(&x_depth_matrix(), Vec3::ZERO, 0.0, true),
            SortRequestOutcome::AwaitingResultBuffer
        );
        coordinator.return_buffer = held;
        assert_eq!(
            coordinator.request_sort(&x_depth_matrix(), Vec3::ZERO, 0.0, true),
            SortRequestOutcome::Dispatched
        );
        complete_one_sort(&mut coordinator);
    }

    #[test]
    fn partial_sort_fraction_shapes_the_request() {
        let options = SorterOptions {
            sort_fraction: Some(0.5),
            ..SorterOptions::default()
        };
        let mut coordinator =
            ready_coordinator(options, static_scene(&[4.0, 3.0, 2.0, 1.0]));

        coordinator.request_sort(&x_depth_matrix(), Vec3::ZERO, 0.0, true);
        assert_eq!(complete_one_sort(&mut coordinator), 2);
        // Leading half passes through; trailing half sorted descending.
        assert_eq!(
            coordinator.sorted_indexes().expect("published order"),
            &[0, 1, 2, 3]
        );
    }

    #[test]
    fn oversized_scene_is_rejected_upstream() {
        let mut coordinator = SortCoordinator::new(SorterOptions::default());
        coordinator.on_scene_ready(SceneDescriptor {
            splat_count: u32::MAX,
            kind: SceneKind::Dynamic,
            depth_keys: Vec::new(),
            aux: None,
        });
        match wait_for_event(&mut coordinator) {
            SortEvent::InitFailed(SortError::ArenaExceedsCeiling { .. }) => {}
            other => panic!("expected ArenaExceedsCeiling, got {other:?}"),
        }
        assert_eq!(coordinator.state(), EngineState::Uninitialized);
        assert_eq!(
            coordinator.request_sort(&x_depth_matrix(), Vec3::ZERO, 0.0, true),
            SortRequestOutcome::NotInitialized
        );
    }

    #[test]
    fn dynamic_scene_orders_by_evaluated_motion() {
        let keys = [
            DynamicSplatKey {
                position: [1.0, 0.0, 0.0],
                c1: [0.0; 3],
                c2: [0.0; 3],
                c3: [0.0; 3],
                temporal_center: 0.0,
            },
            DynamicSplatKey {
                position: [0.0, 0.0, 0.0],
                c1: [1.0, 0.0, 0.0],
                c2: [0.0; 3],
                c3: [0.0; 3],
                temporal_center: 0.0,
            },
        ];
        let scene = SceneDescriptor {
            splat_count: 2,
            kind: SceneKind::Dynamic,
            depth_keys: pack_dynamic_keys(&keys),
            aux: None,
        };
        let mut coordinator = ready_coordinator(SorterOptions::default(), scene);

        coordinator.request_sort(&x_depth_matrix(), Vec3::ZERO, 0.0, true);
        complete_one_sort(&mut coordinator);
        assert_eq!(coordinator.sorted_indexes().expect("order"), &[0, 1]);

        coordinator.request_sort(&x_depth_matrix(), Vec3::ZERO, 2.0, true);
        complete_one_sort(&mut coordinator);
        assert_eq!(coordinator.sorted_indexes().expect("order"), &[1, 0]);
    }
}
