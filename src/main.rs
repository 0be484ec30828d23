use std::thread;
use std::time::Duration;

use clap::Parser;
use log::info;

use splatsort::coordinator::DEFAULT_DISTANCE_MAP_RANGE;
use splatsort::math::{Mat4, Vec3};
use splatsort::{demo, EngineState, SortCoordinator, SortEvent, SortRequestOutcome, SorterOptions};

type AppResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Debug, Parser)]
#[command(
    name = "splatsort",
    version,
    about = "Depth-sort engine demo: sorts a synthetic splat scene against an orbiting camera"
)]
struct Cli {
    #[arg(
        long,
        value_name = "N",
        default_value_t = 100_000,
        help = "Number of splats in the synthetic scene"
    )]
    splats: usize,
    #[arg(long, help = "Time-varying scene (4D Gaussians)")]
    dynamic: bool,
    #[arg(
        long,
        value_name = "N",
        default_value_t = 240,
        help = "Camera frames to simulate"
    )]
    frames: u32,
    #[arg(long, help = "Ping-pong an owned result buffer instead of sharing the arena")]
    non_shared: bool,
    #[arg(
        long,
        value_name = "FRACTION",
        help = "Partial-sort latency fallback, fraction of splats per sort"
    )]
    sort_fraction: Option<f32>,
    #[arg(long, default_value_t = 0xC0FFEE, help = "Scene generator seed")]
    seed: u64,
}

fn wait_until_ready(coordinator: &mut SortCoordinator) -> AppResult<()> {
    loop {
        match coordinator.poll() {
            Some(SortEvent::Ready) => return Ok(()),
            Some(SortEvent::InitFailed(error)) => return Err(error.into()),
            Some(SortEvent::SortComplete { .. }) | None => {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

fn main() -> AppResult<()> {
    env_logger::init();
    let cli = Cli::parse();

    let options = SorterOptions {
        shared_memory: !cli.non_shared,
        distance_map_range: DEFAULT_DISTANCE_MAP_RANGE,
        sort_fraction: cli.sort_fraction,
    };
    let scene = if cli.dynamic {
        demo::generate_dynamic_scene(cli.splats, cli.seed)
    } else {
        demo::generate_static_scene(cli.splats, cli.seed)
    };

    info!(
        "demo scene: {} {} splats, seed {:#x}",
        cli.splats,
        if cli.dynamic { "dynamic" } else { "static" },
        cli.seed
    );

    let mut coordinator = SortCoordinator::new(options);
    coordinator.on_scene_ready(scene);
    wait_until_ready(&mut coordinator)?;

    let projection = Mat4::perspective(std::f32::consts::FRAC_PI_3, 16.0 / 9.0, 0.1, 100.0);
    let mut dispatched = 0u32;
    let mut suppressed = 0u32;
    let mut durations = Vec::new();

    for frame in 0..cli.frames {
        // Orbit slowly enough that some frames fall inside the hysteresis
        // band and get suppressed, as a real viewer's would.
        let angle = frame as f32 * 0.02;
        let eye = Vec3::new(6.0 * angle.cos(), 1.5, 6.0 * angle.sin());
        let view = Mat4::look_at(eye, Vec3::ZERO, Vec3::new(0.0, 1.0, 0.0));
        let view_projection = projection.multiply(&view);
        let timestamp = frame as f32 / 60.0;

        match coordinator.request_sort(&view_projection, eye, timestamp, false) {
            SortRequestOutcome::Dispatched => dispatched += 1,
            _ => suppressed += 1,
        }
        while let Some(event) = coordinator.poll() {
            if let SortEvent::SortComplete { duration, .. } = event {
                durations.push(duration);
            }
        }
        thread::sleep(Duration::from_millis(4));
    }

    // Let the final in-flight sort, if any, come home.
    while coordinator.state() == EngineState::Sorting {
        if let Some(SortEvent::SortComplete { duration, .. }) = coordinator.poll() {
            durations.push(duration);
        }
        thread::sleep(Duration::from_millis(1));
    }

    println!(
        "frames {} | dispatched {} | suppressed {} | completed {}",
        cli.frames,
        dispatched,
        suppressed,
        durations.len()
    );
    if let Some(order) = coordinator.sorted_indexes() {
        println!(
            "published order: {} indexes, head {:?}",
            order.len(),
            &order[..order.len().min(8)]
        );
    }
    if !durations.is_empty() {
        let total: Duration = durations.iter().sum();
        let mean = total / durations.len() as u32;
        let max = durations.iter().max().copied().unwrap_or_default();
        println!(
            "sort time: mean {:.2}ms, max {:.2}ms",
            mean.as_secs_f64() * 1e3,
            max.as_secs_f64() * 1e3
        );
    }

    Ok(())
}
