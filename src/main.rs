// src/main.rs
//! Taskweave demo runner
//!
//! Starts a runtime from `taskweave.toml` and the environment, runs a tiled
//! synthetic workload over it and prints the runtime statistics.

use anyhow::{Context, Result};
use std::sync::Arc;
use taskweave::observability::{init_metrics, init_tracing};
use taskweave::perfmodel::HistoryModel;
use taskweave::sched::ArchKind;
use taskweave::task::KernelContext;
use taskweave::{AccessMode, BuildInfo, Codelet, Runtime, RuntimeConfig, RuntimeStats, Task};
use tracing::{info, warn};

const NTILES: usize = 16;
const TILE_LEN: usize = 4096;
const ITERATIONS: usize = 4;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = RuntimeConfig::load().context("loading configuration")?;

    // Initialize observability (tracing, metrics)
    init_tracing(&config.observability)?;
    let prometheus = init_metrics(&config.observability)?;

    let build = BuildInfo::current();
    info!(version = build.version, git = build.git_hash, "Starting taskweave");
    info!("Configuration loaded: {:?}", config);

    let workload = tokio::task::spawn_blocking(move || run_workload(config));
    let stats = tokio::select! {
        joined = workload => joined.context("workload thread")??,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, abandoning the workload");
            return Ok(());
        }
    };

    println!("{}", serde_json::to_string_pretty(&stats)?);
    if let Some(handle) = prometheus {
        println!("{}", handle.render());
    }
    Ok(())
}

fn scale(ctx: &KernelContext<'_>) {
    let values: Vec<f64> = ctx.read_f64(0).iter().map(|v| v * 0.5 + 1.0).collect();
    ctx.write_f64(0, &values);
}

fn accumulate(ctx: &KernelContext<'_>) {
    let tile: f64 = ctx.read_f64(0).iter().sum();
    let total = ctx.read_f64(1).first().copied().unwrap_or(0.0);
    ctx.write_f64(1, &[total + tile]);
}

/// Rescale every tile then fold it into a running sum, a few times over
fn run_workload(config: RuntimeConfig) -> Result<RuntimeStats> {
    let min_samples = config.sched.calibration_samples;
    let runtime = Runtime::new(config)?;

    let scale_codelet = Arc::new(
        Codelet::new("scale", 1)
            .with_implementation(ArchKind::Cpu, scale)
            .with_implementation(ArchKind::Cuda, scale)
            .with_implementation(ArchKind::OpenCl, scale)
            .with_model(Arc::new(HistoryModel::new("scale", min_samples))),
    );
    let accumulate_codelet = Arc::new(
        Codelet::new("accumulate", 2)
            .with_implementation(ArchKind::Cpu, accumulate)
            .with_model(Arc::new(HistoryModel::new("accumulate", min_samples))),
    );

    let tiles = (0..NTILES)
        .map(|i| runtime.register_vector_f64(&vec![i as f64; TILE_LEN]))
        .collect::<taskweave::Result<Vec<_>>>()?;
    let sum = runtime.register_vector_f64(&[0.0])?;

    for iteration in 0..ITERATIONS {
        for tile in &tiles {
            let task = Task::builder(Arc::clone(&scale_codelet))
                .buffer(tile, AccessMode::ReadWrite)
                .priority(iteration as i32)
                .build();
            runtime.submit(&task)?;

            let task = Task::builder(Arc::clone(&accumulate_codelet))
                .buffer(tile, AccessMode::Read)
                .buffer(&sum, AccessMode::ReadWrite)
                .build();
            runtime.submit(&task)?;
        }
    }
    runtime.wait_for_all();

    let total = runtime.read_f64(&sum)?;
    info!(sum = total.first().copied().unwrap_or(0.0), "Workload finished");

    for tile in &tiles {
        runtime.unregister(tile)?;
    }
    runtime.unregister(&sum)?;
    let stats = runtime.stats();
    runtime.shutdown();
    Ok(stats)
}
