//! mmobatch - batching and delta compression profiler
//!
//! Drives a deterministic MMO workload through the batching layer and reports
//! what batching saved.

mod config;
mod profiler;
mod simulation;

use anyhow::{Context, Result};
use clap::Parser;
use config::ProfilerConfig;
use mmobatch_net::Priority;
use mmobatch_testkit::{JsonlSink, MetricsSink, TestResult};
use profiler::BatchingProfiler;
use simulation::Simulation;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Profile message batching for a simulated MMO workload", long_about = None)]
struct Args {
    /// TOML file with [batching] and [simulation] tables
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of simulated characters
    #[arg(long)]
    characters: Option<usize>,
    /// Number of receiving connections
    #[arg(long)]
    observers: Option<usize>,
    /// Simulated seconds to run
    #[arg(long)]
    seconds: Option<u64>,
    /// Frames per simulated second
    #[arg(long)]
    fps: Option<u32>,
    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,
    /// Send an absolute character state batch every N batches (0 disables)
    #[arg(long)]
    keyframe_interval: Option<u32>,
    /// Send every message immediately instead of batching
    #[arg(long)]
    no_batching: bool,
    /// Write a JSON metrics report here
    #[arg(long)]
    metrics: Option<PathBuf>,
    /// Write per-second samples and respawns as JSON lines here
    #[arg(long)]
    events: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Initialize tracing with WARN level by default (can be overridden via RUST_LOG env var)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    info!("Starting mmobatch v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ProfilerConfig::load_from_path(path),
        None => ProfilerConfig::load(),
    };
    apply_overrides(&mut config, &args);

    let events = args
        .events
        .as_ref()
        .map(|path| {
            JsonlSink::create(path)
                .with_context(|| format!("failed to create event log {}", path.display()))
        })
        .transpose()?;

    let name = if config.batching.enabled {
        "batching"
    } else {
        "unbatched"
    };
    let mut sim = Simulation::new(config.batching.clone(), config.simulation.clone())?;
    let mut profiler = BatchingProfiler::new(name, events);

    println!(
        "Simulating {} characters for {} observers over {} frames",
        config.simulation.characters,
        config.simulation.observers,
        sim.total_frames()
    );

    for _ in 0..sim.total_frames() {
        let respawned = sim.step()?;
        profiler.record_respawns(sim.frame(), &respawned)?;
        profiler.after_frame(&sim)?;
    }
    sim.finish();

    let report = profiler.finish(&sim)?;
    print_summary(&sim);

    if let Some(path) = &args.metrics {
        MetricsSink::create(path)
            .and_then(|sink| sink.write(&report))
            .with_context(|| format!("failed to write metrics to {}", path.display()))?;
        println!("Metrics written to {}", path.display());
    }

    if report.result != TestResult::Pass {
        anyhow::bail!("profiling run failed validation");
    }
    Ok(())
}

fn apply_overrides(config: &mut ProfilerConfig, args: &Args) {
    let simulation = &mut config.simulation;
    if let Some(value) = args.characters {
        simulation.characters = value;
    }
    if let Some(value) = args.observers {
        simulation.observers = value;
    }
    if let Some(value) = args.seconds {
        simulation.seconds = value;
    }
    if let Some(value) = args.fps {
        simulation.fps = value;
    }
    if let Some(value) = args.seed {
        simulation.seed = value;
    }
    if let Some(value) = args.keyframe_interval {
        config.batching.character_state.absolute_keyframe_interval = value;
    }
    if args.no_batching {
        config.batching.enabled = false;
    }
}

fn print_summary(sim: &Simulation) {
    let stats = sim.layer().messages().stats();
    let drift = sim.drift();
    let compression = sim.layer().character_states().stats();

    println!("\nResults:");
    println!(
        "  queued    : {} messages ({} direct, {} dropped)",
        stats.messages_queued, stats.direct_sends, stats.messages_dropped
    );
    println!(
        "  batched   : {} messages in {} batches (avg {:.1}/batch)",
        stats.messages_batched,
        stats.batches_sent,
        stats.average_batch_size()
    );
    for priority in Priority::ALL {
        let counters = stats.priority(priority);
        println!(
            "    {:<9}: {} messages in {} batches",
            format!("{priority:?}"),
            counters.messages,
            counters.batches
        );
    }
    println!(
        "  bandwidth : {} bytes sent, {} bytes saved",
        stats.bytes_sent, stats.bandwidth_saved
    );
    println!(
        "  states    : {} positions, ratio {:.2}",
        compression.positions_encoded,
        compression.ratio()
    );
    println!(
        "  drift     : max {:.3}, avg {:.3} over {} entities",
        drift.max_drift, drift.avg_drift, drift.entities
    );
    println!("  processed : {} messages", sim.messages_processed());
}
