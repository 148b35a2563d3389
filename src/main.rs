//! CLI entry point for the gas sampling rig.
//!
//! Runs simulated acquisitions end-to-end against the in-memory drivers and
//! performs log maintenance:
//!
//! ```bash
//! gasrig sweep --repeats 2
//! gasrig cycle --cycles 3
//! gasrig recover
//! gasrig logs
//! ```
//!
//! Real deployments embed [`gasrig`] as a library behind their own control
//! surface; this binary exists for bench bring-up and operational tooling.

use anyhow::Result;
use clap::{Parser, Subcommand};
use gasrig::config::Settings;
use gasrig::core::{AnalyzerClient, Feedback, MotionDriver, SilentFeedback};
use gasrig::engine::{
    full_channel_mask, CycleStrategy, EngineDeps, RunEngine, RunStrategy, SweepStrategy, TaskEvent,
};
use gasrig::logger;
use gasrig::sim::{SimAnalyzer, SimMotion};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gasrig")]
#[command(about = "Gas analyzer sampling rig acquisition engine", long_about = None)]
struct Cli {
    /// Optional TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated deterministic channel sweep
    Sweep {
        /// Override the configured repeat count
        #[arg(long)]
        repeats: Option<u32>,

        /// Override the per-channel measurement dwell, in seconds
        #[arg(long)]
        measure_seconds: Option<f64>,
    },

    /// Run a simulated user-triggered actuator-cycle session
    Cycle {
        /// Number of cycles to trigger before finishing
        #[arg(long, default_value = "1")]
        cycles: u32,
    },

    /// Merge orphaned log segments left behind by a crashed run
    Recover,

    /// List finished measurement logs, newest first
    Logs,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::new(cli.config.as_deref())?;

    match cli.command {
        Commands::Sweep {
            repeats,
            measure_seconds,
        } => {
            let mut settings = settings;
            if let Some(repeats) = repeats {
                settings.acquisition.repeat_count = repeats;
            }
            if let Some(measure) = measure_seconds {
                settings.acquisition.measure_seconds = measure;
            }
            settings.validate()?;
            run_sweep(settings).await
        }
        Commands::Cycle { cycles } => run_cycle(settings, cycles).await,
        Commands::Recover => {
            let recovered = logger::recover_orphaned(&settings.storage.log_root)?;
            if recovered.is_empty() {
                info!("no orphaned segments found");
            }
            for path in recovered {
                info!(path = %path.display(), "recovered");
            }
            Ok(())
        }
        Commands::Logs => {
            for entry in logger::log_entries(&settings.storage.log_root)? {
                println!(
                    "{:>10}  {}  {}",
                    entry.size, entry.modified_readable, entry.name
                );
            }
            Ok(())
        }
    }
}

struct SimRig {
    engine: Arc<RunEngine>,
    analyzer: Arc<SimAnalyzer>,
}

fn build_sim_rig(settings: &Settings, strategy: Arc<dyn RunStrategy>) -> SimRig {
    let analyzer = Arc::new(SimAnalyzer::new());
    let motion = Arc::new(SimMotion::new());
    let deps = EngineDeps {
        device: Arc::clone(&analyzer) as Arc<dyn AnalyzerClient>,
        motion: motion as Arc<dyn MotionDriver>,
        feedback: Arc::new(SilentFeedback) as Arc<dyn Feedback>,
    };
    let engine = Arc::new(RunEngine::new(strategy, deps, settings));
    SimRig { engine, analyzer }
}

/// Feed scripted readings into the engine for as long as the run lives.
fn spawn_reading_feeder(rig: &SimRig) -> tokio::task::JoinHandle<()> {
    let engine = Arc::clone(&rig.engine);
    let analyzer = Arc::clone(&rig.analyzer);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if !engine.is_running().await {
                break;
            }
            engine.ingest_live(&analyzer.next_reading()).await;
        }
    })
}

/// Follow progress and events until the run ends; Ctrl-C aborts it.
async fn monitor_until_done(engine: &Arc<RunEngine>) -> Result<()> {
    let mut progress_rx = engine.subscribe();
    let mut event_rx = engine.subscribe_events();
    loop {
        tokio::select! {
            Ok(progress) = progress_rx.recv() => {
                info!(
                    phase = %progress.phase,
                    unit = progress.current_unit,
                    percent = progress.percent,
                    overall = progress.overall_percent,
                    elapsed_s = format!("{:.1}", progress.elapsed_seconds),
                    "progress"
                );
            }
            Ok(event) = event_rx.recv() => {
                info!(?event, "event");
                if matches!(event, TaskEvent::TaskFinished | TaskEvent::TaskAborted) {
                    return Ok(());
                }
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                if !engine.is_running().await {
                    return Ok(());
                }
            }
            _ = signal::ctrl_c() => {
                warn!("interrupt received; aborting run");
                match engine.abort().await {
                    Ok(message) => info!(%message, "abort"),
                    Err(e) => warn!(error = %e, "abort rejected"),
                }
                return Ok(());
            }
            else => return Ok(()),
        }
    }
}

async fn run_sweep(settings: Settings) -> Result<()> {
    let mask = full_channel_mask(settings.acquisition.channel_count);
    let strategy = Arc::new(SweepStrategy::new(settings.clone(), mask));
    let rig = build_sim_rig(&settings, strategy);

    let message = rig.engine.start().await?;
    info!(%message, "sweep started");

    let feeder = spawn_reading_feeder(&rig);
    monitor_until_done(&rig.engine).await?;
    let _ = feeder.await;
    Ok(())
}

async fn run_cycle(settings: Settings, cycles: u32) -> Result<()> {
    let strategy = Arc::new(CycleStrategy::new(settings.clone()));
    let rig = build_sim_rig(&settings, strategy);

    let message = rig.engine.start().await?;
    info!(%message, "triggered-cycle session started");

    let feeder = spawn_reading_feeder(&rig);
    let mut event_rx = rig.engine.subscribe_events();

    for cycle in 0..cycles {
        wait_until_armed(&rig.engine).await;
        let message = rig.engine.trigger_repeat().await?;
        info!(cycle = cycle + 1, %message, "triggered");

        loop {
            match event_rx.recv().await {
                Ok(TaskEvent::CycleFinished) => break,
                Ok(TaskEvent::TaskAborted) | Ok(TaskEvent::Error) | Err(_) => {
                    warn!("run ended before the cycle completed");
                    let _ = feeder.await;
                    return Ok(());
                }
                Ok(_) => {}
            }
        }
    }

    wait_until_armed(&rig.engine).await;
    let message = rig.engine.finish().await?;
    info!(%message, "finishing session");
    loop {
        match event_rx.recv().await {
            Ok(TaskEvent::TaskFinished) | Ok(TaskEvent::TaskAborted) | Err(_) => break,
            Ok(_) => {}
        }
    }
    let _ = feeder.await;
    Ok(())
}

async fn wait_until_armed(engine: &Arc<RunEngine>) {
    while engine.is_running().await && !engine.can_finish_now() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
