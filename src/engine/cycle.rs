//! User-triggered actuator-cycle run variant.
//!
//! After start the engine parks in the armed state. Each user trigger runs
//! exactly one cycle over the configured actuators (extend, pause, measure,
//! home), then re-arms. The run is unbounded; it ends with a graceful
//! `finish()` between cycles or an `abort()` at any time.

use super::timer::RunTimer;
use super::{EngineCore, RunStrategy, Wake};
use crate::config::{DeviceStartScope, Settings};
use crate::core::Cue;
use crate::engine::{Phase, TaskEvent};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone, Debug)]
struct CycleConfig {
    measure: Duration,
    pause: Duration,
    move_timeout: Duration,
    actuators: Vec<String>,
    device_start: DeviceStartScope,
}

/// The triggered-cycle run.
pub struct CycleStrategy {
    settings: Settings,
    cfg: Mutex<Option<CycleConfig>>,
    in_flight: AtomicBool,
    /// Accumulates measuring time across cycles; the engine's run timer is
    /// reset per cycle for the UI, this one is not.
    cumulative: Mutex<RunTimer>,
}

impl CycleStrategy {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            cfg: Mutex::new(None),
            in_flight: AtomicBool::new(false),
            cumulative: Mutex::new(RunTimer::new()),
        }
    }

    fn snapshot_config(&self) -> Option<CycleConfig> {
        self.cfg.lock().ok()?.clone()
    }

    fn with_cumulative(&self, f: impl FnOnce(&mut RunTimer)) {
        if let Ok(mut timer) = self.cumulative.lock() {
            f(&mut timer);
        }
    }

    fn cumulative_elapsed(&self) -> Duration {
        self.cumulative
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Per-cycle wall-time estimate for the frontend.
    fn estimate_cycle_seconds(cfg: &CycleConfig, settle: Duration) -> f64 {
        let per_actuator = cfg.move_timeout.as_secs_f64()
            + cfg.pause.as_secs_f64()
            + cfg.measure.as_secs_f64()
            + cfg.move_timeout.as_secs_f64()
            + settle.as_secs_f64();
        cfg.actuators.len() as f64 * per_actuator
    }

    async fn run_loop(&self, core: &EngineCore, cfg: &CycleConfig) -> Result<()> {
        loop {
            if core.abort_requested() {
                return Ok(());
            }

            core.set_phase(Phase::Armed).await;
            core.emit_event(TaskEvent::WaitingForTrigger);
            core.set_armed(true);
            let wake = core.wait_for_wake().await;
            core.set_armed(false);

            if wake == Wake::Interrupted {
                if core.finish_requested() {
                    info!("finish requested; ending triggered run");
                }
                return Ok(());
            }

            // In-flight is raised before the event goes out, so a trigger
            // arriving on the heels of CycleStarted is already rejected.
            self.in_flight.store(true, Ordering::SeqCst);
            core.restart_timer().await;
            core.emit_event(TaskEvent::CycleStarted);
            let completed = self.run_one_cycle(core, cfg).await?;
            if !completed {
                return Ok(());
            }

            core.emit_event(TaskEvent::CycleFinished);
            core.update_progress(|p| {
                p.repeat_index += 1;
                // The run is unbounded; the total mirrors the count so far.
                p.repeat_total = p.repeat_index;
            })
            .await;
            core.notify().await;
        }
    }

    /// One full cycle over all actuators. Returns false on interruption.
    async fn run_one_cycle(&self, core: &EngineCore, cfg: &CycleConfig) -> Result<bool> {
        self.in_flight.store(true, Ordering::SeqCst);
        self.with_cumulative(RunTimer::start);

        core.update_progress(|p| {
            p.percent = 0;
            p.overall_percent = 0;
            p.step_index = 0;
            p.elapsed_seconds = 0.0;
        })
        .await;
        core.notify().await;

        let outcome = self.cycle_body(core, cfg).await;

        // Per-cycle scope always stops the device, even on a failed cycle,
        // so an abort never leaves the analyzer measuring.
        if cfg.device_start == DeviceStartScope::PerCycle && !core.stop_device().await {
            warn!("failed to stop analyzer after cycle");
        }
        core.pause_timer().await;
        self.with_cumulative(RunTimer::pause);
        self.in_flight.store(false, Ordering::SeqCst);
        core.notify().await;

        let completed = outcome?;
        if completed {
            core.cue(Cue::Completed);
            let snapshot = core.snapshot().await;
            info!(
                step_index = snapshot.step_index,
                total_steps = snapshot.total_steps,
                "cycle complete"
            );
        }
        Ok(completed)
    }

    async fn cycle_body(&self, core: &EngineCore, cfg: &CycleConfig) -> Result<bool> {
        if cfg.device_start == DeviceStartScope::PerCycle {
            if let Err(reason) = core.start_device().await {
                warn!(reason = %reason, "device start failed at cycle begin");
                anyhow::bail!("device start failed: {reason}");
            }
        }

        let total = cfg.actuators.len() as u32;
        for (idx, actuator) in cfg.actuators.iter().enumerate() {
            if core.abort_requested() {
                return Ok(false);
            }

            let next = idx + 1;
            core.update_progress(|p| {
                p.current_unit = idx;
                p.next_unit = (next < cfg.actuators.len()).then_some(next);
            })
            .await;
            core.notify().await;

            if !self.run_actuator_sequence(core, cfg, actuator).await? {
                // Leave the drive de-energized no matter where the sequence
                // stopped.
                core.motion.reset(actuator).await;
                return Ok(false);
            }

            core.update_progress(|p| {
                p.step_index += 1;
                let pct = ((p.step_index * 100) as f64 / total as f64).round() as u8;
                p.percent = pct;
                p.overall_percent = pct;
            })
            .await;
            core.notify().await;
        }

        Ok(true)
    }

    /// One actuator: extend, pause, measure, verify the device, home.
    async fn run_actuator_sequence(
        &self,
        core: &EngineCore,
        cfg: &CycleConfig,
        actuator: &str,
    ) -> Result<bool> {
        core.set_phase(Phase::Switching).await;
        core.cue(Cue::Step);
        if !core.move_and_wait(actuator, cfg.move_timeout).await {
            return Ok(false);
        }

        core.set_phase(Phase::Paused).await;
        if !core.wait_for(cfg.pause, true).await {
            return Ok(false);
        }

        core.set_phase(Phase::Measuring).await;
        if !core.wait_for(cfg.measure, true).await {
            warn!("measurement interrupted");
            return Ok(false);
        }

        if core.device_reports_stopped().await {
            warn!("analyzer stopped unexpectedly mid-cycle");
            anyhow::bail!("analyzer stopped unexpectedly");
        }

        core.set_phase(Phase::Homing).await;
        core.cue(Cue::Home);
        if !core.home_and_wait(actuator, cfg.move_timeout).await {
            return Ok(false);
        }

        Ok(true)
    }
}

#[async_trait]
impl RunStrategy for CycleStrategy {
    fn kind(&self) -> &'static str {
        "cycle"
    }

    fn supports_trigger(&self) -> bool {
        true
    }

    fn cycle_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    async fn load_config(&self, core: &EngineCore) -> std::result::Result<(), String> {
        let acq = &self.settings.acquisition;
        let cyc = &self.settings.cycle;

        if acq.measure_seconds <= 0.0 {
            return Err("invalid measurement duration".to_string());
        }
        if acq.pause_seconds < 0.0 {
            return Err("invalid pause duration".to_string());
        }
        if cyc.move_timeout_seconds <= 0.0 {
            return Err("invalid actuator move timeout".to_string());
        }
        if cyc.actuator_ids.is_empty() {
            return Err("no actuators configured".to_string());
        }

        let cfg = CycleConfig {
            measure: Duration::from_secs_f64(acq.measure_seconds),
            pause: Duration::from_secs_f64(acq.pause_seconds),
            move_timeout: Duration::from_secs_f64(cyc.move_timeout_seconds),
            actuators: cyc.actuator_ids.clone(),
            device_start: cyc.device_start,
        };

        let total_steps = cfg.actuators.len() as u32;
        let estimate = Self::estimate_cycle_seconds(&cfg, core.cmd_settle);
        core.update_progress(|p| {
            p.enabled_count = total_steps;
            // Unbounded run: repeat_total tracks repeat_index, starting at 0.
            p.repeat_total = 0;
            p.total_steps = total_steps;
            p.total_estimate_seconds = Some(estimate);
        })
        .await;

        match self.cfg.lock() {
            Ok(mut slot) => *slot = Some(cfg),
            Err(_) => return Err("configuration slot poisoned".to_string()),
        }
        Ok(())
    }

    async fn on_start_prepare(&self, core: &EngineCore) -> std::result::Result<(), String> {
        match self.settings.cycle.device_start {
            DeviceStartScope::PerTask => core.start_device().await,
            DeviceStartScope::PerCycle => Ok(()),
        }
    }

    async fn run(&self, core: &EngineCore) -> Result<()> {
        let Some(cfg) = self.snapshot_config() else {
            anyhow::bail!("cycle run started without a loaded configuration");
        };
        info!(
            actuators = cfg.actuators.len(),
            measure_s = cfg.measure.as_secs_f64(),
            device_start = ?cfg.device_start,
            "triggered-cycle run starting"
        );

        self.with_cumulative(RunTimer::reset);
        let result = self.run_loop(core, &cfg).await;

        // The final elapsed display is the total measuring time across all
        // cycles, not the last cycle's.
        let total = self.cumulative_elapsed();
        core.overwrite_timer(total).await;
        core.update_progress(|p| p.total_estimate_seconds = Some(total.as_secs_f64()))
            .await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_estimate_formula() {
        let cfg = CycleConfig {
            measure: Duration::from_secs(100),
            pause: Duration::from_secs(5),
            move_timeout: Duration::from_secs(10),
            actuators: vec!["left".to_string(), "right".to_string()],
            device_start: DeviceStartScope::PerCycle,
        };
        let estimate = CycleStrategy::estimate_cycle_seconds(&cfg, Duration::from_secs(1));
        // Two actuators, each: 10 extend + 5 pause + 100 measure + 10 home + 1 settle.
        assert!((estimate - 2.0 * 126.0).abs() < 1e-9);
    }

    #[test]
    fn test_strategy_reports_trigger_support() {
        let strategy = CycleStrategy::new(Settings::default());
        assert!(strategy.supports_trigger());
        assert!(!strategy.cycle_in_flight());
    }
}
