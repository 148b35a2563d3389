//! Deterministic channel-sweep run variant.
//!
//! Visits every enabled multiplexer channel in ascending order, measuring at
//! each, for a configured number of repeats. The channel mask is shared with
//! the UI layer: channels flip to [`ChannelState::Sampled`] as the run
//! progresses, in memory only.

use super::{EngineCore, RunStrategy, FINAL_FLUSH_HOLD};
use crate::config::Settings;
use crate::core::Cue;
use crate::engine::Phase;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-channel inclusion state.
///
/// `Sampled` still counts as enabled; it marks channels already visited in
/// the current run so a UI can grey them out live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Inactive,
    Active,
    Sampled,
}

impl ChannelState {
    pub fn is_enabled(self) -> bool {
        self != ChannelState::Inactive
    }
}

/// Channel mask shared between the engine and its observers.
///
/// Updates are memory-only; a crash loses the `Sampled` markers, which is
/// acceptable since they describe the current run, not configuration.
pub type SharedChannelMask = Arc<Mutex<Vec<ChannelState>>>;

/// All-channels-active mask of the given width.
pub fn full_channel_mask(channel_count: usize) -> SharedChannelMask {
    Arc::new(Mutex::new(vec![ChannelState::Active; channel_count]))
}

#[derive(Clone, Debug)]
struct SweepConfig {
    measure: Duration,
    pause: Duration,
    repeat_count: u32,
    switch_settle: Duration,
    unit: String,
    mask: Vec<ChannelState>,
}

/// The deterministic sweep run.
pub struct SweepStrategy {
    settings: Settings,
    mask: SharedChannelMask,
    cfg: Mutex<Option<SweepConfig>>,
}

impl SweepStrategy {
    pub fn new(settings: Settings, mask: SharedChannelMask) -> Self {
        Self {
            settings,
            mask,
            cfg: Mutex::new(None),
        }
    }

    fn snapshot_config(&self) -> Option<SweepConfig> {
        self.cfg.lock().ok()?.clone()
    }

    /// Mark the channel as visited in the shared mask.
    fn mark_sampled(&self, channel: usize) {
        if let Ok(mut mask) = self.mask.lock() {
            if let Some(state) = mask.get_mut(channel) {
                *state = ChannelState::Sampled;
            }
        }
        debug!(channel, "channel marked as sampled");
    }

    /// Expected wall time for the whole run, for the frontend ETA display.
    ///
    /// Switch count is the index of the last enabled channel: the mux homes
    /// once per repeat and then steps one position per channel up to it.
    fn estimate_total_seconds(cfg: &SweepConfig, enabled_count: u32) -> f64 {
        let last_enabled = match cfg.mask.iter().rposition(|s| s.is_enabled()) {
            Some(idx) => idx,
            None => return 0.0,
        };
        let settle = cfg.switch_settle.as_secs_f64();
        let per_repeat = enabled_count as f64 * cfg.measure.as_secs_f64()
            + enabled_count as f64 * cfg.pause.as_secs_f64()
            + settle
            + last_enabled as f64 * settle;
        cfg.repeat_count as f64 * per_repeat + FINAL_FLUSH_HOLD.as_secs_f64()
    }

    /// One full pass over the channel mask. Returns false on interruption.
    async fn run_one_repeat(&self, core: &EngineCore, cfg: &SweepConfig, rep: u32) -> Result<bool> {
        let enabled_count = cfg.mask.iter().filter(|s| s.is_enabled()).count() as u32;
        let overall_steps = enabled_count * cfg.repeat_count;
        let mut processed: u32 = 0;

        core.update_progress(|p| {
            p.percent = 0;
            p.current_unit = 0;
            p.next_unit = None;
        })
        .await;
        core.notify().await;

        // The mux homes at the start of every repeat so position drift can
        // never accumulate across passes.
        core.set_phase(Phase::Homing).await;
        core.cue(Cue::Home);
        if !core.home_and_wait(&cfg.unit, cfg.switch_settle).await {
            return Ok(false);
        }

        for (channel, state) in cfg.mask.iter().enumerate() {
            let next = channel + 1;
            core.update_progress(|p| {
                p.current_unit = channel;
                p.next_unit = (next < cfg.mask.len()).then_some(next);
            })
            .await;
            core.notify().await;

            if core.abort_requested() {
                return Ok(false);
            }

            if state.is_enabled() {
                if !self.measure_channel(core, cfg, channel).await? {
                    return Ok(false);
                }
                processed += 1;

                let step_index = rep * enabled_count + processed;
                core.update_progress(|p| {
                    p.percent = ((processed * 100) as f64 / enabled_count as f64).round() as u8;
                    p.overall_percent =
                        ((step_index * 100) as f64 / overall_steps as f64).round() as u8;
                    p.step_index = step_index;
                })
                .await;
                core.notify().await;
            }

            if processed >= enabled_count {
                if rep + 1 >= cfg.repeat_count {
                    // Hold the final position briefly so the last reading
                    // drains out of the analyzer before shutdown.
                    core.set_phase(Phase::Switching).await;
                    core.wait_for(FINAL_FLUSH_HOLD, true).await;
                    debug!("final channel of final repeat reached");
                }
                break;
            }

            core.set_phase(Phase::Switching).await;
            // Only an enabled channel's departure is worth an audible cue;
            // skipping past disabled positions stays quiet.
            if state.is_enabled() {
                core.cue(Cue::Step);
            }
            if !core.move_and_wait(&cfg.unit, cfg.switch_settle).await {
                return Ok(false);
            }
        }

        core.update_progress(|p| p.repeat_index = rep + 1).await;
        core.notify().await;
        Ok(true)
    }

    /// Pause, measure, verify the device survived, mark the channel.
    async fn measure_channel(
        &self,
        core: &EngineCore,
        cfg: &SweepConfig,
        channel: usize,
    ) -> Result<bool> {
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
            warn!("analyzer stopped unexpectedly mid-run");
            anyhow::bail!("analyzer stopped unexpectedly");
        }

        self.mark_sampled(channel);
        Ok(true)
    }
}

#[async_trait]
impl RunStrategy for SweepStrategy {
    fn kind(&self) -> &'static str {
        "sweep"
    }

    async fn load_config(&self, core: &EngineCore) -> std::result::Result<(), String> {
        let mask = self
            .mask
            .lock()
            .map_err(|_| "channel mask poisoned".to_string())?
            .clone();
        let acq = &self.settings.acquisition;
        let cfg = SweepConfig {
            measure: Duration::from_secs_f64(acq.measure_seconds),
            pause: Duration::from_secs_f64(acq.pause_seconds),
            // A zero repeat count is a valid no-op run: the loop body never
            // executes and no hardware moves.
            repeat_count: acq.repeat_count,
            switch_settle: Duration::from_secs_f64(acq.switch_settle_seconds),
            unit: acq.sweep_unit.clone(),
            mask,
        };

        let enabled_count = cfg.mask.iter().filter(|s| s.is_enabled()).count() as u32;
        if enabled_count == 0 {
            warn!("no channels enabled; refusing to start");
            return Err("no channels enabled".to_string());
        }

        let estimate = Self::estimate_total_seconds(&cfg, enabled_count);
        core.update_progress(|p| {
            p.enabled_count = enabled_count;
            p.repeat_total = cfg.repeat_count;
            p.total_steps = cfg.repeat_count * enabled_count;
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
        // A sweep keeps one device measurement running for its whole
        // duration.
        core.start_device().await
    }

    async fn run(&self, core: &EngineCore) -> Result<()> {
        let Some(cfg) = self.snapshot_config() else {
            anyhow::bail!("sweep started without a loaded configuration");
        };
        info!(
            measure_s = cfg.measure.as_secs_f64(),
            pause_s = cfg.pause.as_secs_f64(),
            repeats = cfg.repeat_count,
            channels = cfg.mask.len(),
            "sweep starting"
        );

        for rep in 0..cfg.repeat_count {
            if core.abort_requested() {
                break;
            }
            if !self.run_one_repeat(core, &cfg, rep).await? {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(mask: Vec<ChannelState>) -> SweepConfig {
        SweepConfig {
            measure: Duration::from_secs(100),
            pause: Duration::from_secs(5),
            repeat_count: 2,
            switch_settle: Duration::from_secs(5),
            unit: "mux".to_string(),
            mask,
        }
    }

    #[test]
    fn test_estimate_counts_switches_to_last_enabled() {
        use ChannelState::{Active, Inactive};
        // Enabled at 0 and 2: 2 switches to reach the last enabled channel.
        let cfg = test_config(vec![Active, Inactive, Active]);
        let estimate = SweepStrategy::estimate_total_seconds(&cfg, 2);
        // Per repeat: 2*100 measure + 2*5 pause + 5 home settle + 2*5 steps.
        let expected = 2.0 * (200.0 + 10.0 + 5.0 + 10.0) + 1.0;
        assert!((estimate - expected).abs() < 1e-9);
    }

    #[test]
    fn test_estimate_zero_when_nothing_enabled() {
        let cfg = test_config(vec![ChannelState::Inactive; 4]);
        assert_eq!(SweepStrategy::estimate_total_seconds(&cfg, 0), 0.0);
    }

    #[test]
    fn test_sampled_counts_as_enabled() {
        assert!(ChannelState::Sampled.is_enabled());
        assert!(ChannelState::Active.is_enabled());
        assert!(!ChannelState::Inactive.is_enabled());
    }
}
