//! Run progress snapshot and discrete lifecycle events.
//!
//! `Progress` is the continuous state external observers (UI, display, SSE)
//! poll at arbitrary rates; it must stay snapshot-safe, so every field is a
//! plain serializable value. `TaskEvent` carries the discrete transition
//! markers and is edge-triggered, not polled.

use serde::Serialize;

/// Engine sub-state within a run.
///
/// Exactly one phase holds at any instant. The serialized names are the
/// frontend contract; `Armed` goes out as `READY`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum Phase {
    /// Engine not active / ready.
    #[default]
    #[serde(rename = "IDLE")]
    Idle,
    /// Waiting for a user trigger between cycles.
    #[serde(rename = "READY")]
    Armed,
    /// Actuator or multiplexer homing.
    #[serde(rename = "HOMING")]
    Homing,
    /// Multiplexer switching or actuator movement.
    #[serde(rename = "SWITCHING")]
    Switching,
    /// Intentional dwell before measuring.
    #[serde(rename = "PAUSED")]
    Paused,
    /// Gas sampling in progress.
    #[serde(rename = "MEASURING")]
    Measuring,
    /// Run aborted by user or error; transient during shutdown.
    #[serde(rename = "ABORTED")]
    Aborted,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Idle => "IDLE",
            Phase::Armed => "READY",
            Phase::Homing => "HOMING",
            Phase::Switching => "SWITCHING",
            Phase::Paused => "PAUSED",
            Phase::Measuring => "MEASURING",
            Phase::Aborted => "ABORTED",
        };
        write!(f, "{name}")
    }
}

/// Discrete, semantic lifecycle moments emitted by the engine.
///
/// Not continuous state: consumers must treat these as edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskEvent {
    /// A run was accepted and the worker is starting.
    TaskStarted,
    /// Cycle engine armed, waiting for the user trigger.
    WaitingForTrigger,
    /// One triggered cycle began.
    CycleStarted,
    /// One triggered cycle completed.
    CycleFinished,
    /// Run ended normally.
    TaskFinished,
    /// Run aborted by user or error.
    TaskAborted,
    /// Unrecoverable worker error.
    Error,
}

/// Serializable snapshot of a run's progress.
///
/// Written only by the engine's worker task; readers always receive a clone.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Progress {
    /// Current engine phase.
    pub phase: Phase,
    /// Index of the unit (channel or actuator) being worked on.
    pub current_unit: usize,
    /// Index of the unit that will be visited next, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_unit: Option<usize>,
    /// Progress within the current repeat or cycle, 0..=100.
    pub percent: u8,
    /// Progress across the whole run, 0..=100. Mirrors `percent` for
    /// unbounded triggered-cycle runs.
    pub overall_percent: u8,
    /// Completed repeats (sweep) or completed cycles (triggered).
    pub repeat_index: u32,
    /// Configured repeat total; mirrors `repeat_index` for unbounded runs.
    pub repeat_total: u32,
    /// Number of enabled units in this run.
    pub enabled_count: u32,
    /// Total completed measurements, monotonic across repeats.
    pub step_index: u32,
    /// `repeat_total * enabled_count` for sweeps; per-cycle steps otherwise.
    pub total_steps: u32,
    /// Seconds elapsed in the current run or cycle.
    pub elapsed_seconds: f64,
    /// Estimated total run time in seconds, when one can be computed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_estimate_seconds: Option<f64>,
}

impl Progress {
    /// Reset everything for a new run. The per-repeat and per-cycle resets
    /// are narrower and live in the respective run loops.
    pub fn reset_all(&mut self) {
        *self = Progress::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_armed_serializes_as_ready() {
        let json = serde_json::to_string(&Phase::Armed).unwrap();
        assert_eq!(json, "\"READY\"");
        assert_eq!(Phase::Armed.to_string(), "READY");
    }

    #[test]
    fn test_progress_snapshot_serializes() {
        let mut p = Progress::default();
        p.phase = Phase::Measuring;
        p.total_estimate_seconds = Some(120.0);
        let value = serde_json::to_value(&p).unwrap();
        assert_eq!(value["phase"], "MEASURING");
        assert_eq!(value["total_estimate_seconds"], 120.0);
    }

    #[test]
    fn test_reset_all_clears_runtime_and_totals() {
        let mut p = Progress {
            phase: Phase::Measuring,
            current_unit: 4,
            step_index: 5,
            percent: 60,
            repeat_total: 3,
            total_steps: 9,
            enabled_count: 3,
            total_estimate_seconds: Some(55.0),
            ..Progress::default()
        };
        p.reset_all();
        assert_eq!(p.phase, Phase::Idle);
        assert_eq!(p.step_index, 0);
        assert_eq!(p.percent, 0);
        assert_eq!(p.repeat_total, 0);
        assert_eq!(p.total_steps, 0);
        assert!(p.total_estimate_seconds.is_none());
    }
}
