//! Core traits and data types for the sampling rig.
//!
//! This module defines the seams between the run engine and its external
//! collaborators. The engine never talks to hardware directly; everything it
//! needs is behind one of three constructor-injected traits:
//!
//! - [`AnalyzerClient`]: the gas analyzer's line-based TCP control surface
//!   (start/stop measurement, status, online mode).
//! - [`MotionDriver`]: the rotary multiplexer or linear-actuator motion
//!   layer. Calls have no completion callback; the engine infers settling
//!   with its own bounded waits.
//! - [`Feedback`]: short audible/haptic cues for the operator.
//!
//! # Thread Safety
//!
//! All traits require `Send + Sync` so the worker task and the control plane
//! can share them across tasks.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Analyzer status code meaning "idle, ready for a new measurement task".
pub const STATUS_IDLE: i32 = 2;

/// Status codes in which the analyzer is not actively measuring.
///
/// Seeing one of these mid-run means the device was stopped or faulted
/// behind the engine's back, and the run must abort.
pub const STOPPED_STATUS_CODES: [i32; 4] = [1, 2, 4, 7];

/// Default settle delay after any analyzer command. The device firmware
/// needs this long to process a command before it accepts the next one.
pub const DEVICE_CMD_SETTLE: Duration = Duration::from_secs(1);

/// Latest known analyzer state, as reported by the status poller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Whether the TCP link is up and the device answers status queries.
    pub online: bool,
    /// Raw device status code.
    pub status_code: i32,
}

impl DeviceStatus {
    /// True when the analyzer is ready to accept a new measurement command.
    pub fn is_idle(&self) -> bool {
        self.online && self.status_code == STATUS_IDLE
    }

    /// True when the analyzer reports one of the not-measuring states.
    pub fn is_stopped(&self) -> bool {
        self.online && STOPPED_STATUS_CODES.contains(&self.status_code)
    }
}

/// One gas component of a live reading.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GasComponent {
    /// CAS registry number of the gas.
    pub cas: String,
    /// Human-readable label, used as the log column header.
    pub label: String,
    /// Concentration in parts per million.
    pub ppm: f64,
}

/// Device-reported timestamp of a reading.
///
/// Current firmware reports UNIX epoch seconds; older firmware returns a
/// readable string. Both forms are accepted, and the parsed value is the
/// authoritative de-duplication key in the measurement logger.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReadingTimestamp {
    /// UNIX epoch seconds (primary firmware format).
    Epoch(f64),
    /// Readable timestamp string (legacy firmware).
    Text(String),
}

/// One live measurement snapshot from the analyzer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LiveReading {
    /// Device-reported acquisition timestamp.
    pub timestamp: ReadingTimestamp,
    /// Detected gas components, in device order.
    pub components: Vec<GasComponent>,
}

/// Client for the analyzer's TCP control protocol.
///
/// The protocol grammar itself lives behind this trait; the engine only
/// relies on the command/status contract. Every command issued through this
/// trait must be followed by the engine's settle delay before the next one.
#[async_trait]
pub trait AnalyzerClient: Send + Sync {
    /// Start the measurement task with the given device task id.
    async fn start_measurement(&self, task_id: &str) -> Result<()>;

    /// Stop the running measurement task.
    async fn stop_measurement(&self) -> Result<()>;

    /// Latest polled device status, `None` if no status has been seen yet.
    async fn status(&self) -> Option<DeviceStatus>;

    /// Enable or disable the device's online results mode.
    async fn set_online_mode(&self, enabled: bool) -> Result<()>;
}

/// Motion layer for the sampling hardware.
///
/// Calls may block for seconds while hardware settles, must be idempotent,
/// and must be safe to issue while a previous move is still settling. There
/// is no completion feedback; the engine owns the wait.
#[async_trait]
pub trait MotionDriver: Send + Sync {
    /// Drive the unit to its home position.
    async fn home(&self, unit: &str);

    /// Advance the unit one position (multiplexer) or extend it (actuator).
    async fn step(&self, unit: &str);

    /// Release the unit's drive outputs after a move.
    async fn reset(&self, unit: &str);
}

/// Operator feedback cues.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cue {
    /// Command rejected because a run is active.
    Busy,
    /// Command rejected because the configuration is invalid.
    Invalid,
    /// A device command failed.
    Error,
    /// A switch/extend move is starting.
    Step,
    /// A homing move is starting.
    Home,
    /// A run was aborted.
    Cancel,
    /// A run or cycle completed.
    Completed,
}

/// Sink for operator feedback cues (a piezo buzzer on the real rig).
pub trait Feedback: Send + Sync {
    /// Play a cue. Must not block.
    fn cue(&self, cue: Cue);
}

/// No-op feedback sink for headless and test use.
pub struct SilentFeedback;

impl Feedback for SilentFeedback {
    fn cue(&self, _cue: Cue) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_status_idle() {
        let st = DeviceStatus {
            online: true,
            status_code: STATUS_IDLE,
        };
        assert!(st.is_idle());
        assert!(st.is_stopped());
    }

    #[test]
    fn test_device_status_offline_never_idle() {
        let st = DeviceStatus {
            online: false,
            status_code: STATUS_IDLE,
        };
        assert!(!st.is_idle());
        assert!(!st.is_stopped());
    }

    #[test]
    fn test_device_status_measuring_is_not_stopped() {
        let st = DeviceStatus {
            online: true,
            status_code: 3,
        };
        assert!(!st.is_idle());
        assert!(!st.is_stopped());
    }

    #[test]
    fn test_reading_timestamp_deserializes_both_forms() {
        let epoch: ReadingTimestamp = serde_json::from_str("1716891000.5").unwrap();
        assert_eq!(epoch, ReadingTimestamp::Epoch(1716891000.5));

        let text: ReadingTimestamp = serde_json::from_str("\"2024-05-28 10:30:00\"").unwrap();
        assert_eq!(
            text,
            ReadingTimestamp::Text("2024-05-28 10:30:00".to_string())
        );
    }
}
