//! Simulated hardware for headless runs and tests.
//!
//! `SimAnalyzer` and `SimMotion` implement the engine's hardware seams with
//! in-memory state: configurable status codes, scripted readings, failure
//! injection and a full call log for assertions.

use crate::core::{
    AnalyzerClient, DeviceStatus, GasComponent, LiveReading, MotionDriver, ReadingTimestamp,
    STATUS_IDLE,
};
use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Analyzer status code while a measurement task runs.
const STATUS_MEASURING: i32 = 3;

/// In-memory analyzer with scripted behavior.
pub struct SimAnalyzer {
    status: Mutex<Option<DeviceStatus>>,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
    commands: Mutex<Vec<String>>,
    next_epoch: Mutex<f64>,
}

impl SimAnalyzer {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(Some(DeviceStatus {
                online: true,
                status_code: STATUS_IDLE,
            })),
            fail_start: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            commands: Mutex::new(Vec::new()),
            next_epoch: Mutex::new(1_700_000_000.0),
        }
    }

    /// Force a specific status code, e.g. to simulate a mid-run fault.
    pub fn set_status_code(&self, code: i32) {
        if let Ok(mut status) = self.status.lock() {
            *status = Some(DeviceStatus {
                online: true,
                status_code: code,
            });
        }
    }

    /// Simulate a dropped TCP link.
    pub fn set_offline(&self) {
        if let Ok(mut status) = self.status.lock() {
            *status = None;
        }
    }

    pub fn fail_next_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_stop(&self) {
        self.fail_stop.store(true, Ordering::SeqCst);
    }

    /// Commands issued so far, in order.
    pub fn command_log(&self) -> Vec<String> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, command: String) {
        debug!(%command, "sim analyzer command");
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(command);
        }
    }

    /// Next scripted live reading, with a monotonically advancing epoch
    /// timestamp and randomized concentrations.
    pub fn next_reading(&self) -> LiveReading {
        let epoch = {
            let mut next = match self.next_epoch.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *next += 1.0;
            *next
        };
        let mut rng = rand::thread_rng();
        LiveReading {
            timestamp: ReadingTimestamp::Epoch(epoch),
            components: vec![
                GasComponent {
                    cas: "74-82-8".to_string(),
                    label: "CH4".to_string(),
                    ppm: rng.gen_range(1.8..2.2),
                },
                GasComponent {
                    cas: "124-38-9".to_string(),
                    label: "CO2".to_string(),
                    ppm: rng.gen_range(400.0..450.0),
                },
                GasComponent {
                    cas: "10024-97-2".to_string(),
                    label: "N2O".to_string(),
                    ppm: rng.gen_range(0.3..0.4),
                },
            ],
        }
    }

    /// The same reading twice, for duplicate-suppression scenarios.
    pub fn repeat_last_reading(&self) -> LiveReading {
        let epoch = self
            .next_epoch
            .lock()
            .map(|e| *e)
            .unwrap_or(1_700_000_000.0);
        let mut reading = self.next_reading();
        reading.timestamp = ReadingTimestamp::Epoch(epoch);
        reading
    }
}

impl Default for SimAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AnalyzerClient for SimAnalyzer {
    async fn start_measurement(&self, task_id: &str) -> Result<()> {
        self.record(format!("start {task_id}"));
        if self.fail_start.swap(false, Ordering::SeqCst) {
            bail!("simulated start failure");
        }
        self.set_status_code(STATUS_MEASURING);
        Ok(())
    }

    async fn stop_measurement(&self) -> Result<()> {
        self.record("stop".to_string());
        if self.fail_stop.swap(false, Ordering::SeqCst) {
            bail!("simulated stop failure");
        }
        self.set_status_code(STATUS_IDLE);
        Ok(())
    }

    async fn status(&self) -> Option<DeviceStatus> {
        self.status.lock().ok().and_then(|s| *s)
    }

    async fn set_online_mode(&self, enabled: bool) -> Result<()> {
        self.record(format!("online_mode {enabled}"));
        Ok(())
    }
}

/// In-memory motion layer recording every call.
pub struct SimMotion {
    calls: Mutex<Vec<(String, String)>>,
    latency: Duration,
}

impl SimMotion {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
        }
    }

    /// Add a per-call delay to exercise timing-sensitive paths.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            latency,
        }
    }

    /// All (operation, unit) calls so far, in order.
    pub fn call_log(&self) -> Vec<(String, String)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Count of one operation kind ("home", "step" or "reset").
    pub fn count(&self, op: &str) -> usize {
        self.call_log().iter().filter(|(o, _)| o == op).count()
    }

    async fn record(&self, op: &str, unit: &str) {
        debug!(op, unit, "sim motion call");
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((op.to_string(), unit.to_string()));
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl Default for SimMotion {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MotionDriver for SimMotion {
    async fn home(&self, unit: &str) {
        self.record("home", unit).await;
    }

    async fn step(&self, unit: &str) {
        self.record("step", unit).await;
    }

    async fn reset(&self, unit: &str) {
        self.record("reset", unit).await;
    }
}
