//! Layered application configuration.
//!
//! Settings are built from three layers, later layers overriding earlier
//! ones: compiled-in defaults, an optional TOML file, and environment
//! variables prefixed with `GASRIG_` (nested keys separated by `__`, e.g.
//! `GASRIG_ACQUISITION__MEASURE_SECONDS=30`).
//!
//! A `validate()` pass runs after deserialization so that values which parse
//! but are logically wrong (zero measurement duration, empty actuator list)
//! are rejected with a clear message before any hardware is touched.

use crate::error::{AppResult, RigError};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How the analyzer measurement is scoped during a triggered-cycle run.
///
/// The device firmware offers two acquisition modes with different
/// settle-time and throughput trade-offs, so this is an explicit choice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStartScope {
    /// Start the measurement once for the whole task, stop at finalization.
    PerTask,
    /// Start and stop the measurement around every individual cycle.
    PerCycle,
}

/// Parameters shared by both run variants plus the sweep-specific ones.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    /// Dwell time per measurement, in seconds.
    pub measure_seconds: f64,
    /// Settling pause before each measurement, in seconds.
    pub pause_seconds: f64,
    /// Number of full sweeps over the enabled channels.
    pub repeat_count: u32,
    /// Pneumatic settle time after a multiplexer switch, in seconds.
    pub switch_settle_seconds: f64,
    /// Total multiplexer positions (two-mux cascade: 16 + 15).
    pub channel_count: usize,
    /// Motion unit id driven during sweeps.
    pub sweep_unit: String,
    /// Store results on the device instead of streaming them (inverts the
    /// analyzer's online mode).
    pub save_on_device: bool,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            measure_seconds: 100.0,
            pause_seconds: 5.0,
            repeat_count: 1,
            switch_settle_seconds: 5.0,
            channel_count: 31,
            sweep_unit: "mux".to_string(),
            save_on_device: false,
        }
    }
}

/// Parameters for the user-triggered two-actuator variant.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleSettings {
    /// Actuator unit ids, in cycle order.
    pub actuator_ids: Vec<String>,
    /// Bounded wait for a single actuator move, in seconds.
    pub move_timeout_seconds: f64,
    /// Whether the analyzer runs per task or per cycle.
    pub device_start: DeviceStartScope,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            actuator_ids: vec!["left".to_string(), "right".to_string()],
            move_timeout_seconds: 10.0,
            device_start: DeviceStartScope::PerCycle,
        }
    }
}

/// Measurement log storage layout.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Root directory for finished logs; segments live in `.tmp` below it.
    pub log_root: PathBuf,
    /// Segment rotation boundary, in seconds.
    pub segment_rotation_seconds: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            log_root: PathBuf::from("/data/logs"),
            segment_rotation_seconds: 3600,
        }
    }
}

/// Analyzer command parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Device task id passed to the start-measurement command.
    pub task_id: String,
    /// Settle delay after each device command, in seconds.
    pub command_settle_seconds: f64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            task_id: "11".to_string(),
            command_settle_seconds: 1.0,
        }
    }
}

/// Root settings object, shared as `Arc<Settings>`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub acquisition: AcquisitionSettings,
    pub cycle: CycleSettings,
    pub storage: StorageSettings,
    pub device: DeviceSettings,
}

impl Settings {
    /// Build settings from defaults, an optional TOML file and environment.
    pub fn new(config_path: Option<&Path>) -> AppResult<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Settings::default())?);

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("GASRIG")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic validation of values that parse but make no sense.
    pub fn validate(&self) -> AppResult<()> {
        if self.acquisition.measure_seconds <= 0.0 {
            return Err(RigError::Configuration(
                "acquisition.measure_seconds must be positive".to_string(),
            ));
        }
        if self.acquisition.pause_seconds < 0.0 {
            return Err(RigError::Configuration(
                "acquisition.pause_seconds must not be negative".to_string(),
            ));
        }
        if self.acquisition.channel_count == 0 {
            return Err(RigError::Configuration(
                "acquisition.channel_count must be at least 1".to_string(),
            ));
        }
        if self.cycle.actuator_ids.is_empty() {
            return Err(RigError::Configuration(
                "cycle.actuator_ids must not be empty".to_string(),
            ));
        }
        if self.cycle.move_timeout_seconds <= 0.0 {
            return Err(RigError::Configuration(
                "cycle.move_timeout_seconds must be positive".to_string(),
            ));
        }
        if self.device.command_settle_seconds < 0.0 {
            return Err(RigError::Configuration(
                "device.command_settle_seconds must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_default_settings_are_valid() {
        let settings = Settings::new(None).unwrap();
        assert_eq!(settings.acquisition.channel_count, 31);
        assert_eq!(settings.cycle.actuator_ids.len(), 2);
        assert_eq!(settings.device.task_id, "11");
    }

    #[test]
    fn test_invalid_measure_duration_rejected() {
        let mut settings = Settings::default();
        settings.acquisition.measure_seconds = 0.0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("measure_seconds"));
    }

    #[test]
    fn test_empty_actuator_list_rejected() {
        let mut settings = Settings::default();
        settings.cycle.actuator_ids.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_environment_override() {
        std::env::set_var("GASRIG_ACQUISITION__REPEAT_COUNT", "4");
        let settings = Settings::new(None).unwrap();
        std::env::remove_var("GASRIG_ACQUISITION__REPEAT_COUNT");
        assert_eq!(settings.acquisition.repeat_count, 4);
    }
}
