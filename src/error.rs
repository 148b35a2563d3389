//! Custom error types for the application.
//!
//! This module defines two error families with different audiences:
//!
//! - [`RigError`] is the internal error type, built with `thiserror`. It
//!   consolidates configuration, I/O and analyzer failures so that internals
//!   can propagate them with `?`.
//! - [`CommandError`] is the control-plane rejection type. Every engine
//!   control operation (`start`, `abort`, `finish`, `trigger_repeat`) returns
//!   `Result<String, CommandError>`: a rejected command is a value, never a
//!   panic across the control boundary. The `Display` strings double as the
//!   user-visible rejection messages.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, RigError>;

/// Internal application error.
#[derive(Error, Debug)]
pub enum RigError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Analyzer error: {0}")]
    Analyzer(String),

    #[error("Measurement log error: {0}")]
    Log(String),
}

/// Synchronous rejection of an engine control command.
///
/// These are expected outcomes, not faults: calling `abort()` on an idle
/// engine is answered with [`CommandError::NotRunning`], and the caller is
/// expected to surface the message (plus an audible cue) to the operator.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CommandError {
    #[error("measurement already running")]
    AlreadyRunning,

    #[error("not running")]
    NotRunning,

    #[error("cycle already in progress")]
    CycleInProgress,

    #[error("finish only allowed while armed between cycles")]
    NotArmed,

    #[error("repeat trigger not supported for this run type")]
    TriggerUnsupported,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("analyzer command failed: {0}")]
    Device(String),

    #[error("measurement log could not be opened: {0}")]
    Logger(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_messages() {
        assert_eq!(CommandError::NotRunning.to_string(), "not running");
        assert_eq!(
            CommandError::CycleInProgress.to_string(),
            "cycle already in progress"
        );
    }

    #[test]
    fn test_rig_error_display() {
        let err = RigError::Analyzer("no response".to_string());
        assert_eq!(err.to_string(), "Analyzer error: no response");
    }
}
