//! Core library for the gasrig sampling controller.
//!
//! This library contains the acquisition run engine, the crash-safe
//! measurement logger, and the hardware-facing traits for a laboratory
//! gas-analyzer sampling rig. It is used by the on-device binary and by
//! the integration tests, which drive the engine against simulated
//! hardware.

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod logger;
pub mod sim;
