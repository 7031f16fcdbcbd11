//! Infrastructure components (config, telemetry).

pub mod config;
/// Logging and trace export setup.
pub mod telemetry;
