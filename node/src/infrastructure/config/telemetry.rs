//! Logging and trace export settings.

use serde::Deserialize;

/// How log lines are rendered.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line, with span close events.
    #[default]
    Json,
    /// Compact human-readable lines on stderr.
    Plain,
}

/// Settings consumed by [`TelemetryBuilder`](crate::infrastructure::telemetry::TelemetryBuilder).
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetrySettings {
    /// `service.name` reported on exported spans.
    pub service_name: String,
    /// Filter directive used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Log line rendering.
    #[serde(default)]
    pub log_format: LogFormat,
    /// Collector receiving spans over OTLP/gRPC. Unset disables export.
    pub otlp_endpoint: Option<String>,
    /// Fraction of root spans kept, clamped to `0.0..=1.0`.
    pub sampling_ratio: f64,
}
