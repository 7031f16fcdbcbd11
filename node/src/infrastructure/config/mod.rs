//! Configuration management for mesh nodes.
//!
//! Settings are assembled from defaults and `MESHWORK__*` environment
//! variables, for example `MESHWORK__NODE__NAME=billing-1` or
//! `MESHWORK__STORE__ENDPOINTS=http://etcd-0:2379,http://etcd-1:2379`.
//!
//! # Example
//!
//! ```
//! use meshwork::infrastructure::config::Settings;
//!
//! let settings = Settings::new().expect("Failed to load configuration");
//! ```

pub mod node;
pub mod store;
pub mod telemetry;
pub mod transport;

pub use node::NodeSettings;
pub use store::StoreSettings;
pub use telemetry::{LogFormat, TelemetrySettings};
pub use transport::{TlsSettings, TransportSettings};

use config::{Config, ConfigError, Environment};
use serde::Deserialize;

/// Top-level configuration for a mesh node.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Node identity and announce loop settings.
    pub node: NodeSettings,
    /// Coordination store settings.
    pub store: StoreSettings,
    /// Listener and outbound call settings.
    pub transport: TransportSettings,
    /// Telemetry settings.
    pub telemetry: TelemetrySettings,
}

impl Settings {
    /// Loads defaults overlaid with `MESHWORK__*` process environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be built or deserialized.
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_env(Environment::with_prefix("MESHWORK"))
    }

    /// Builds settings from defaults overlaid with the given environment source.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be built or deserialized.
    pub fn from_env(env: Environment) -> Result<Self, ConfigError> {
        let layered = Config::builder()
            .set_default("node.announce_interval_ms", 5_000)?
            .set_default("node.lease_ttl_secs", 15)?
            .set_default("node.weight", 1.0)?
            .set_default("store.endpoints", vec!["http://127.0.0.1:2379"])?
            .set_default("store.prefix", "")?
            .set_default("store.connect_timeout_ms", 30_000)?
            .set_default("transport.listen_addr", "0.0.0.0")?
            .set_default("transport.listen_port", 0)?
            .set_default("transport.retry_count", 1)?
            .set_default("transport.call_timeout_ms", 30_000)?
            .set_default("transport.drain_grace_ms", 5_000)?
            .set_default("telemetry.service_name", "meshwork")?
            .set_default("telemetry.log_level", "info")?
            .set_default("telemetry.log_format", "json")?
            .set_default("telemetry.sampling_ratio", 1.0)?
            // `MESHWORK__STORE__ENDPOINTS` is a comma list
            .add_source(
                env.separator("__")
                    .list_separator(",")
                    .with_list_parse_key("store.endpoints")
                    .try_parsing(true),
            )
            .build()?;

        layered.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let source: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Environment::with_prefix("MESHWORK").source(Some(source))
    }

    #[test]
    fn test_defaults() -> anyhow::Result<()> {
        let settings = Settings::from_env(env(&[]))?;
        assert_eq!(settings.node.announce_interval_ms, 5_000);
        assert_eq!(settings.node.lease_ttl_secs, 15);
        assert!(settings.node.name.is_none());
        assert_eq!(settings.store.endpoints, vec!["http://127.0.0.1:2379".to_string()]);
        assert_eq!(settings.transport.listen_port, 0);
        assert_eq!(settings.transport.retry_count, 1);
        assert_eq!(settings.telemetry.service_name, "meshwork");
        assert_eq!(settings.telemetry.log_format, LogFormat::Json);
        Ok(())
    }

    #[test]
    fn test_environment_overrides() -> anyhow::Result<()> {
        let settings = Settings::from_env(env(&[
            ("MESHWORK__NODE__NAME", "billing-1"),
            ("MESHWORK__STORE__ENDPOINTS", "http://a:2379,http://b:2379"),
            ("MESHWORK__STORE__PREFIX", "prod/"),
            ("MESHWORK__TRANSPORT__LISTEN_PORT", "7000"),
            ("MESHWORK__TRANSPORT__RETRY_COUNT", "3"),
            ("MESHWORK__TELEMETRY__LOG_FORMAT", "plain"),
        ]))?;
        assert_eq!(settings.node.name.as_deref(), Some("billing-1"));
        assert_eq!(settings.store.endpoints.len(), 2);
        assert_eq!(settings.store.prefix, "prod/");
        assert_eq!(settings.transport.listen_port, 7000);
        assert_eq!(settings.transport.retry_count, 3);
        assert_eq!(settings.telemetry.log_format, LogFormat::Plain);
        Ok(())
    }
}
