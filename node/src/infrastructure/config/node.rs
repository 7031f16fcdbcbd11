//! Node identity and announce loop configuration.

use serde::Deserialize;

/// Node settings.
#[derive(Debug, Deserialize, Clone)]
pub struct NodeSettings {
    /// Node name; a random one is generated when unset.
    pub name: Option<String>,
    /// Delay between announce ticks, in milliseconds.
    pub announce_interval_ms: u64,
    /// TTL of the announcement lease, in seconds.
    pub lease_ttl_secs: i64,
    /// Load balancing weight advertised for every entry of this node.
    pub weight: f64,
}
