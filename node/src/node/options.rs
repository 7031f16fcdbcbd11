//! Node options.

use super::name::NodeName;
use crate::error::MeshError;
use crate::infrastructure::config::Settings;
use crate::transport::TransportSecurity;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Options of one mesh node.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Node name; generated when unset.
    pub name: Option<NodeName>,
    /// Prefix placed in front of every coordination store key.
    pub store_prefix: String,
    /// TTL of the announcement lease.
    pub lease_ttl_secs: i64,
    /// Delay between announce ticks.
    pub announce_interval: Duration,
    /// Load balancing weight advertised with each entry.
    pub weight: Option<f64>,
    /// Address the transport listener binds to.
    pub listen_addr: IpAddr,
    /// Port the transport listener binds to; 0 picks a free port.
    pub listen_port: u16,
    /// `host:port` advertised to other nodes; defaults to the bound address.
    pub advertise_host: Option<String>,
    /// Attempts made for each outbound unary call unless overridden per call.
    pub retry_count: u32,
    /// Deadline for outbound unary calls.
    pub call_timeout: Duration,
    /// Grace period for draining in-flight calls on destroy.
    pub drain_grace: Duration,
    /// Transport-layer certificates.
    pub security: TransportSecurity,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            name: None,
            store_prefix: String::new(),
            lease_ttl_secs: 15,
            announce_interval: Duration::from_secs(5),
            weight: None,
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 0,
            advertise_host: None,
            retry_count: 1,
            call_timeout: Duration::from_secs(30),
            drain_grace: Duration::from_secs(5),
            security: TransportSecurity::default(),
        }
    }
}

impl NodeOptions {
    /// Builds options from loaded settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the node name or listen address is invalid, or a
    /// TLS file cannot be read.
    pub fn from_settings(settings: &Settings) -> Result<Self, MeshError> {
        let name = settings
            .node
            .name
            .as_deref()
            .map(NodeName::parse)
            .transpose()
            .map_err(|e| MeshError::Config(e.to_string()))?;
        let listen_addr = settings.transport.listen_addr.parse().map_err(|e| {
            MeshError::Config(format!(
                "invalid listen address '{}': {e}",
                settings.transport.listen_addr
            ))
        })?;
        let weight = settings.node.weight;

        Ok(Self {
            name,
            store_prefix: settings.store.prefix.clone(),
            lease_ttl_secs: settings.node.lease_ttl_secs,
            announce_interval: Duration::from_millis(settings.node.announce_interval_ms),
            weight: (weight.is_finite() && (weight - 1.0).abs() > f64::EPSILON).then_some(weight),
            listen_addr,
            listen_port: settings.transport.listen_port,
            advertise_host: settings.transport.advertise_host.clone(),
            retry_count: settings.transport.retry_count.max(1),
            call_timeout: Duration::from_millis(settings.transport.call_timeout_ms),
            drain_grace: Duration::from_millis(settings.transport.drain_grace_ms),
            security: TransportSecurity::from_settings(&settings.transport.tls)?,
        })
    }

    /// Sets the node name.
    #[must_use]
    pub fn with_name(mut self, name: NodeName) -> Self {
        self.name = Some(name);
        self
    }

    /// Sets the coordination store key prefix.
    #[must_use]
    pub fn with_store_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.store_prefix = prefix.into();
        self
    }

    /// Sets the announce interval.
    #[must_use]
    pub fn with_announce_interval(mut self, interval: Duration) -> Self {
        self.announce_interval = interval;
        self
    }

    /// Sets the lease TTL in seconds.
    #[must_use]
    pub fn with_lease_ttl(mut self, secs: i64) -> Self {
        self.lease_ttl_secs = secs;
        self
    }

    /// Sets the advertised load balancing weight.
    #[must_use]
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Sets the listen address and port.
    #[must_use]
    pub fn with_listen(mut self, addr: IpAddr, port: u16) -> Self {
        self.listen_addr = addr;
        self.listen_port = port;
        self
    }

    /// Sets the host advertised to other nodes.
    #[must_use]
    pub fn with_advertise_host(mut self, host: impl Into<String>) -> Self {
        self.advertise_host = Some(host.into());
        self
    }

    /// Sets the default attempt count for unary calls.
    #[must_use]
    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = count.max(1);
        self
    }

    /// Sets the deadline for unary calls.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Sets the drain grace period used when the node is dropped by the binary.
    #[must_use]
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Sets transport-layer certificates.
    #[must_use]
    pub fn with_security(mut self, security: TransportSecurity) -> Self {
        self.security = security;
        self
    }
}
