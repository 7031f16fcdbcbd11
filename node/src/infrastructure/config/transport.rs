//! Transport listener and outbound call configuration.

use serde::Deserialize;
use std::path::PathBuf;

/// Transport settings.
#[derive(Debug, Deserialize, Clone)]
pub struct TransportSettings {
    /// Address the gRPC listener binds to.
    pub listen_addr: String,
    /// Port the gRPC listener binds to; 0 picks a free port.
    pub listen_port: u16,
    /// Host advertised to other nodes instead of the listen address.
    pub advertise_host: Option<String>,
    /// Attempts made for each outbound unary call.
    pub retry_count: u32,
    /// Deadline for outbound unary calls, in milliseconds.
    pub call_timeout_ms: u64,
    /// Grace period for draining in-flight calls on shutdown, in milliseconds.
    pub drain_grace_ms: u64,
    /// Certificates; plaintext when empty.
    #[serde(default)]
    pub tls: TlsSettings,
}

/// PEM files securing the transport, e.g. `MESHWORK__TRANSPORT__TLS__CA_FILE`.
///
/// With `ca_file` set, clients dial `https` and verify servers against it.
/// With `cert_file` and `key_file` set, the node serves TLS with that identity
/// and presents it to servers asking for client certificates.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TlsSettings {
    /// Root certificates.
    pub ca_file: Option<PathBuf>,
    /// Certificate chain of this node.
    pub cert_file: Option<PathBuf>,
    /// Private key of this node.
    pub key_file: Option<PathBuf>,
    /// Reject clients without a certificate signed by `ca_file`.
    #[serde(default)]
    pub check_client_certificate: bool,
    /// Name expected in server certificates, when it differs from the host.
    pub domain_name: Option<String>,
}
