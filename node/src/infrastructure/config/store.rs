//! Coordination store configuration.

use secrecy::SecretString;
use serde::Deserialize;

/// Coordination store (etcd) settings.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreSettings {
    /// etcd endpoints.
    pub endpoints: Vec<String>,
    /// Prefix placed in front of every mesh key.
    pub prefix: String,
    /// Username for etcd authentication.
    pub user: Option<String>,
    /// Password for etcd authentication.
    pub password: Option<SecretString>,
    /// How long to keep retrying the initial connection, in milliseconds.
    pub connect_timeout_ms: u64,
}
