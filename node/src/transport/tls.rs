//! Transport-layer certificates.

use crate::error::MeshError;
use crate::infrastructure::config::TlsSettings;
use std::fmt;
use std::path::Path;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

/// A PEM certificate chain and its private key.
#[derive(Clone)]
pub struct KeyCertPair {
    /// PEM certificate chain.
    pub cert_pem: Vec<u8>,
    /// PEM private key.
    pub private_key_pem: Vec<u8>,
}

impl fmt::Debug for KeyCertPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCertPair")
            .field("cert_pem", &format_args!("{} bytes", self.cert_pem.len()))
            .field("private_key_pem", &"[REDACTED]")
            .finish()
    }
}

/// Certificates used by a node's server and client.
///
/// The default is plaintext HTTP/2 in both directions.
#[derive(Clone, Default)]
pub struct TransportSecurity {
    /// PEM root certificates clients verify servers against, and servers
    /// verify client certificates against.
    pub root_certs: Option<Vec<u8>>,
    /// Identities presented by this node; the first one is used.
    pub key_cert_pairs: Vec<KeyCertPair>,
    /// Require and verify client certificates on the server.
    pub check_client_certificate: bool,
    /// Name expected in server certificates, when it differs from the host.
    pub domain_name: Option<String>,
}

impl fmt::Debug for TransportSecurity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSecurity")
            .field("root_certs", &self.root_certs.as_ref().map(Vec::len))
            .field("key_cert_pairs", &self.key_cert_pairs)
            .field("check_client_certificate", &self.check_client_certificate)
            .field("domain_name", &self.domain_name)
            .finish()
    }
}

impl TransportSecurity {
    /// Reads the PEM files named in `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Config`] if a file cannot be read, or only one of
    /// `cert_file` and `key_file` is set.
    pub fn from_settings(settings: &TlsSettings) -> Result<Self, MeshError> {
        let identity = match (&settings.cert_file, &settings.key_file) {
            (Some(cert), Some(key)) => Some(KeyCertPair {
                cert_pem: read_pem(cert)?,
                private_key_pem: read_pem(key)?,
            }),
            (None, None) => None,
            _ => {
                return Err(MeshError::Config(
                    "tls cert_file and key_file must be set together".to_string(),
                ))
            }
        };
        Ok(Self {
            root_certs: settings.ca_file.as_deref().map(read_pem).transpose()?,
            key_cert_pairs: identity.into_iter().collect(),
            check_client_certificate: settings.check_client_certificate,
            domain_name: settings.domain_name.clone(),
        })
    }

    /// URI scheme clients use to reach a node with these settings.
    #[must_use]
    pub fn scheme(&self) -> &'static str {
        if self.root_certs.is_some() {
            "https"
        } else {
            "http"
        }
    }

    /// TLS configuration of the server, or `None` for plaintext.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Transport`] if client certificates must be
    /// checked but no root certificate is configured.
    pub fn server_config(&self) -> Result<Option<ServerTlsConfig>, MeshError> {
        let Some(pair) = self.key_cert_pairs.first() else {
            return Ok(None);
        };
        let mut config = ServerTlsConfig::new()
            .identity(Identity::from_pem(&pair.cert_pem, &pair.private_key_pem));
        if self.check_client_certificate {
            let roots = self.root_certs.as_ref().ok_or_else(|| {
                MeshError::Transport(
                    "checking client certificates requires root certificates".to_string(),
                )
            })?;
            config = config.client_ca_root(Certificate::from_pem(roots));
        }
        Ok(Some(config))
    }

    /// TLS configuration of outbound channels, or `None` for plaintext.
    #[must_use]
    pub fn client_config(&self) -> Option<ClientTlsConfig> {
        let roots = self.root_certs.as_ref()?;
        let mut config = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(roots));
        if let Some(pair) = self.key_cert_pairs.first() {
            config = config.identity(Identity::from_pem(&pair.cert_pem, &pair.private_key_pem));
        }
        if let Some(domain) = &self.domain_name {
            config = config.domain_name(domain.clone());
        }
        Some(config)
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, MeshError> {
    std::fs::read(path).map_err(|e| MeshError::Config(format!("cannot read {}: {e}", path.display())))
}
