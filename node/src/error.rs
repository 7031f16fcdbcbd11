//! Error taxonomy for mesh operations.
//!
//! Every failure a caller of the mesh can observe is a [`MeshError`]. Handler
//! code is free to use `anyhow`; the transport boundary turns those errors into
//! wire statuses and the calling side turns statuses back into `MeshError`.

use crate::schema::wire::WireError;
use crate::store::StoreError;
use tonic::{Code, Status};

/// Errors that can occur while registering, calling, or serving mesh methods.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MeshError {
    /// A method could not be registered (invalid schema, entry or handler kind).
    #[error("Registration Error: {0}")]
    Registration(String),
    /// No live provider exists for the entry.
    #[error("Entry Not Found: {0}")]
    EntryNotFound(String),
    /// The remote handler failed; `message` is the remote error text.
    #[error("Remote Call Error ({entry}): {message}")]
    RemoteCall {
        /// Entry that was called.
        entry: String,
        /// Message carried across the wire.
        message: String,
    },
    /// Every retry attempt failed; `last` is the final underlying failure.
    #[error("Retry Exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Failure of the final attempt.
        last: Box<MeshError>,
    },
    /// The call did not complete before its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),
    /// Connection, bind or credential failure at the wire layer.
    #[error("Transport Error: {0}")]
    Transport(String),
    /// The caller's own request stream failed; the call was abandoned.
    #[error("Input Error: {0}")]
    Input(String),
    /// Invalid node options or settings.
    #[error("Configuration Error: {0}")]
    Config(String),
    /// Coordination store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A value did not match its wire schema.
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl MeshError {
    /// Returns the underlying failure, looking through retry exhaustion.
    #[must_use]
    pub fn root(&self) -> &MeshError {
        match self {
            Self::RetryExhausted { last, .. } => last.root(),
            other => other,
        }
    }

    /// Returns `true` if the failure was raised by the remote handler itself.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self.root(), Self::RemoteCall { .. })
    }

    /// Maps a wire status received while calling `entry` into the taxonomy.
    #[must_use]
    pub fn from_status(entry: &str, status: &Status) -> Self {
        match status.code() {
            Code::Unavailable => Self::Transport(format!("{entry}: {}", status.message())),
            Code::DeadlineExceeded | Code::Cancelled => {
                Self::Timeout(format!("{entry}: {}", status.message()))
            }
            Code::Unimplemented | Code::NotFound => Self::EntryNotFound(entry.to_string()),
            _ => Self::RemoteCall {
                entry: entry.to_string(),
                message: status.message().to_string(),
            },
        }
    }
}

impl From<tonic::transport::Error> for MeshError {
    fn from(err: tonic::transport::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
