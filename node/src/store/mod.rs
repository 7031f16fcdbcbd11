//! Coordination store abstraction.
//!
//! Announcement and discovery only need a small slice of a distributed
//! key-value store: leases, leased puts, prefix reads and prefix watches.
//! [`EtcdStore`] talks to a real etcd cluster; [`MemoryStore`] keeps everything
//! in process.

mod etcd;
mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// Identifier of a store lease.
pub type LeaseId = i64;

/// A change observed under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A key was created or overwritten.
    Put {
        /// Full key.
        key: String,
        /// New value.
        value: Vec<u8>,
    },
    /// A key was removed, explicitly or by lease expiry.
    Delete {
        /// Full key.
        key: String,
    },
}

/// Ordered stream of watch events. An error item ends the watch.
pub type WatchStream = BoxStream<'static, Result<WatchEvent, StoreError>>;

/// Errors reported by a coordination store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("Store Unavailable: {0}")]
    Unavailable(String),
    /// The lease expired or was revoked.
    #[error("Lease Not Found: {0}")]
    LeaseNotFound(LeaseId),
    /// The watch was cancelled by the store.
    #[error("Watch Cancelled: {0}")]
    WatchCancelled(String),
    /// Any other backend failure.
    #[error("Store Error: {0}")]
    Backend(String),
}

/// Lease, key-value and watch primitives used by the mesh.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Grants a lease that expires after `ttl_secs` unless renewed.
    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId, StoreError>;

    /// Renews a lease for another full TTL.
    ///
    /// Returns [`StoreError::LeaseNotFound`] if the lease is gone.
    async fn keep_alive(&self, lease: LeaseId) -> Result<(), StoreError>;

    /// Revokes a lease, deleting every key written under it.
    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError>;

    /// Writes a key, optionally bound to a lease.
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<(), StoreError>;

    /// Reads every key under a prefix, sorted by key.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Deletes a single key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Watches every key under a prefix, starting from now.
    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, StoreError>;
}
