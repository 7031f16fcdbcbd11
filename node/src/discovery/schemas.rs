use super::keys::KeyLayout;
use crate::error::MeshError;
use crate::schema::MethodSchema;
use crate::store::{CoordinationStore, StoreError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

type Slot = Arc<OnceCell<Arc<MethodSchema>>>;

/// Schemas by hash, fetched at most once per hash.
///
/// Concurrent lookups of a missing hash share one fetch. A failed fetch leaves
/// the slot empty so the next lookup tries again.
pub struct SchemaCache {
    store: Arc<dyn CoordinationStore>,
    keys: KeyLayout,
    slots: Mutex<HashMap<String, Slot>>,
}

impl SchemaCache {
    /// Creates an empty cache reading from `store`.
    #[must_use]
    pub fn new(store: Arc<dyn CoordinationStore>, keys: KeyLayout) -> Self {
        Self {
            store,
            keys,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the schema for `hash`.
    ///
    /// The store is read first; when no copy is stored, `fallback` fetches the
    /// schema some other way (from the provider's meta method).
    ///
    /// # Errors
    ///
    /// Returns the store or fallback error, or [`StoreError::Backend`] for a
    /// stored blob that does not parse.
    pub async fn get<F, Fut>(&self, hash: &str, fallback: F) -> Result<Arc<MethodSchema>, MeshError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MethodSchema, MeshError>>,
    {
        let slot = self
            .slots
            .lock()
            .entry(hash.to_string())
            .or_default()
            .clone();
        slot.get_or_try_init(|| self.load(hash, fallback))
            .await
            .cloned()
    }

    async fn load<F, Fut>(&self, hash: &str, fallback: F) -> Result<Arc<MethodSchema>, MeshError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MethodSchema, MeshError>>,
    {
        let stored = self.store.get_prefix(&self.keys.proto_prefix(hash)).await?;
        let schema = match stored.into_iter().next() {
            Some((key, blob)) => serde_json::from_slice::<MethodSchema>(&blob)
                .map_err(|e| StoreError::Backend(format!("invalid schema at {key}: {e}")))?,
            None => {
                debug!(%hash, "Schema not stored, asking provider");
                fallback().await?
            }
        };

        match schema.hash() {
            Ok(actual) if actual != hash => {
                warn!(expected = %hash, %actual, "Schema hash mismatch");
            }
            Ok(_) => {}
            Err(e) => warn!(expected = %hash, error = %e, "Schema cannot be hashed"),
        }
        Ok(Arc::new(schema))
    }

    /// Number of schemas resolved so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    /// Returns `true` when no schema was resolved yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets every schema.
    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}
