use super::keys::{Announcement, KeyLayout};
use crate::error::MeshError;
use crate::node::{EventBus, NodeEvent};
use crate::registry::{MethodRecord, MethodRegistry};
use crate::store::{CoordinationStore, LeaseId, StoreError};
use futures_util::future::{try_join_all, BoxFuture};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Default)]
struct AnnounceState {
    lease: Option<LeaseId>,
    announced: BTreeMap<String, Arc<MethodRecord>>,
}

/// Keeps a node's entries announced under one lease.
///
/// Each tick compares the registered entries with the last written set. A
/// changed set is written as a diff; an unchanged one only renews the lease.
/// Ticks never overlap.
pub struct Announcer {
    store: Arc<dyn CoordinationStore>,
    keys: KeyLayout,
    registry: MethodRegistry,
    events: EventBus,
    node: String,
    host: String,
    weight: Option<f64>,
    lease_ttl_secs: i64,
    state: Mutex<AnnounceState>,
    wake: Notify,
}

impl Announcer {
    /// Creates an announcer for the entries of `registry` served at `host`.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: KeyLayout,
        registry: MethodRegistry,
        events: EventBus,
        node: impl Into<String>,
        host: impl Into<String>,
        weight: Option<f64>,
        lease_ttl_secs: i64,
    ) -> Self {
        Self {
            store,
            keys,
            registry,
            events,
            node: node.into(),
            host: host.into(),
            weight,
            lease_ttl_secs,
            state: Mutex::new(AnnounceState::default()),
            wake: Notify::new(),
        }
    }

    /// Runs one announce cycle.
    ///
    /// # Errors
    ///
    /// Returns the store error of the failed step; the next tick starts over.
    #[instrument(name = "mesh.announce", skip_all)]
    pub async fn tick(&self) -> Result<(), MeshError> {
        let mut state = self.state.lock().await;

        let mut lease = match state.lease {
            Some(lease) => lease,
            None => self.grant(&mut state).await?,
        };

        let current = self.registry.snapshot();
        if current.keys().eq(state.announced.keys()) {
            match self.store.keep_alive(lease).await {
                Ok(()) => {
                    debug!(lease_id = lease, "Lease renewed");
                    self.events.publish(NodeEvent::LeaseRenewed);
                    return Ok(());
                }
                Err(StoreError::LeaseNotFound(_)) => {
                    warn!(lease_id = lease, "Lease lost, granting a new one");
                    state.lease = None;
                    lease = self.grant(&mut state).await?;
                    self.events.publish(NodeEvent::LeaseRegranted);
                    if current.is_empty() {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        let (added, removed) = match self.write(&state.announced, &current, lease).await {
            Ok(counts) => counts,
            Err(StoreError::LeaseNotFound(id)) => {
                state.lease = None;
                return Err(StoreError::LeaseNotFound(id).into());
            }
            Err(e) => return Err(e.into()),
        };
        state.announced = current;
        info!(added, removed, lease_id = lease, "Announced entries");
        self.events.publish(NodeEvent::Announced { added, removed });
        Ok(())
    }

    async fn grant(&self, state: &mut AnnounceState) -> Result<LeaseId, MeshError> {
        let lease = self.store.grant(self.lease_ttl_secs).await?;
        debug!(lease_id = lease, ttl = self.lease_ttl_secs, "Lease granted");
        state.lease = Some(lease);
        state.announced.clear();
        Ok(lease)
    }

    async fn write(
        &self,
        announced: &BTreeMap<String, Arc<MethodRecord>>,
        current: &BTreeMap<String, Arc<MethodRecord>>,
        lease: LeaseId,
    ) -> Result<(usize, usize), StoreError> {
        let mut ops: Vec<BoxFuture<'_, Result<(), StoreError>>> = Vec::new();

        let stale: Vec<&String> = announced
            .keys()
            .filter(|entry| !current.contains_key(*entry))
            .collect();
        for entry in &stale {
            let key = self.keys.entry_key(entry, &self.node);
            ops.push(Box::pin(async move { self.store.delete(&key).await }));
        }

        let fresh: Vec<&Arc<MethodRecord>> = current
            .iter()
            .filter(|(entry, _)| !announced.contains_key(*entry))
            .map(|(_, record)| record)
            .collect();
        let mut hashes = HashSet::new();
        for record in &fresh {
            let announcement = Announcement {
                host: self.host.clone(),
                schema_hash: record.schema_hash().to_string(),
                weight: self.weight,
            };
            let value = serde_json::to_vec(&announcement)
                .map_err(|e| StoreError::Backend(format!("encoding announcement: {e}")))?;
            let key = self.keys.entry_key(record.entry(), &self.node);
            ops.push(Box::pin(async move { self.store.put(&key, value, Some(lease)).await }));

            if hashes.insert(record.schema_hash()) {
                let blob = record
                    .schema()
                    .to_json()
                    .map_err(|e| StoreError::Backend(format!("encoding schema: {e}")))?;
                let key = self.keys.proto_key(record.schema_hash(), &self.node);
                ops.push(Box::pin(async move {
                    self.store.put(&key, blob.into_bytes(), Some(lease)).await
                }));
            }
        }

        try_join_all(ops).await?;
        Ok((fresh.len(), stale.len()))
    }

    /// Wakes the announce loop for an early tick.
    ///
    /// If a tick is running, one more follows it.
    pub fn poll_now(&self) {
        self.wake.notify_one();
    }

    /// Runs ticks every `interval` until `cancel` fires.
    ///
    /// A failed tick is logged and published; the loop keeps going. The next
    /// tick is scheduled only after the previous one finished.
    pub fn spawn_loop(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = this.wake.notified() => {}
                    () = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = this.tick().await {
                    warn!(error = %e, "Announce tick failed");
                    this.events.publish(NodeEvent::AnnounceFailed {
                        error: e.to_string(),
                    });
                }
            }
            debug!("Announce loop stopped");
        })
    }

    /// Revokes the lease, withdrawing every announced key at once.
    ///
    /// # Errors
    ///
    /// Returns the store error if the revoke fails for a reason other than
    /// the lease being gone already.
    pub async fn revoke(&self) -> Result<(), MeshError> {
        let mut state = self.state.lock().await;
        state.announced.clear();
        let Some(lease) = state.lease.take() else {
            return Ok(());
        };
        match self.store.revoke(lease).await {
            Ok(()) => {
                info!(lease_id = lease, "Lease revoked");
                Ok(())
            }
            Err(StoreError::LeaseNotFound(_)) => {
                debug!(lease_id = lease, "Lease already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Entries written by the last successful tick.
    pub async fn announced(&self) -> Vec<String> {
        self.state.lock().await.announced.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Api, Handler};
    use crate::schema::{FieldType, MessageSchema, MethodSchema};
    use crate::store::MemoryStore;
    use anyhow::Result;
    use serde_json::Value;

    fn api(names: &[&str]) -> Api {
        names.iter().fold(Api::new(), |api, name| {
            api.method(
                *name,
                MethodSchema::new(MessageSchema::new(), MessageSchema::result(FieldType::Bool)),
                Handler::unary(|_, _| async { Ok(Value::Bool(true)) }),
            )
        })
    }

    fn announcer(store: &Arc<MemoryStore>, registry: &MethodRegistry, events: &EventBus) -> Announcer {
        Announcer::new(
            store.clone(),
            KeyLayout::default(),
            registry.clone(),
            events.clone(),
            "n1",
            "127.0.0.1:7000",
            None,
            10,
        )
    }

    #[tokio::test]
    async fn test_first_tick_writes_entries_and_schema() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let registry = MethodRegistry::new();
        registry.register(&api(&["a", "b"]))?;
        let announcer = announcer(&store, &registry, &EventBus::new());

        announcer.tick().await?;

        let hash = registry.get("a").map(|r| r.schema_hash().to_string()).unwrap_or_default();
        assert_eq!(
            store.keys(),
            vec![
                "rpc-entry/a/$/n1".to_string(),
                "rpc-entry/b/$/n1".to_string(),
                format!("rpc-proto/{hash}/n1"),
            ]
        );
        let value = store.get_prefix("rpc-entry/a/$/n1").await?;
        let announcement: Announcement = serde_json::from_slice(&value[0].1)?;
        assert_eq!(announcement.host, "127.0.0.1:7000");
        assert_eq!(announcement.schema_hash, hash);
        Ok(())
    }

    #[tokio::test]
    async fn test_unchanged_set_only_renews() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let registry = MethodRegistry::new();
        registry.register(&api(&["a"]))?;
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let announcer = announcer(&store, &registry, &events);

        announcer.tick().await?;
        announcer.tick().await?;

        assert_eq!(rx.recv().await?, NodeEvent::Announced { added: 1, removed: 0 });
        assert_eq!(rx.recv().await?, NodeEvent::LeaseRenewed);
        assert_eq!(store.lease_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_new_registration_is_diffed() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let registry = MethodRegistry::new();
        registry.register(&api(&["a"]))?;
        let events = EventBus::new();
        let announcer = announcer(&store, &registry, &events);
        announcer.tick().await?;

        let mut rx = events.subscribe();
        registry.register(&api(&["b"]))?;
        announcer.tick().await?;

        assert_eq!(rx.recv().await?, NodeEvent::Announced { added: 1, removed: 0 });
        assert_eq!(announcer.announced().await, vec!["a", "b"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_lost_lease_is_regranted() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let registry = MethodRegistry::new();
        registry.register(&api(&["a"]))?;
        let events = EventBus::new();
        let announcer = announcer(&store, &registry, &events);
        announcer.tick().await?;

        let lease = announcer.state.lock().await.lease.unwrap_or_default();
        store.revoke(lease).await?;
        assert!(store.keys().is_empty());

        let mut rx = events.subscribe();
        announcer.tick().await?;
        assert_eq!(rx.recv().await?, NodeEvent::LeaseRegranted);
        assert_eq!(rx.recv().await?, NodeEvent::Announced { added: 1, removed: 0 });
        assert!(store.keys().contains(&"rpc-entry/a/$/n1".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_outage_fails_tick_then_recovers() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let registry = MethodRegistry::new();
        registry.register(&api(&["a"]))?;
        let announcer = announcer(&store, &registry, &EventBus::new());

        store.set_available(false);
        assert!(announcer.tick().await.is_err());
        store.set_available(true);
        announcer.tick().await?;
        assert_eq!(announcer.announced().await, vec!["a"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_revoke_withdraws_everything() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let registry = MethodRegistry::new();
        registry.register(&api(&["a"]))?;
        let announcer = announcer(&store, &registry, &EventBus::new());
        announcer.tick().await?;

        announcer.revoke().await?;
        assert!(store.keys().is_empty());
        assert_eq!(store.lease_count(), 0);
        announcer.revoke().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_loop_stops_on_cancel() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let registry = MethodRegistry::new();
        registry.register(&api(&["a"]))?;
        let announcer = Arc::new(announcer(&store, &registry, &EventBus::new()));
        let cancel = CancellationToken::new();

        let handle = announcer.spawn_loop(Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(announcer.announced().await, vec!["a"]);

        cancel.cancel();
        handle.await?;
        Ok(())
    }
}
