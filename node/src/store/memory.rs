use super::{CoordinationStore, LeaseId, StoreError, WatchEvent, WatchStream};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::trace;

const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<Result<WatchEvent, StoreError>>,
}

struct State {
    kvs: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
    watchers: Vec<Watcher>,
    available: bool,
}

impl State {
    fn check(&self) -> Result<(), StoreError> {
        if self.available {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        }
    }

    fn emit(&mut self, event: &WatchEvent) {
        let key = match event {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key } => key,
        };
        self.watchers.retain(|w| !w.tx.is_closed());
        for watcher in &self.watchers {
            if key.starts_with(&watcher.prefix) {
                let _ = watcher.tx.send(Ok(event.clone()));
            }
        }
    }

    fn remove_key(&mut self, key: &str) {
        if let Some(entry) = self.kvs.remove(key) {
            if let Some(lease) = entry.lease.and_then(|id| self.leases.get_mut(&id)) {
                lease.keys.remove(key);
            }
            self.emit(&WatchEvent::Delete {
                key: key.to_string(),
            });
        }
    }

    fn drop_lease(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        for key in lease.keys {
            self.remove_key(&key);
        }
        true
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            trace!(lease_id = id, "memory store lease expired");
            self.drop_lease(id);
        }
    }
}

/// In-process coordination store with leases, TTL expiry and prefix watches.
///
/// Clones share the same data, so several nodes in one process can form a
/// mesh over a single `MemoryStore`. Lease expiry is checked on every call and
/// by a background sweeper started with the first lease.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    sweeping: Arc<AtomicBool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                kvs: BTreeMap::new(),
                leases: HashMap::new(),
                next_lease: 1,
                watchers: Vec::new(),
                available: true,
            })),
            sweeping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulates an outage: while unavailable every call fails, and going
    /// offline ends every open watch with an error.
    pub fn set_available(&self, available: bool) {
        let mut state = self.state.lock();
        state.available = available;
        if !available {
            for watcher in state.watchers.drain(..) {
                let _ = watcher.tx.send(Err(StoreError::Unavailable(
                    "memory store went offline".to_string(),
                )));
            }
        }
    }

    /// Number of watches whose receiver is still alive.
    #[must_use]
    pub fn watcher_count(&self) -> usize {
        self.state
            .lock()
            .watchers
            .iter()
            .filter(|w| !w.tx.is_closed())
            .count()
    }

    /// Number of live leases.
    #[must_use]
    pub fn lease_count(&self) -> usize {
        let mut state = self.state.lock();
        state.expire(Instant::now());
        state.leases.len()
    }

    /// Every key currently stored, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut state = self.state.lock();
        state.expire(Instant::now());
        state.kvs.keys().cloned().collect()
    }

    fn start_sweeper(&self) {
        if self.sweeping.swap(true, Ordering::SeqCst) {
            return;
        }
        let state: Weak<Mutex<State>> = Arc::downgrade(&self.state);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let Some(state) = state.upgrade() else {
                    break;
                };
                state.lock().expire(Instant::now());
            }
        });
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut State) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.state.lock();
        state.check()?;
        state.expire(Instant::now());
        f(&mut state)
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId, StoreError> {
        let ttl = Duration::from_secs(u64::try_from(ttl_secs.max(1)).unwrap_or(1));
        let id = self.with_state(|state| {
            let id = state.next_lease;
            state.next_lease += 1;
            state.leases.insert(
                id,
                Lease {
                    ttl,
                    deadline: Instant::now() + ttl,
                    keys: BTreeSet::new(),
                },
            );
            Ok(id)
        })?;
        self.start_sweeper();
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<(), StoreError> {
        self.with_state(|state| {
            let entry = state
                .leases
                .get_mut(&lease)
                .ok_or(StoreError::LeaseNotFound(lease))?;
            entry.deadline = Instant::now() + entry.ttl;
            Ok(())
        })
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        self.with_state(|state| {
            if state.drop_lease(lease) {
                Ok(())
            } else {
                Err(StoreError::LeaseNotFound(lease))
            }
        })
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<(), StoreError> {
        self.with_state(|state| {
            if let Some(id) = lease {
                let entry = state
                    .leases
                    .get_mut(&id)
                    .ok_or(StoreError::LeaseNotFound(id))?;
                entry.keys.insert(key.to_string());
            }
            let previous = state.kvs.insert(
                key.to_string(),
                Entry {
                    value: value.clone(),
                    lease,
                },
            );
            if let Some(old) = previous.and_then(|e| e.lease).filter(|old| Some(*old) != lease) {
                if let Some(old) = state.leases.get_mut(&old) {
                    old.keys.remove(key);
                }
            }
            state.emit(&WatchEvent::Put {
                key: key.to_string(),
                value,
            });
            Ok(())
        })
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.with_state(|state| {
            Ok(state
                .kvs
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(key, entry)| (key.clone(), entry.value.clone()))
                .collect())
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.with_state(|state| {
            state.remove_key(key);
            Ok(())
        })
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, StoreError> {
        self.with_state(|state| {
            let (tx, rx) = mpsc::unbounded_channel();
            state.watchers.push(Watcher {
                prefix: prefix.to_string(),
                tx,
            });
            Ok(UnboundedReceiverStream::new(rx).boxed())
        })
    }
}
