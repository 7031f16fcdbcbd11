use super::balancer::{pick, RandomSource};
use super::keys::{children, Announcement, KeyLayout, Target};
use crate::error::MeshError;
use crate::node::{EventBus, NodeEvent};
use crate::store::{CoordinationStore, WatchEvent, WatchStream};
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type TargetMap = Arc<RwLock<BTreeMap<String, Target>>>;

/// Live view of the providers of one entry.
///
/// The map is filled from a store snapshot, then kept current by a watch
/// task that applies put and delete events in arrival order.
pub struct Discovery {
    entry: String,
    targets: TargetMap,
    live: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Discovery {
    /// Entry being followed.
    #[must_use]
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Current providers, ordered by node name.
    #[must_use]
    pub fn targets(&self) -> Vec<Target> {
        self.targets.read().values().cloned().collect()
    }

    /// Number of current providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.read().len()
    }

    /// Returns `true` when no provider is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.read().is_empty()
    }

    /// Returns `false` once the watch failed or stopped.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

fn apply(targets: &RwLock<BTreeMap<String, Target>>, keys: &KeyLayout, event: WatchEvent) {
    match event {
        WatchEvent::Put { key, value } => {
            let Some((_, node)) = keys.parse_entry_key(&key) else {
                return;
            };
            match serde_json::from_slice::<Announcement>(&value) {
                Ok(announcement) => {
                    debug!(%key, host = %announcement.host, "Provider announced");
                    targets
                        .write()
                        .insert(node.to_string(), Target::new(node, announcement));
                }
                Err(e) => warn!(%key, error = %e, "Ignoring malformed announcement"),
            }
        }
        WatchEvent::Delete { key } => {
            if let Some((_, node)) = keys.parse_entry_key(&key) {
                debug!(%key, "Provider withdrawn");
                targets.write().remove(node);
            }
        }
    }
}

/// Finds providers of entries through the coordination store.
pub struct Resolver {
    store: Arc<dyn CoordinationStore>,
    keys: KeyLayout,
    events: EventBus,
    random: Arc<dyn RandomSource>,
    cancel: CancellationToken,
    caches: Mutex<HashMap<String, Arc<OnceCell<Arc<Discovery>>>>>,
}

impl Resolver {
    /// Creates a resolver with no open watches.
    #[must_use]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: KeyLayout,
        events: EventBus,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            store,
            keys,
            events,
            random,
            cancel: CancellationToken::new(),
            caches: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the live provider view of `entry`, opening it on first use.
    ///
    /// Concurrent first lookups share one open. A view whose watch failed is
    /// replaced.
    ///
    /// # Errors
    ///
    /// Returns the store error if the watch or snapshot fails, or
    /// [`MeshError::Transport`] after [`Resolver::close`].
    pub async fn search(&self, entry: &str) -> Result<Arc<Discovery>, MeshError> {
        if self.cancel.is_cancelled() {
            return Err(MeshError::Transport("node is destroyed".to_string()));
        }
        let slot = {
            let mut caches = self.caches.lock();
            let slot = caches.entry(entry.to_string()).or_default();
            if slot.get().is_some_and(|discovery| !discovery.is_live()) {
                debug!(%entry, "Reopening stale discovery");
                *slot = Arc::default();
            }
            slot.clone()
        };
        slot.get_or_try_init(|| self.open(entry)).await.cloned()
    }

    /// Picks one provider of `entry` by weight.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::EntryNotFound`] when no provider is live.
    pub async fn select(&self, entry: &str) -> Result<Target, MeshError> {
        let targets = self.search(entry).await?.targets();
        pick(&targets, self.random.as_ref())
            .cloned()
            .ok_or_else(|| MeshError::EntryNotFound(entry.to_string()))
    }

    /// Lists the announced children of an entry prefix.
    ///
    /// # Errors
    ///
    /// Returns the store error if the listing fails.
    pub async fn dir(&self, prefix: &str) -> Result<Vec<String>, MeshError> {
        let base = prefix.trim_end_matches('/');
        let listed = self.store.get_prefix(&self.keys.entries_under(base)).await?;
        let entries: Vec<&str> = listed
            .iter()
            .filter_map(|(key, _)| self.keys.parse_entry_key(key).map(|(entry, _)| entry))
            .collect();
        Ok(children(base, entries))
    }

    /// Entries with an open view.
    #[must_use]
    pub fn watched(&self) -> Vec<String> {
        let mut entries: Vec<String> = self
            .caches
            .lock()
            .iter()
            .filter(|(_, slot)| slot.get().is_some_and(|d| d.is_live()))
            .map(|(entry, _)| entry.clone())
            .collect();
        entries.sort();
        entries
    }

    async fn open(&self, entry: &str) -> Result<Arc<Discovery>, MeshError> {
        let prefix = self.keys.entry_prefix(entry);
        // Watch before the snapshot so no event between the two is lost.
        let watch = self.store.watch_prefix(&prefix).await?;
        let snapshot = self.store.get_prefix(&prefix).await?;

        let targets: TargetMap = Arc::default();
        for (key, value) in snapshot {
            apply(&targets, &self.keys, WatchEvent::Put { key, value });
        }
        debug!(%entry, providers = targets.read().len(), "Opened discovery");

        let live = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(follow(
            entry.to_string(),
            watch,
            targets.clone(),
            live.clone(),
            self.keys.clone(),
            self.events.clone(),
            self.cancel.child_token(),
        ));

        Ok(Arc::new(Discovery {
            entry: entry.to_string(),
            targets,
            live,
            task: Mutex::new(Some(task)),
        }))
    }

    /// Cancels every watch and waits for the watch tasks to stop.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Transport`] if a watch task panicked.
    pub async fn close(&self) -> Result<(), MeshError> {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self
            .caches
            .lock()
            .drain()
            .filter_map(|(_, slot)| slot.get().and_then(|d| d.task.lock().take()))
            .collect();

        let mut failed = None;
        for task in tasks {
            if let Err(e) = task.await {
                failed = Some(MeshError::Transport(format!("watch task failed: {e}")));
            }
        }
        failed.map_or(Ok(()), Err)
    }
}

async fn follow(
    entry: String,
    mut watch: WatchStream,
    targets: TargetMap,
    live: Arc<AtomicBool>,
    keys: KeyLayout,
    events: EventBus,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = watch.next() => match event {
                Some(Ok(event)) => apply(&targets, &keys, event),
                Some(Err(e)) => {
                    warn!(%entry, error = %e, "Discovery watch failed");
                    events.publish(NodeEvent::WatchFailed { entry: entry.clone(), error: e.to_string() });
                    break;
                }
                None => {
                    warn!(%entry, "Discovery watch ended");
                    events.publish(NodeEvent::WatchFailed { entry: entry.clone(), error: "watch ended".to_string() });
                    break;
                }
            },
        }
    }
    live.store(false, Ordering::Release);
}
