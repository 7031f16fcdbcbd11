//! The mesh node: registry, server, announcer and resolver under one lifecycle.

mod events;
mod name;
mod options;

pub use events::{EventBus, NodeEvent};
pub use name::{NodeName, ValidationError};
pub use options::NodeOptions;

use crate::caller::Caller;
use crate::discovery::{Announcer, KeyLayout, RandomSource, Resolver, SchemaCache, ThreadRandom};
use crate::error::MeshError;
use crate::middleware::{Middleware, MiddlewareChain};
use crate::proxy::Query;
use crate::registry::{Api, BoundApi, MethodRegistry};
use crate::retry::RetryPolicy;
use crate::store::CoordinationStore;
use crate::transport::server::{self, Dispatcher, ServerHandle};
use crate::transport::ClientPool;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Running {
    server: ServerHandle,
    announce_loop: JoinHandle<()>,
    cancel: CancellationToken,
}

enum Lifecycle {
    Created,
    Running(Running),
    Destroyed,
}

/// One mesh node.
///
/// A node serves the methods registered on it and calls methods served by
/// other nodes sharing its coordination store. Querying works before `init`;
/// serving starts with it.
pub struct MeshNode {
    options: NodeOptions,
    name: NodeName,
    store: Arc<dyn CoordinationStore>,
    keys: KeyLayout,
    registry: MethodRegistry,
    chain: MiddlewareChain,
    events: EventBus,
    resolver: Arc<Resolver>,
    caller: Arc<Caller>,
    announcer: OnceLock<Arc<Announcer>>,
    local_addr: OnceLock<SocketAddr>,
    lifecycle: Mutex<Lifecycle>,
}

impl MeshNode {
    /// Creates a node; a random name is chosen when `options` has none.
    #[must_use]
    pub fn new(options: NodeOptions, store: Arc<dyn CoordinationStore>) -> Self {
        Self::with_random(options, store, Arc::new(ThreadRandom))
    }

    /// Creates a node drawing provider picks from `random`.
    #[must_use]
    pub fn with_random(
        options: NodeOptions,
        store: Arc<dyn CoordinationStore>,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        let name = options.name.clone().unwrap_or_else(NodeName::generate);
        let keys = KeyLayout::new(options.store_prefix.clone());
        let events = EventBus::new();
        let resolver = Arc::new(Resolver::new(
            store.clone(),
            keys.clone(),
            events.clone(),
            random,
        ));
        let registry = MethodRegistry::new();
        let caller = Caller::discovered(
            resolver.clone(),
            Arc::new(SchemaCache::new(store.clone(), keys.clone())),
            registry.clone(),
            ClientPool::new(options.security.clone()),
            RetryPolicy::new(options.retry_count),
            options.call_timeout,
        );

        Self {
            options,
            name,
            store,
            keys,
            registry,
            chain: MiddlewareChain::new(),
            events,
            resolver,
            caller: Arc::new(caller),
            announcer: OnceLock::new(),
            local_addr: OnceLock::new(),
            lifecycle: Mutex::new(Lifecycle::Created),
        }
    }

    /// Registers every method of `api`.
    ///
    /// On a running node the new methods are served at once and announced
    /// without waiting for the next scheduled tick.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Registration`] if any method is invalid; nothing
    /// is registered then.
    pub fn register(&self, api: &Api) -> Result<BoundApi, MeshError> {
        let bound = self.registry.register(api)?;
        if let Some(announcer) = self.announcer.get() {
            announcer.poll_now();
        }
        Ok(bound)
    }

    /// Root of the mesh's method tree.
    ///
    /// Entries registered on this node are called in-process, without
    /// middleware; all others go to a provider found in the store.
    #[must_use]
    pub fn query(&self) -> Query {
        Query::new(self.caller.clone())
    }

    /// Appends a middleware layer around every inbound call.
    pub fn use_middleware(&self, middleware: impl Middleware) {
        self.chain.push(Arc::new(middleware));
    }

    /// Starts serving and announcing.
    ///
    /// Binds the listener, starts the server, runs one announce tick and
    /// starts the announce loop. A failed first tick is retried by the loop.
    /// Calling `init` on a running node does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Transport`] if the node was destroyed or the
    /// listener cannot be bound.
    pub async fn init(&self) -> Result<&Self, MeshError> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Destroyed => {
                return Err(MeshError::Transport("node is destroyed".to_string()))
            }
            Lifecycle::Running(_) => {
                debug!(node = %self.name, "Node already running");
                return Ok(self);
            }
            Lifecycle::Created => {}
        }

        let bind = SocketAddr::new(self.options.listen_addr, self.options.listen_port);
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| MeshError::Transport(format!("bind {bind}: {e}")))?;
        let dispatcher = Arc::new(Dispatcher::new(self.registry.clone(), self.chain.clone()));
        let server = server::serve(listener, dispatcher, &self.options.security)?;
        let local_addr = server.local_addr();
        let host = self.advertised_host(local_addr);

        let announcer = Arc::new(Announcer::new(
            self.store.clone(),
            self.keys.clone(),
            self.registry.clone(),
            self.events.clone(),
            self.name.as_str(),
            host.clone(),
            self.options.weight,
            self.options.lease_ttl_secs,
        ));
        if let Err(e) = announcer.tick().await {
            warn!(node = %self.name, error = %e, "First announce failed");
            self.events.publish(NodeEvent::AnnounceFailed {
                error: e.to_string(),
            });
        }
        let cancel = CancellationToken::new();
        let announce_loop = announcer.spawn_loop(self.options.announce_interval, cancel.clone());

        // Both cells are only ever set here, under the lifecycle lock.
        let _ = self.announcer.set(announcer);
        let _ = self.local_addr.set(local_addr);
        *lifecycle = Lifecycle::Running(Running {
            server,
            announce_loop,
            cancel,
        });
        info!(node = %self.name, %host, %local_addr, "Node initialized");
        Ok(self)
    }

    fn advertised_host(&self, local_addr: SocketAddr) -> String {
        if let Some(host) = &self.options.advertise_host {
            return host.clone();
        }
        let ip = match local_addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        SocketAddr::new(ip, local_addr.port()).to_string()
    }

    /// Stops the node.
    ///
    /// Stops the announce loop after any running tick, then closes every
    /// discovery watch, revokes the lease and drains the server concurrently.
    /// Calls still running after `grace` are cut off. Every step runs even if
    /// another fails; failures are logged and published. Later calls through
    /// this node fail, and a second `destroy` does nothing.
    pub async fn destroy(&self, grace: Duration) {
        let previous = std::mem::replace(&mut *self.lifecycle.lock().await, Lifecycle::Destroyed);
        let running = match previous {
            Lifecycle::Destroyed => {
                debug!(node = %self.name, "Node already destroyed");
                return;
            }
            Lifecycle::Created => None,
            Lifecycle::Running(running) => Some(running),
        };
        self.caller.close();

        let server = match running {
            Some(running) => {
                running.cancel.cancel();
                if let Err(e) = running.announce_loop.await {
                    self.teardown_failed("announce loop", &e.to_string());
                }
                Some(running.server)
            }
            None => None,
        };
        let announcer = self.announcer.get();

        let (watches, lease, drain) = tokio::join!(
            self.resolver.close(),
            async {
                match announcer {
                    Some(announcer) => announcer.revoke().await,
                    None => Ok(()),
                }
            },
            async {
                match server {
                    Some(server) => server.drain(grace).await,
                    None => Ok(()),
                }
            },
        );
        for (step, result) in [("watches", watches), ("lease", lease), ("drain", drain)] {
            if let Err(e) = result {
                self.teardown_failed(step, &e.to_string());
            }
        }

        info!(node = %self.name, "Node destroyed");
        self.events.publish(NodeEvent::Destroyed);
    }

    fn teardown_failed(&self, step: &'static str, error: &str) {
        warn!(node = %self.name, step, error, "Teardown step failed");
        self.events.publish(NodeEvent::TeardownFailed {
            step,
            error: error.to_string(),
        });
    }

    /// Lists the announced children of an entry prefix across the mesh.
    ///
    /// Methods are listed by name, groups with a trailing `/`.
    ///
    /// # Errors
    ///
    /// Returns the store error if the listing fails.
    pub async fn dir(&self, prefix: &str) -> Result<Vec<String>, MeshError> {
        self.resolver.dir(prefix).await
    }

    /// Entries registered on this node, sorted.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.registry.entries()
    }

    /// Registry of this node.
    #[must_use]
    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    /// Options the node was created with.
    #[must_use]
    pub fn options(&self) -> &NodeOptions {
        &self.options
    }

    /// Name of this node.
    #[must_use]
    pub fn name(&self) -> &NodeName {
        &self.name
    }

    /// Address the server is bound to, once initialized.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Entries with an open discovery watch.
    #[must_use]
    pub fn watched(&self) -> Vec<String> {
        self.resolver.watched()
    }

    /// Subscribes to this node's background events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }
}
