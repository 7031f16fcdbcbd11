//! Method registry: the flat table of entries a node serves.
//!
//! An [`Api`] tree is flattened into `entry -> MethodRecord` at registration
//! time. The transport server routes inbound calls through [`MethodRegistry::route`];
//! in-process calls made through a [`Scope`] or a [`LocalMethod`] skip the wire.

mod api;
mod handler;
mod scope;

pub use api::{Api, ApiNode, Bound, BoundApi, LocalMethod};
pub use handler::{Args, Handler, HandlerStream, Inbound, INBOUND_CAPACITY};
pub use scope::Scope;

use crate::error::MeshError;
use crate::schema::{MethodSchema, StreamKind};
use crate::transport::naming::{self, META_ENTRY};
use crate::transport::ValueStream;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// One registered method.
pub struct MethodRecord {
    entry: String,
    handler: Handler,
    schema: Arc<MethodSchema>,
    schema_hash: String,
    path: String,
}

impl MethodRecord {
    /// Entry path.
    #[must_use]
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Implementation.
    #[must_use]
    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// Wire schema.
    #[must_use]
    pub fn schema(&self) -> &Arc<MethodSchema> {
        &self.schema
    }

    /// Content hash of the schema.
    #[must_use]
    pub fn schema_hash(&self) -> &str {
        &self.schema_hash
    }

    /// gRPC request path the method is served under.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Stream direction.
    #[must_use]
    pub fn kind(&self) -> StreamKind {
        self.handler.kind()
    }
}

impl std::fmt::Debug for MethodRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRecord")
            .field("entry", &self.entry)
            .field("kind", &self.kind())
            .field("schema_hash", &self.schema_hash)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Inner {
    methods: BTreeMap<String, Arc<MethodRecord>>,
    routes: HashMap<String, String>,
}

/// Shared handle to a node's registered methods.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl MethodRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Flattens and registers every method of `api`.
    ///
    /// Nothing is registered if any method is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Registration`] for an invalid name, a duplicate
    /// entry, an invalid schema or a handler that does not match its schema.
    pub fn register(&self, api: &Api) -> Result<BoundApi, MeshError> {
        let mut leaves = Vec::new();
        collect(api, "", &mut leaves)?;

        let mut inner = self.inner.write();
        let mut fresh: BTreeMap<String, Arc<MethodRecord>> = BTreeMap::new();
        let mut fresh_routes: HashMap<String, String> = HashMap::new();

        for (entry, schema, handler) in leaves {
            if inner.methods.contains_key(&entry) || fresh.contains_key(&entry) {
                return Err(MeshError::Registration(format!(
                    "entry '{entry}' is already registered"
                )));
            }
            schema
                .validate()
                .map_err(|e| MeshError::Registration(format!("{entry}: {e}")))?;
            if schema.kind() != handler.kind() {
                return Err(MeshError::Registration(format!(
                    "{entry}: {} handler for a {} schema",
                    handler.kind(),
                    schema.kind()
                )));
            }

            let path = naming::grpc_path(&entry);
            if let Some(other) = inner
                .routes
                .get(&path)
                .or_else(|| fresh_routes.get(&path))
            {
                return Err(MeshError::Registration(format!(
                    "entries '{other}' and '{entry}' map to the same service path {path}"
                )));
            }

            let schema_hash = schema
                .hash()
                .map_err(|e| MeshError::Registration(format!("{entry}: {e}")))?;
            let record = MethodRecord {
                schema_hash,
                schema: Arc::new(schema),
                entry: entry.clone(),
                handler,
                path: path.clone(),
            };
            fresh_routes.insert(path, entry.clone());
            fresh.insert(entry, Arc::new(record));
        }

        for record in fresh.values() {
            debug!(entry = %record.entry, kind = %record.kind(), "Registered method");
        }
        inner.routes.extend(fresh_routes);
        inner.methods.extend(fresh);
        drop(inner);

        Ok(BoundApi::bind(api, "", self))
    }

    /// Looks up a method by entry.
    #[must_use]
    pub fn get(&self, entry: &str) -> Option<Arc<MethodRecord>> {
        self.inner.read().methods.get(entry).cloned()
    }

    /// Looks up a method by gRPC request path.
    #[must_use]
    pub fn route(&self, path: &str) -> Option<Arc<MethodRecord>> {
        let inner = self.inner.read();
        inner
            .routes
            .get(path)
            .and_then(|entry| inner.methods.get(entry))
            .cloned()
    }

    /// Registered entries, sorted.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.inner.read().methods.keys().cloned().collect()
    }

    /// Every registered method, keyed by entry.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Arc<MethodRecord>> {
        self.inner.read().methods.clone()
    }

    /// Number of registered methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().methods.len()
    }

    /// Returns `true` when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().methods.is_empty()
    }

    /// Invokes a registered method in-process.
    ///
    /// Stream results are collected into an array. For request-stream
    /// methods, `args` are the items of the request stream.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::EntryNotFound`] for an unknown entry and
    /// [`MeshError::RemoteCall`] if the handler fails.
    pub async fn call_local(&self, entry: &str, args: Args) -> Result<Value, MeshError> {
        let record = self
            .get(entry)
            .ok_or_else(|| MeshError::EntryNotFound(entry.to_string()))?;
        let scope = Scope::new(self.clone(), entry);
        let failed = |e: anyhow::Error| MeshError::RemoteCall {
            entry: entry.to_string(),
            message: e.to_string(),
        };

        match record.handler() {
            Handler::Unary(f) => f(scope, args).await.map_err(failed),
            Handler::ClientStream(f) => f(scope, Inbound::from_values(args)).await.map_err(failed),
            Handler::ServerStream(_) | Handler::Duplex(_) => {
                let items: Vec<Value> = self.stream_local(entry, args)?.try_collect().await?;
                Ok(Value::Array(items))
            }
        }
    }

    /// Opens the results of a registered method as a stream, in-process.
    ///
    /// A unary method yields its single result.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::EntryNotFound`] for an unknown entry.
    pub fn stream_local(&self, entry: &str, args: Args) -> Result<ValueStream, MeshError> {
        let record = self
            .get(entry)
            .ok_or_else(|| MeshError::EntryNotFound(entry.to_string()))?;
        let scope = Scope::new(self.clone(), entry);
        let owned = entry.to_string();
        let failed = move |e: anyhow::Error| MeshError::RemoteCall {
            entry: owned.clone(),
            message: e.to_string(),
        };

        let out = match record.handler() {
            Handler::ServerStream(f) => f(scope, args).map_err(failed).boxed(),
            Handler::Duplex(f) => f(scope, Inbound::from_values(args)).map_err(failed).boxed(),
            Handler::Unary(f) => stream::once(f(scope, args)).map_err(failed).boxed(),
            Handler::ClientStream(f) => stream::once(f(scope, Inbound::from_values(args)))
                .map_err(failed)
                .boxed(),
        };
        Ok(out)
    }
}

fn collect(
    api: &Api,
    prefix: &str,
    out: &mut Vec<(String, MethodSchema, Handler)>,
) -> Result<(), MeshError> {
    for (name, node) in api.children() {
        if name.is_empty() || name.contains('/') {
            return Err(MeshError::Registration(format!(
                "invalid segment '{name}' under '{prefix}'"
            )));
        }
        let entry = api::join(prefix, name);
        match node {
            ApiNode::Method { schema, handler } => {
                if entry == META_ENTRY {
                    return Err(MeshError::Registration(format!(
                        "'{META_ENTRY}' is reserved"
                    )));
                }
                out.push((entry, schema.clone(), handler.clone()));
            }
            ApiNode::Group(group) => collect(group, &entry, out)?,
            ApiNode::Constant(_) => {}
        }
    }
    Ok(())
}
