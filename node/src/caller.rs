//! The outbound call path: pick a provider, resolve its schema, call it.

use crate::discovery::{Resolver, SchemaCache};
use crate::error::MeshError;
use crate::registry::{Args, MethodRegistry};
use crate::retry::{with_retry, RetryPolicy};
use crate::schema::{MethodSchema, StreamKind};
use crate::transport::{meta, ClientPool, ValueStream};
use futures_util::future;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Per-call overrides of the caller defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Attempts for a unary call, including the first.
    pub retry: Option<u32>,
    /// Pause between attempts.
    pub retry_delay: Option<Duration>,
    /// Deadline of a unary or client-stream call.
    pub timeout: Option<Duration>,
}

/// What a call sends: positional arguments or a stream of request items.
pub enum Input {
    /// Positional arguments.
    Args(Args),
    /// Request items, sent as they are produced.
    Stream(ValueStream),
}

impl Input {
    /// Arguments of a non-streaming request; a stream is collected first.
    async fn into_args(self) -> Result<Args, MeshError> {
        match self {
            Self::Args(args) => Ok(args),
            Self::Stream(items) => items.try_collect().await,
        }
    }

    /// Items of a streaming request; each argument becomes one item.
    fn into_stream(self) -> ValueStream {
        match self {
            Self::Args(args) => stream::iter(args.into_iter().map(Ok)).boxed(),
            Self::Stream(items) => items,
        }
    }
}

impl Default for Input {
    fn default() -> Self {
        Self::Args(Vec::new())
    }
}

type SchemaSlot = Arc<OnceCell<Arc<MethodSchema>>>;

enum Route {
    Discovered {
        resolver: Arc<Resolver>,
        schemas: Arc<SchemaCache>,
        local: MethodRegistry,
    },
    Fixed {
        host: String,
        schemas: Mutex<HashMap<String, SchemaSlot>>,
    },
}

/// Where one attempt of a call goes.
enum Provider {
    /// A method registered on the calling node, invoked in-process.
    Local {
        registry: MethodRegistry,
        kind: StreamKind,
    },
    /// A remote host and the schema it serves.
    Remote { host: String, schema: Arc<MethodSchema> },
}

impl Provider {
    fn kind(&self) -> StreamKind {
        match self {
            Self::Local { kind, .. } => *kind,
            Self::Remote { schema, .. } => schema.kind(),
        }
    }
}

/// Outcome of a call, shaped by how the caller consumes it.
enum Reply {
    Value(Value),
    Stream(ValueStream),
}

/// Runs outbound calls for a node or a direct client.
pub struct Caller {
    route: Route,
    pool: ClientPool,
    retry: RetryPolicy,
    timeout: Duration,
    closed: CancellationToken,
}

impl Caller {
    /// Caller finding providers through `resolver`.
    ///
    /// Entries registered in `local` are served in-process without a lookup.
    pub(crate) fn discovered(
        resolver: Arc<Resolver>,
        schemas: Arc<SchemaCache>,
        local: MethodRegistry,
        pool: ClientPool,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            route: Route::Discovered {
                resolver,
                schemas,
                local,
            },
            pool,
            retry,
            timeout,
            closed: CancellationToken::new(),
        }
    }

    /// Caller sending every call to `host`.
    pub(crate) fn fixed(host: impl Into<String>, pool: ClientPool, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            route: Route::Fixed {
                host: host.into(),
                schemas: Mutex::new(HashMap::new()),
            },
            pool,
            retry,
            timeout,
            closed: CancellationToken::new(),
        }
    }

    pub(crate) fn pool(&self) -> &ClientPool {
        &self.pool
    }

    /// Stops every later call from going out.
    pub(crate) fn close(&self) {
        self.closed.cancel();
        self.pool.clear();
    }

    /// Picks a provider of `entry`, resolving the schema of a remote one.
    async fn target(&self, entry: &str) -> Result<Provider, MeshError> {
        if self.closed.is_cancelled() {
            return Err(MeshError::Transport("node is destroyed".to_string()));
        }
        match &self.route {
            Route::Discovered {
                resolver,
                schemas,
                local,
            } => {
                if let Some(record) = local.get(entry) {
                    debug!(%entry, "Calling local handler");
                    return Ok(Provider::Local {
                        registry: local.clone(),
                        kind: record.kind(),
                    });
                }
                let target = resolver.select(entry).await?;
                let schema = schemas
                    .get(&target.schema_hash, || meta::fetch_schema(&self.pool, &target.host, entry))
                    .await?;
                debug!(%entry, node = %target.node_name, host = %target.host, "Selected provider");
                Ok(Provider::Remote {
                    host: target.host,
                    schema,
                })
            }
            Route::Fixed { host, schemas } => {
                let slot = schemas.lock().entry(entry.to_string()).or_default().clone();
                let schema = slot
                    .get_or_try_init(|| async {
                        meta::fetch_schema(&self.pool, host, entry).await.map(Arc::new)
                    })
                    .await?
                    .clone();
                Ok(Provider::Remote {
                    host: host.clone(),
                    schema,
                })
            }
        }
    }

    /// Calls `entry` and waits for its whole result.
    ///
    /// Attempts are retried per `options` or the caller default while the
    /// call can be replayed: when no provider was found, and for unary
    /// calls. Each attempt picks a provider again. The result of a streaming
    /// response is collected into an array.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::EntryNotFound`] when no provider is live, the
    /// mapped call failure, or [`MeshError::Timeout`] past the deadline.
    #[instrument(name = "mesh.call", skip(self, input, options))]
    pub async fn call(&self, entry: &str, input: Input, options: CallOptions) -> Result<Value, MeshError> {
        match self.run(entry, input, options, false).await? {
            Reply::Value(value) => Ok(value),
            Reply::Stream(items) => Ok(Value::Array(items.try_collect().await?)),
        }
    }

    /// Calls `entry` and returns its results as a stream.
    ///
    /// A call without a streaming response yields its single result. Dropping
    /// the stream cancels the call.
    ///
    /// # Errors
    ///
    /// Returns the failure of resolving the provider or opening the call.
    #[instrument(name = "mesh.call", skip(self, input, options))]
    pub async fn open(&self, entry: &str, input: Input, options: CallOptions) -> Result<ValueStream, MeshError> {
        match self.run(entry, input, options, true).await? {
            Reply::Stream(items) => Ok(items),
            Reply::Value(value) => Ok(stream::once(future::ready(Ok(value))).boxed()),
        }
    }

    async fn run(
        &self,
        entry: &str,
        input: Input,
        options: CallOptions,
        want_stream: bool,
    ) -> Result<Reply, MeshError> {
        let policy = RetryPolicy {
            attempts: options.retry.unwrap_or(self.retry.attempts),
            delay: options.retry_delay.or(self.retry.delay),
        };
        let deadline = options.timeout.unwrap_or(self.timeout);
        let pending = &Mutex::new(Some(input));

        // An attempt that has spent its input returns `Ok(outcome)`, which
        // ends the retry loop whatever the outcome is.
        let outcome = with_retry(policy, || async move {
            let provider = self.target(entry).await?;
            let input = pending.lock().take().unwrap_or_default();
            if provider.kind() != StreamKind::Unary {
                return Ok(self.once(entry, provider, input, deadline, want_stream).await);
            }
            let args = match input.into_args().await {
                Ok(args) => args,
                Err(e) => return Ok(Err(e)),
            };
            *pending.lock() = Some(Input::Args(args.clone()));
            let call = async {
                match &provider {
                    Provider::Local { registry, .. } => registry.call_local(entry, args).await,
                    Provider::Remote { host, schema } => {
                        self.pool.unary(host, entry, schema.clone(), args).await
                    }
                }
            };
            within(entry, deadline, call).await.map(|value| Ok(Reply::Value(value)))
        })
        .await;
        outcome?
    }

    /// Runs a call that cannot be replayed, exactly once.
    async fn once(
        &self,
        entry: &str,
        provider: Provider,
        input: Input,
        deadline: Duration,
        want_stream: bool,
    ) -> Result<Reply, MeshError> {
        let kind = provider.kind();
        let (host, schema) = match provider {
            Provider::Local { registry, .. } => {
                let args = input.into_args().await?;
                return if want_stream {
                    registry.stream_local(entry, args).map(Reply::Stream)
                } else if kind.streams_response() {
                    registry.call_local(entry, args).await.map(Reply::Value)
                } else {
                    within(entry, deadline, registry.call_local(entry, args))
                        .await
                        .map(Reply::Value)
                };
            }
            Provider::Remote { host, schema } => (host, schema),
        };

        match kind {
            StreamKind::Unary => {
                let args = input.into_args().await?;
                within(entry, deadline, self.pool.unary(&host, entry, schema, args))
                    .await
                    .map(Reply::Value)
            }
            StreamKind::ClientStream => {
                let items = input.into_stream();
                within(entry, deadline, self.pool.client_stream(&host, entry, schema, items))
                    .await
                    .map(Reply::Value)
            }
            StreamKind::Duplex => self
                .pool
                .duplex(&host, entry, schema, input.into_stream())
                .await
                .map(Reply::Stream),
            StreamKind::ServerStream => {
                let args = input.into_args().await?;
                self.pool
                    .server_stream(&host, entry, schema, args)
                    .await
                    .map(Reply::Stream)
            }
        }
    }
}

async fn within<T>(
    entry: &str,
    deadline: Duration,
    call: impl Future<Output = Result<T, MeshError>>,
) -> Result<T, MeshError> {
    tokio::time::timeout(deadline, call)
        .await
        .map_err(|_| MeshError::Timeout(format!("{entry}: no response within {deadline:?}")))?
}
