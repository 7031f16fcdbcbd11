//! Server-side middleware chain.
//!
//! Every inbound call passes through the installed layers in onion order:
//! the first layer added is the outermost. A layer calls [`Next::run`] to
//! continue; the innermost step invokes the method's handler and stores its
//! outcome on the [`CallContext`]. A layer that never calls `next`
//! short-circuits the handler, and the response is taken from whatever it left
//! in [`CallContext::err`] or [`CallContext::ret`].

use crate::registry::{Handler, HandlerStream, Inbound, MethodRecord, MethodRegistry, Scope};
use crate::schema::wire::{self, Message};
use crate::schema::StreamKind;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tonic::metadata::MetadataMap;
use tonic::Status;

/// An interceptor wrapped around every inbound call.
///
/// ```
/// use async_trait::async_trait;
/// use meshwork::middleware::{CallContext, Middleware, Next};
///
/// struct Audit;
///
/// #[async_trait]
/// impl Middleware for Audit {
///     async fn handle(&self, ctx: &mut CallContext, next: Next<'_>) {
///         tracing::info!(entry = %ctx.entry, "call started");
///         next.run(ctx).await;
///         tracing::info!(entry = %ctx.entry, failed = ctx.err.is_some(), "call finished");
///     }
/// }
/// ```
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Handles one call; call `next.run(ctx)` to continue down the chain.
    async fn handle(&self, ctx: &mut CallContext, next: Next<'_>);
}

/// The remainder of the chain after the running layer.
pub struct Next<'a> {
    layers: &'a [Arc<dyn Middleware>],
}

impl Next<'_> {
    /// Runs the remaining layers, then the handler.
    pub async fn run(self, ctx: &mut CallContext) {
        match self.layers.split_first() {
            Some((layer, rest)) => layer.handle(ctx, Next { layers: rest }).await,
            None => ctx.invoke().await,
        }
    }
}

/// State of one inbound call as seen by middleware.
pub struct CallContext {
    /// Entry being called.
    pub entry: String,
    /// Stream direction of the method.
    pub kind: StreamKind,
    /// Request metadata (gRPC headers).
    pub metadata: MetadataMap,
    /// Decoded request message; `None` for request-stream methods.
    pub request: Option<Message>,
    /// Result of a unary or client-stream handler.
    pub ret: Option<Value>,
    /// Error to answer with; set by the handler or by a layer.
    pub err: Option<Status>,
    inbound: Option<Inbound>,
    output: Option<HandlerStream>,
    record: Arc<MethodRecord>,
    registry: MethodRegistry,
}

impl CallContext {
    pub(crate) fn new(
        record: Arc<MethodRecord>,
        registry: MethodRegistry,
        metadata: MetadataMap,
        request: Option<Message>,
        inbound: Option<Inbound>,
    ) -> Self {
        Self {
            entry: record.entry().to_string(),
            kind: record.kind(),
            metadata,
            request,
            ret: None,
            err: None,
            inbound,
            output: None,
            record,
            registry,
        }
    }

    /// Returns `true` once the handler ran or a layer set an outcome.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.ret.is_some() || self.err.is_some() || self.output.is_some()
    }

    async fn invoke(&mut self) {
        let scope = Scope::new(self.registry.clone(), &self.entry);
        let args = || {
            let request = self.request.clone().unwrap_or_default();
            wire::message_to_args(&self.record.schema().request, request)
        };
        let inbound = || Inbound::from_values(Vec::new());

        match self.record.handler().clone() {
            Handler::Unary(f) => {
                let outcome = f(scope, args()).await;
                self.settle(outcome);
            }
            Handler::ServerStream(f) => self.output = Some(f(scope, args())),
            Handler::ClientStream(f) => {
                let input = self.inbound.take().unwrap_or_else(inbound);
                let outcome = f(scope, input).await;
                self.settle(outcome);
            }
            Handler::Duplex(f) => {
                let input = self.inbound.take().unwrap_or_else(inbound);
                self.output = Some(f(scope, input));
            }
        }
    }

    fn settle(&mut self, outcome: anyhow::Result<Value>) {
        match outcome {
            Ok(value) => self.ret = Some(value),
            Err(e) => self.err = Some(Status::unknown(e.to_string())),
        }
    }

    /// Response of a single-response call.
    pub(crate) fn into_unary(self) -> Result<Value, Status> {
        match (self.err, self.ret) {
            (Some(status), _) => Err(status),
            (None, ret) => Ok(ret.unwrap_or(Value::Null)),
        }
    }

    /// Response of a stream-response call.
    pub(crate) fn into_stream(self) -> BoxStream<'static, Result<Value, Status>> {
        if let Some(status) = self.err {
            return stream::once(async move { Err(status) }).boxed();
        }
        match (self.output, self.ret) {
            (Some(output), _) => output
                .map_err(|e| Status::unknown(e.to_string()))
                .boxed(),
            (None, Some(value)) => stream::once(async move { Ok(value) }).boxed(),
            (None, None) => stream::empty().boxed(),
        }
    }
}

/// Ordered list of middleware layers shared by a node's server.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    layers: Arc<RwLock<Vec<Arc<dyn Middleware>>>>,
}

impl MiddlewareChain {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a layer; it becomes the innermost one.
    pub fn push(&self, layer: Arc<dyn Middleware>) {
        self.layers.write().push(layer);
    }

    /// Number of installed layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.read().len()
    }

    /// Returns `true` when no layer is installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.read().is_empty()
    }

    /// Runs a call through every layer and the handler.
    pub async fn run(&self, ctx: &mut CallContext) {
        let layers = self.layers.read().clone();
        Next { layers: &layers }.run(ctx).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Api;
    use crate::schema::{FieldType, MessageSchema, MethodSchema};
    use parking_lot::Mutex;
    use serde_json::json;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Recorder {
        async fn handle(&self, ctx: &mut CallContext, next: Next<'_>) {
            self.log.lock().push(format!("before-{}", self.name));
            next.run(ctx).await;
            self.log.lock().push(format!("after-{}", self.name));
        }
    }

    struct Deny;

    #[async_trait]
    impl Middleware for Deny {
        async fn handle(&self, ctx: &mut CallContext, _next: Next<'_>) {
            ctx.err = Some(Status::permission_denied("denied"));
        }
    }

    struct Shout;

    #[async_trait]
    impl Middleware for Shout {
        async fn handle(&self, ctx: &mut CallContext, next: Next<'_>) {
            if let Some(request) = ctx.request.as_mut() {
                if let Some(Value::String(s)) = request.get_mut("you") {
                    *s = s.to_uppercase();
                }
            }
            next.run(ctx).await;
        }
    }

    fn setup(log: Arc<Mutex<Vec<String>>>) -> (MethodRegistry, Arc<MethodRecord>) {
        let registry = MethodRegistry::new();
        let schema = MethodSchema::new(
            MessageSchema::new().field("you", FieldType::String),
            MessageSchema::result(FieldType::String),
        );
        registry
            .register(&Api::new().method(
                "greet",
                schema,
                Handler::unary(move |_, args| {
                    let log = log.clone();
                    async move {
                        log.lock().push("handler".to_string());
                        Ok(json!(format!("hi {}", args[0].as_str().unwrap_or_default())))
                    }
                }),
            ))
            .expect("register");
        let record = registry.get("greet").expect("registered");
        (registry, record)
    }

    fn context(registry: &MethodRegistry, record: &Arc<MethodRecord>) -> CallContext {
        let mut request = Message::new();
        request.insert("you".to_string(), json!("there"));
        CallContext::new(
            record.clone(),
            registry.clone(),
            MetadataMap::new(),
            Some(request),
            None,
        )
    }

    #[tokio::test]
    async fn test_onion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (registry, record) = setup(log.clone());
        let chain = MiddlewareChain::new();
        chain.push(Arc::new(Recorder { name: "1", log: log.clone() }));
        chain.push(Arc::new(Recorder { name: "2", log: log.clone() }));

        let mut ctx = context(&registry, &record);
        chain.run(&mut ctx).await;

        assert_eq!(
            *log.lock(),
            vec!["before-1", "before-2", "handler", "after-2", "after-1"]
        );
        assert_eq!(ctx.into_unary().ok(), Some(json!("hi there")));
    }

    #[tokio::test]
    async fn test_short_circuit_skips_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (registry, record) = setup(log.clone());
        let chain = MiddlewareChain::new();
        chain.push(Arc::new(Deny));

        let mut ctx = context(&registry, &record);
        chain.run(&mut ctx).await;

        assert!(log.lock().is_empty());
        let status = ctx.into_unary().unwrap_err();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);
    }

    #[tokio::test]
    async fn test_layers_rewrite_request() {
        let (registry, record) = setup(Arc::new(Mutex::new(Vec::new())));
        let chain = MiddlewareChain::new();
        chain.push(Arc::new(Shout));

        let mut ctx = context(&registry, &record);
        chain.run(&mut ctx).await;
        assert_eq!(ctx.into_unary().ok(), Some(json!("hi THERE")));
    }

    #[tokio::test]
    async fn test_empty_chain_calls_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (registry, record) = setup(log.clone());
        let mut ctx = context(&registry, &record);
        MiddlewareChain::new().run(&mut ctx).await;
        assert!(ctx.is_settled());
        assert_eq!(*log.lock(), vec!["handler"]);
    }

    #[tokio::test]
    async fn test_unsettled_stream_is_empty() {
        let (registry, record) = setup(Arc::new(Mutex::new(Vec::new())));
        let ctx = context(&registry, &record);
        let items: Vec<_> = ctx.into_stream().collect().await;
        assert!(items.is_empty());
    }
}
