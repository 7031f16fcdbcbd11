//! The inbound side: one gRPC server routing every entry of a registry.
//!
//! There are no generated services. An axum fallback handler looks the request
//! path up in the registry and hands the call to `tonic::server::Grpc` with a
//! codec built from the method's schema.

use super::codec::{encode_single, SchemaCodec};
use super::{meta, naming, TransportSecurity};
use crate::error::MeshError;
use crate::middleware::{CallContext, MiddlewareChain};
use crate::registry::{Inbound, MethodRecord, MethodRegistry};
use crate::schema::wire::{self, Message, Part};
use crate::schema::StreamKind;
use axum::extract::{Request, State};
use axum::response::Response;
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use metrics::{counter, histogram};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::codec::Streaming;
use tonic::service::Routes;
use tonic::transport::Server;
use tonic::Status;
use tracing::{debug, info, instrument, warn};

type Frames = BoxStream<'static, Result<Bytes, Status>>;

/// Routes inbound calls to registered handlers through the middleware chain.
pub(crate) struct Dispatcher {
    registry: MethodRegistry,
    chain: MiddlewareChain,
}

impl Dispatcher {
    pub(crate) fn new(registry: MethodRegistry, chain: MiddlewareChain) -> Self {
        Self { registry, chain }
    }

    async fn context(
        &self,
        record: Arc<MethodRecord>,
        metadata: tonic::metadata::MetadataMap,
        request: Option<Message>,
        inbound: Option<Inbound>,
    ) -> CallContext {
        let mut ctx = CallContext::new(record, self.registry.clone(), metadata, request, inbound);
        self.chain.run(&mut ctx).await;
        ctx
    }

    async fn unary(
        &self,
        record: Arc<MethodRecord>,
        req: tonic::Request<Message>,
    ) -> Result<tonic::Response<Bytes>, Status> {
        let (metadata, _, message) = req.into_parts();
        let schema = record.schema().clone();
        let ctx = self.context(record, metadata, Some(message), None).await;
        let value = ctx.into_unary()?;
        encode_single(&schema, Part::Response, value).map(tonic::Response::new)
    }

    async fn server_stream(
        &self,
        record: Arc<MethodRecord>,
        req: tonic::Request<Message>,
    ) -> Result<tonic::Response<Frames>, Status> {
        let (metadata, _, message) = req.into_parts();
        let ctx = self.context(record.clone(), metadata, Some(message), None).await;
        Ok(tonic::Response::new(frames(&record, ctx)))
    }

    async fn client_stream(
        &self,
        record: Arc<MethodRecord>,
        req: tonic::Request<Streaming<Message>>,
    ) -> Result<tonic::Response<Bytes>, Status> {
        let (metadata, _, input) = req.into_parts();
        let schema = record.schema().clone();
        let inbound = inbound(&record, input);
        let ctx = self.context(record, metadata, None, Some(inbound)).await;
        let value = ctx.into_unary()?;
        encode_single(&schema, Part::Response, value).map(tonic::Response::new)
    }

    async fn duplex(
        &self,
        record: Arc<MethodRecord>,
        req: tonic::Request<Streaming<Message>>,
    ) -> Result<tonic::Response<Frames>, Status> {
        let (metadata, _, input) = req.into_parts();
        let inbound = inbound(&record, input);
        let ctx = self.context(record.clone(), metadata, None, Some(inbound)).await;
        Ok(tonic::Response::new(frames(&record, ctx)))
    }

    #[instrument(name = "mesh.serve", skip_all, fields(entry = %record.entry()))]
    async fn call(self: Arc<Self>, record: Arc<MethodRecord>, req: Request) -> Response {
        let entry = record.entry().to_string();
        let started = Instant::now();
        counter!("meshwork_calls_total", "entry" => entry.clone()).increment(1);
        debug!(%entry, kind = %record.kind(), "Inbound call");

        let mut grpc = tonic::server::Grpc::new(SchemaCodec::server(record.schema().clone()));
        let response = match record.kind() {
            StreamKind::Unary => {
                let svc = tower::service_fn(move |req| {
                    let (this, record) = (self.clone(), record.clone());
                    async move { this.unary(record, req).await }
                });
                grpc.unary(svc, req).await
            }
            StreamKind::ServerStream => {
                let svc = tower::service_fn(move |req| {
                    let (this, record) = (self.clone(), record.clone());
                    async move { this.server_stream(record, req).await }
                });
                grpc.server_streaming(svc, req).await
            }
            StreamKind::ClientStream => {
                let svc = tower::service_fn(move |req| {
                    let (this, record) = (self.clone(), record.clone());
                    async move { this.client_stream(record, req).await }
                });
                grpc.client_streaming(svc, req).await
            }
            StreamKind::Duplex => {
                let svc = tower::service_fn(move |req| {
                    let (this, record) = (self.clone(), record.clone());
                    async move { this.duplex(record, req).await }
                });
                grpc.streaming(svc, req).await
            }
        };

        if response
            .headers()
            .get("grpc-status")
            .is_some_and(|code| code != "0")
        {
            counter!("meshwork_call_errors_total", "entry" => entry.clone()).increment(1);
        }
        histogram!("meshwork_call_duration_seconds", "entry" => entry)
            .record(started.elapsed().as_secs_f64());
        response.map(axum::body::Body::new)
    }
}

/// Adapts decoded request frames into the handler's inbound stream.
fn inbound(record: &MethodRecord, input: Streaming<Message>) -> Inbound {
    let schema = record.schema().clone();
    let entry = record.entry().to_string();
    Inbound::pump(input.map(move |item| {
        item.map(|message| wire::unwrap_single(&schema.request, message))
            .map_err(|status| MeshError::from_status(&entry, &status))
    }))
}

/// Encodes the handler's output stream frame by frame.
fn frames(record: &MethodRecord, ctx: CallContext) -> Frames {
    let schema = record.schema().clone();
    let entry = record.entry().to_string();
    ctx.into_stream()
        .map(move |item| {
            item.and_then(|value| encode_single(&schema, Part::Response, value))
                .inspect_err(|status| {
                    counter!("meshwork_call_errors_total", "entry" => entry.clone()).increment(1);
                    debug!(%entry, error = %status.message(), "Stream ended with error");
                })
        })
        .boxed()
}

async fn dispatch(State(dispatcher): State<Arc<Dispatcher>>, req: Request) -> Response {
    let path = req.uri().path().to_string();
    if path == naming::grpc_path(naming::META_ENTRY) {
        return meta::serve(dispatcher.registry.clone(), req).await;
    }
    match dispatcher.registry.route(&path) {
        Some(record) => dispatcher.call(record, req).await,
        None => {
            debug!(%path, "No method registered for path");
            Status::unimplemented(format!("no method at {path}")).into_http()
        }
    }
}

/// A running server.
pub(crate) struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), tonic::transport::Error>>,
}

impl ServerHandle {
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting calls and waits up to `grace` for in-flight calls.
    ///
    /// Calls still running after `grace` are cut off.
    pub(crate) async fn drain(mut self, grace: Duration) -> Result<(), MeshError> {
        if let Some(shutdown) = self.shutdown.take() {
            if shutdown.send(()).is_err() {
                debug!("Server already stopped");
            }
        }
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(result)) => result.map_err(MeshError::from),
            Ok(Err(e)) => Err(MeshError::Transport(format!("server task failed: {e}"))),
            Err(_) => {
                warn!(?grace, "Drain grace elapsed, forcing server shutdown");
                self.task.abort();
                Ok(())
            }
        }
    }
}

/// Serves every method of the dispatcher's registry on `listener`.
///
/// # Errors
///
/// Returns [`MeshError::Transport`] if the listener address cannot be read or
/// the TLS configuration is rejected.
pub(crate) fn serve(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    security: &TransportSecurity,
) -> Result<ServerHandle, MeshError> {
    let local_addr = listener
        .local_addr()
        .map_err(|e| MeshError::Transport(format!("listener address: {e}")))?;

    let mut builder = Server::builder();
    if let Some(tls) = security.server_config()? {
        builder = builder.tls_config(tls)?;
    }
    let router = axum::Router::new()
        .fallback(dispatch)
        .with_state(dispatcher);

    let (shutdown, signal) = oneshot::channel::<()>();
    let serving = builder
        .add_routes(Routes::from(router))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
            if signal.await.is_err() {
                debug!("Shutdown sender dropped");
            }
        });
    let task = tokio::spawn(serving);
    info!(%local_addr, "Transport server listening");

    Ok(ServerHandle {
        local_addr,
        shutdown: Some(shutdown),
        task,
    })
}
