//! Method handlers and the inbound stream bridge.

use super::scope::Scope;
use crate::error::MeshError;
use crate::schema::StreamKind;
use futures_util::future::BoxFuture;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Positional arguments of a call.
pub type Args = Vec<Value>;

/// Items produced by a streaming handler.
pub type HandlerStream = BoxStream<'static, anyhow::Result<Value>>;

type UnaryFn = dyn Fn(Scope, Args) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;
type ServerStreamFn = dyn Fn(Scope, Args) -> HandlerStream + Send + Sync;
type ClientStreamFn = dyn Fn(Scope, Inbound) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;
type DuplexFn = dyn Fn(Scope, Inbound) -> HandlerStream + Send + Sync;

/// Capacity of the channel between an inbound request stream and its handler.
pub const INBOUND_CAPACITY: usize = 16;

/// The implementation of one mesh method.
///
/// The variant must match the stream flags of the method's schema.
#[derive(Clone)]
pub enum Handler {
    /// One request, one response.
    Unary(Arc<UnaryFn>),
    /// One request, a stream of responses.
    ServerStream(Arc<ServerStreamFn>),
    /// A stream of requests, one response.
    ClientStream(Arc<ClientStreamFn>),
    /// Streams in both directions.
    Duplex(Arc<DuplexFn>),
}

impl Handler {
    /// Wraps an async function of the positional arguments.
    pub fn unary<F, Fut>(f: F) -> Self
    where
        F: Fn(Scope, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::Unary(Arc::new(move |scope, args| Box::pin(f(scope, args))))
    }

    /// Wraps a function producing a stream of results.
    pub fn server_stream<F, S>(f: F) -> Self
    where
        F: Fn(Scope, Args) -> S + Send + Sync + 'static,
        S: Stream<Item = anyhow::Result<Value>> + Send + 'static,
    {
        Self::ServerStream(Arc::new(move |scope, args| f(scope, args).boxed()))
    }

    /// Wraps an async function consuming a stream of request items.
    pub fn client_stream<F, Fut>(f: F) -> Self
    where
        F: Fn(Scope, Inbound) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::ClientStream(Arc::new(move |scope, inbound| Box::pin(f(scope, inbound))))
    }

    /// Wraps a function mapping a request stream to a response stream.
    pub fn duplex<F, S>(f: F) -> Self
    where
        F: Fn(Scope, Inbound) -> S + Send + Sync + 'static,
        S: Stream<Item = anyhow::Result<Value>> + Send + 'static,
    {
        Self::Duplex(Arc::new(move |scope, inbound| f(scope, inbound).boxed()))
    }

    /// Stream direction this handler implements.
    #[must_use]
    pub fn kind(&self) -> StreamKind {
        match self {
            Self::Unary(_) => StreamKind::Unary,
            Self::ServerStream(_) => StreamKind::ServerStream,
            Self::ClientStream(_) => StreamKind::ClientStream,
            Self::Duplex(_) => StreamKind::Duplex,
        }
    }
}

/// Request items of a client-stream or duplex call.
///
/// Items arrive through a bounded channel: while the handler is not reading,
/// the source is not polled. Dropping `Inbound` stops the source.
pub struct Inbound {
    rx: mpsc::Receiver<Result<Value, MeshError>>,
}

impl Inbound {
    /// Feeds `source` into a new `Inbound` from a background pump task.
    pub fn pump<S>(source: S) -> Self
    where
        S: Stream<Item = Result<Value, MeshError>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        tokio::spawn(async move {
            let mut source = std::pin::pin!(source);
            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    item = source.next() => match item {
                        Some(item) => {
                            if tx.send(item).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
        Self { rx }
    }

    /// An `Inbound` yielding the given values, then ending.
    #[must_use]
    pub fn from_values(values: Vec<Value>) -> Self {
        Self::pump(futures_util::stream::iter(values.into_iter().map(Ok)))
    }

    /// Receives the next item, or `None` once the caller finished sending.
    pub async fn recv(&mut self) -> Option<Result<Value, MeshError>> {
        self.rx.recv().await
    }
}

impl Stream for Inbound {
    type Item = Result<Value, MeshError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_kind_follows_constructor() {
        assert_eq!(
            Handler::unary(|_, _| async { Ok(Value::Null) }).kind(),
            StreamKind::Unary
        );
        assert_eq!(
            Handler::server_stream(|_, _| stream::empty()).kind(),
            StreamKind::ServerStream
        );
        assert_eq!(
            Handler::client_stream(|_, _| async { Ok(Value::Null) }).kind(),
            StreamKind::ClientStream
        );
        assert_eq!(
            Handler::duplex(|_, inbound: Inbound| inbound.map(|i| i.map_err(Into::into))).kind(),
            StreamKind::Duplex
        );
    }

    #[tokio::test]
    async fn test_inbound_preserves_order() {
        let inbound = Inbound::from_values(vec![json!(1), json!(2), json!(3)]);
        let items: Vec<Value> = inbound.filter_map(|i| async { i.ok() }).collect().await;
        assert_eq!(items, vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn test_pump_applies_backpressure() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let source = stream::iter(0..1000).map(move |i| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!(i))
        });
        let mut inbound = Inbound::pump(source);

        assert_eq!(inbound.recv().await.and_then(Result::ok), Some(json!(0)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        // one consumed, a full channel, and at most one item held by the pump
        assert!(pulled.load(Ordering::SeqCst) <= INBOUND_CAPACITY + 2);
    }
}
