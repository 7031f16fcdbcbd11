//! Query side of the mesh: build an entry path, then call it.
//!
//! ```no_run
//! # async fn demo(node: &meshwork::MeshNode) -> Result<(), meshwork::MeshError> {
//! use futures_util::StreamExt;
//! use serde_json::json;
//!
//! let api = node.query();
//! let greeting = api.get("testSimple").call(vec![json!("this")]).await?;
//!
//! let mut numbers = api.path("counter/range").call(vec![json!(1), json!(9)]);
//! while let Some(n) = numbers.next().await {
//!     println!("{}", n?);
//! }
//! # Ok(())
//! # }
//! ```

use crate::caller::{CallOptions, Caller, Input};
use crate::error::MeshError;
use crate::registry::Args;
use crate::retry::RetryPolicy;
use crate::schema::MethodSchema;
use crate::transport::{meta, ClientPool, TransportSecurity, ValueStream};
use futures_util::future::BoxFuture;
use futures_util::stream::{Stream, StreamExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::IntoFuture;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

/// A path into the mesh's method tree.
///
/// Building a query never fails; an unknown entry is reported when it is
/// called.
#[derive(Clone)]
pub struct Query {
    caller: Arc<Caller>,
    segments: Vec<String>,
}

impl Query {
    pub(crate) fn new(caller: Arc<Caller>) -> Self {
        Self {
            caller,
            segments: Vec::new(),
        }
    }

    /// Descends into one child.
    #[must_use]
    pub fn get(&self, segment: &str) -> Self {
        let mut next = self.clone();
        next.segments.push(segment.to_string());
        next
    }

    /// Descends along a slash-joined path.
    #[must_use]
    pub fn path(&self, path: &str) -> Self {
        let mut next = self.clone();
        next.segments
            .extend(path.split('/').filter(|s| !s.is_empty()).map(str::to_string));
        next
    }

    /// Entry this query names.
    #[must_use]
    pub fn entry(&self) -> String {
        self.segments.join("/")
    }

    /// Calls the entry with positional arguments.
    ///
    /// For an entry taking a request stream, each argument is sent as one item.
    pub fn call(&self, args: Args) -> Call {
        Call::new(self.caller.clone(), self.entry(), Input::Args(args))
    }

    /// Calls the entry with a stream of request items.
    pub fn call_stream<S>(&self, input: S) -> Call
    where
        S: Stream<Item = Value> + Send + 'static,
    {
        Call::new(
            self.caller.clone(),
            self.entry(),
            Input::Stream(input.map(Ok).boxed()),
        )
    }

    /// Calls the entry with a fallible stream of request items.
    ///
    /// The first `Err` closes the request stream and fails the call with
    /// [`MeshError::Input`].
    pub fn try_call_stream<S, E>(&self, input: S) -> Call
    where
        S: Stream<Item = Result<Value, E>> + Send + 'static,
        E: std::fmt::Display,
    {
        let entry = self.entry();
        let items = input.map(move |item| item.map_err(|e| MeshError::Input(e.to_string())));
        Call::new(self.caller.clone(), entry, Input::Stream(items.boxed()))
    }
}

enum CallState {
    Idle(Input),
    Opening(BoxFuture<'static, Result<ValueStream, MeshError>>),
    Streaming(ValueStream),
    Done,
}

/// One pending call.
///
/// Await it for the whole result (stream results arrive as an array), or
/// iterate it as a [`Stream`] (a unary result arrives as one item). Nothing
/// is sent until either happens. Awaiting a call after polling it as a
/// stream fails with [`MeshError::Input`].
#[must_use = "a call does nothing until awaited or polled"]
pub struct Call {
    caller: Arc<Caller>,
    entry: String,
    options: CallOptions,
    state: CallState,
}

impl Call {
    fn new(caller: Arc<Caller>, entry: String, input: Input) -> Self {
        Self {
            caller,
            entry,
            options: CallOptions::default(),
            state: CallState::Idle(input),
        }
    }

    /// Makes up to `attempts` attempts if this is a unary call.
    pub fn retry(mut self, attempts: u32) -> Self {
        self.options.retry = Some(attempts);
        self
    }

    /// Pauses `delay` between attempts.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.options.retry_delay = Some(delay);
        self
    }

    /// Fails with [`MeshError::Timeout`] if no response arrives within
    /// `deadline`. Streamed responses are not bounded.
    pub fn timeout(mut self, deadline: Duration) -> Self {
        self.options.timeout = Some(deadline);
        self
    }

    /// Entry being called.
    #[must_use]
    pub fn entry(&self) -> &str {
        &self.entry
    }
}

impl IntoFuture for Call {
    type Output = Result<Value, MeshError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        let Self {
            caller,
            entry,
            options,
            state,
        } = self;
        Box::pin(async move {
            let CallState::Idle(input) = state else {
                return Err(MeshError::Input(format!(
                    "{entry}: call was already polled as a stream"
                )));
            };
            caller.call(&entry, input, options).await
        })
    }
}

impl Stream for Call {
    type Item = Result<Value, MeshError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            match std::mem::replace(&mut this.state, CallState::Done) {
                CallState::Idle(input) => {
                    let caller = this.caller.clone();
                    let entry = this.entry.clone();
                    let options = this.options;
                    this.state = CallState::Opening(Box::pin(async move {
                        caller.open(&entry, input, options).await
                    }));
                }
                CallState::Opening(mut opening) => match opening.as_mut().poll(cx) {
                    Poll::Pending => {
                        this.state = CallState::Opening(opening);
                        return Poll::Pending;
                    }
                    Poll::Ready(Ok(stream)) => this.state = CallState::Streaming(stream),
                    Poll::Ready(Err(e)) => return Poll::Ready(Some(Err(e))),
                },
                CallState::Streaming(mut stream) => {
                    let polled = stream.poll_next_unpin(cx);
                    if !matches!(polled, Poll::Ready(None)) {
                        this.state = CallState::Streaming(stream);
                    }
                    return polled;
                }
                CallState::Done => return Poll::Ready(None),
            }
        }
    }
}

/// Calls the methods of one node directly, without a coordination store.
///
/// Schemas are fetched from the node's meta entry on first use and kept.
pub struct MeshClient {
    caller: Arc<Caller>,
    host: String,
}

impl MeshClient {
    /// Client for the node serving at `host` (`addr:port`).
    #[must_use]
    pub fn new(host: impl Into<String>, security: TransportSecurity) -> Self {
        let host = host.into();
        let caller = Caller::fixed(
            host.clone(),
            ClientPool::new(security),
            RetryPolicy::default(),
            Duration::from_secs(30),
        );
        Self {
            caller: Arc::new(caller),
            host,
        }
    }

    /// Root of the node's method tree.
    #[must_use]
    pub fn query(&self) -> Query {
        Query::new(self.caller.clone())
    }

    /// Every schema the node serves, keyed by entry.
    ///
    /// # Errors
    ///
    /// Returns the call error if the node cannot be reached.
    pub async fn schemas(&self) -> Result<BTreeMap<String, MethodSchema>, MeshError> {
        meta::fetch_all(self.caller.pool(), &self.host).await
    }

    /// Host this client calls.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }
}
