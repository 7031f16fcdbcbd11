//! The outbound side: lazily connected channels and the four call shapes.

use super::codec::SchemaCodec;
use super::{naming, TransportSecurity, ValueStream};
use crate::error::MeshError;
use crate::registry::Args;
use crate::schema::wire::{self, Message, Part};
use crate::schema::MethodSchema;
use bytes::Bytes;
use futures_util::future;
use futures_util::stream::{self, Stream, StreamExt};
use http::uri::PathAndQuery;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tonic::client::Grpc;
use tonic::codec::Streaming;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

/// One channel per host, shared by every entry served there.
#[derive(Clone)]
pub struct ClientPool {
    channels: Arc<Mutex<HashMap<String, Channel>>>,
    security: TransportSecurity,
}

impl ClientPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new(security: TransportSecurity) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            security,
        }
    }

    /// Returns the channel for `host`, creating it on first use.
    ///
    /// The channel connects on its first call and reconnects on its own.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Transport`] if `host` is not a valid authority or
    /// the TLS configuration is rejected.
    pub fn channel(&self, host: &str) -> Result<Channel, MeshError> {
        let mut channels = self.channels.lock();
        if let Some(channel) = channels.get(host) {
            return Ok(channel.clone());
        }

        let uri = format!("{}://{host}", self.security.scheme());
        let mut endpoint = Endpoint::from_shared(uri)
            .map_err(|e| MeshError::Transport(format!("invalid host '{host}': {e}")))?;
        if let Some(tls) = self.security.client_config() {
            endpoint = endpoint.tls_config(tls)?;
        }
        let channel = endpoint.connect_lazy();
        debug!(%host, "Created channel");
        channels.insert(host.to_string(), channel.clone());
        Ok(channel)
    }

    /// Number of hosts with an open channel.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    /// Returns `true` when no channel was created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    /// Drops every channel.
    pub fn clear(&self) {
        self.channels.lock().clear();
    }

    async fn ready(&self, host: &str, entry: &str) -> Result<(Grpc<Channel>, PathAndQuery), MeshError> {
        let mut grpc = Grpc::new(self.channel(host)?);
        grpc.ready()
            .await
            .map_err(|e| MeshError::Transport(format!("{entry} at {host}: {e}")))?;
        let path = PathAndQuery::try_from(naming::grpc_path(entry))
            .map_err(|e| MeshError::Transport(format!("{entry}: invalid path: {e}")))?;
        Ok((grpc, path))
    }

    /// One request, one response.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Wire`] if `args` do not fit the schema, before
    /// anything is sent; otherwise the mapped call status.
    pub async fn unary(
        &self,
        host: &str,
        entry: &str,
        schema: Arc<MethodSchema>,
        args: Args,
    ) -> Result<Value, MeshError> {
        let request = encode_args(&schema, args)?;
        let (mut grpc, path) = self.ready(host, entry).await?;
        let response = grpc
            .unary(tonic::Request::new(request), path, SchemaCodec::client(schema.clone()))
            .await
            .map_err(|status| MeshError::from_status(entry, &status))?;
        Ok(wire::unwrap_single(&schema.response, response.into_inner()))
    }

    /// One request, a stream of responses.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Wire`] if `args` do not fit the schema; otherwise
    /// the mapped status of opening the stream.
    pub async fn server_stream(
        &self,
        host: &str,
        entry: &str,
        schema: Arc<MethodSchema>,
        args: Args,
    ) -> Result<ValueStream, MeshError> {
        let request = encode_args(&schema, args)?;
        let (mut grpc, path) = self.ready(host, entry).await?;
        let response = grpc
            .server_streaming(tonic::Request::new(request), path, SchemaCodec::client(schema.clone()))
            .await
            .map_err(|status| MeshError::from_status(entry, &status))?;
        Ok(results(entry, &schema, response.into_inner()))
    }

    /// A stream of requests, one response.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Wire`] for the first item that does not fit the
    /// schema, the error of a failing `input`, or the mapped call status.
    pub async fn client_stream(
        &self,
        host: &str,
        entry: &str,
        schema: Arc<MethodSchema>,
        input: ValueStream,
    ) -> Result<Value, MeshError> {
        let (mut grpc, path) = self.ready(host, entry).await?;
        let aborted = Aborted::default();
        let outbound = encode_items(entry, &schema, input, aborted.clone());
        let response = grpc
            .client_streaming(tonic::Request::new(outbound), path, SchemaCodec::client(schema.clone()))
            .await;
        aborted.check()?;
        let response = response.map_err(|status| MeshError::from_status(entry, &status))?;
        Ok(wire::unwrap_single(&schema.response, response.into_inner()))
    }

    /// Streams in both directions.
    ///
    /// A request item that fails to encode, or an error from `input`, closes
    /// the request side and ends the result stream with that error.
    ///
    /// # Errors
    ///
    /// Returns the mapped status of opening the stream.
    pub async fn duplex(
        &self,
        host: &str,
        entry: &str,
        schema: Arc<MethodSchema>,
        input: ValueStream,
    ) -> Result<ValueStream, MeshError> {
        let (mut grpc, path) = self.ready(host, entry).await?;
        let aborted = Aborted::default();
        let outbound = encode_items(entry, &schema, input, aborted.clone());
        let response = grpc
            .streaming(tonic::Request::new(outbound), path, SchemaCodec::client(schema.clone()))
            .await;
        aborted.check()?;
        let response = response.map_err(|status| MeshError::from_status(entry, &status))?;
        let tail = stream::once(async move { aborted.check() })
            .filter_map(|checked| future::ready(checked.err().map(Err)));
        Ok(results(entry, &schema, response.into_inner()).chain(tail).boxed())
    }
}

fn encode_args(schema: &MethodSchema, args: Args) -> Result<Bytes, MeshError> {
    let message = wire::args_to_message(&schema.request, args);
    Ok(wire::encode(schema, Part::Request, &message)?)
}

/// First failure of an outbound request stream.
#[derive(Clone, Default)]
struct Aborted(Arc<Mutex<Option<MeshError>>>);

impl Aborted {
    fn set(&self, err: MeshError) {
        self.0.lock().get_or_insert(err);
    }

    fn check(&self) -> Result<(), MeshError> {
        self.0.lock().take().map_or(Ok(()), Err)
    }
}

/// Encodes request items, closing the stream at the first one that fails.
///
/// The failure is left in `aborted`; the request then ends normally, so the
/// caller must check it before trusting the response.
fn encode_items(
    entry: &str,
    schema: &Arc<MethodSchema>,
    input: ValueStream,
    aborted: Aborted,
) -> impl Stream<Item = Bytes> + Send + 'static {
    let schema = schema.clone();
    let entry = entry.to_string();
    input
        .map(move |item| {
            item.and_then(|value| {
                let message = wire::wrap_single(&schema.request, value);
                Ok(wire::encode(&schema, Part::Request, &message)?)
            })
        })
        .scan(aborted, move |aborted, encoded| {
            future::ready(match encoded {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    debug!(%entry, error = %e, "Closing request stream");
                    aborted.set(e);
                    None
                }
            })
        })
}

fn results(entry: &str, schema: &Arc<MethodSchema>, output: Streaming<Message>) -> ValueStream {
    let schema = schema.clone();
    let entry = entry.to_string();
    output
        .map(move |item| {
            item.map(|message| wire::unwrap_single(&schema.response, message))
                .map_err(|status| MeshError::from_status(&entry, &status))
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_per_host() {
        let pool = ClientPool::new(TransportSecurity::default());
        pool.channel("127.0.0.1:1").expect("valid");
        pool.channel("127.0.0.1:1").expect("valid");
        pool.channel("127.0.0.1:2").expect("valid");
        assert_eq!(pool.len(), 2);

        pool.clear();
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_bad_args_fail_before_sending() {
        use crate::schema::{FieldType, MessageSchema};

        let pool = ClientPool::new(TransportSecurity::default());
        let schema = Arc::new(MethodSchema::new(
            MessageSchema::new().field("n", FieldType::Int32),
            MessageSchema::new(),
        ));
        let err = pool
            .unary("127.0.0.1:1", "m", schema, vec![Value::from("not a number")])
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Wire(_)));
        assert!(pool.is_empty());
    }
}
