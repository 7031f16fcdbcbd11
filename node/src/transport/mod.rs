//! gRPC transport with runtime schemas.
//!
//! The server side is a single tonic server that routes by request path; the
//! client side is a pool of lazily connected channels. Both use
//! [`codec::SchemaCodec`], so no service is generated ahead of time.

pub mod client;
pub mod codec;
pub mod meta;
pub mod naming;
pub(crate) mod server;
mod tls;

pub use client::ClientPool;
pub use tls::{KeyCertPair, TransportSecurity};

use crate::error::MeshError;
use futures_util::stream::BoxStream;
use serde_json::Value;

/// Results of a streaming call, in order.
pub type ValueStream = BoxStream<'static, Result<Value, MeshError>>;
