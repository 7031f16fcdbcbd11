//! Meshwork - a zero-config RPC mesh runtime.
//!
//! Every process runs a [`MeshNode`]. A node serves a tree of named async
//! methods over gRPC and calls the methods of other nodes through a
//! [`Query`]. Nodes find each other through a coordination store (etcd, or
//! [`store::MemoryStore`] in process) where each one announces its entries
//! under a lease. Wire messages are built at runtime from each method's
//! [`MethodSchema`], so no interface files are compiled ahead of time.
//!
//! ```no_run
//! use meshwork::schema::{FieldType, MessageSchema, MethodSchema};
//! use meshwork::store::MemoryStore;
//! use meshwork::{Api, Handler, MeshNode, NodeOptions};
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//!
//! let server = MeshNode::new(NodeOptions::default(), store.clone());
//! server.register(&Api::new().method(
//!     "testSimple",
//!     MethodSchema::new(
//!         MessageSchema::new().field("you", FieldType::String),
//!         MessageSchema::result(FieldType::String),
//!     ),
//!     Handler::unary(|_, args| async move {
//!         Ok(Value::from(format!("test pass {}", args[0].as_str().unwrap_or_default())))
//!     }),
//! ))?;
//! server.init().await?;
//!
//! let client = MeshNode::new(NodeOptions::default(), store);
//! let reply = client.query().get("testSimple").call(vec![json!("this")]).await?;
//! assert_eq!(reply, json!("test pass this"));
//!
//! server.destroy(Duration::from_secs(5)).await;
//! client.destroy(Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

/// Outbound call path shared by nodes and direct clients.
pub mod caller;
/// Announcement, discovery and provider selection.
pub mod discovery;
/// Error taxonomy.
pub mod error;
/// Infrastructure components (config, telemetry).
pub mod infrastructure;
/// Server-side interceptors.
pub mod middleware;
/// Node lifecycle.
pub mod node;
/// Query proxy and direct client.
pub mod proxy;
/// Method trees, handlers and the per-node registry.
pub mod registry;
/// Bounded retry.
pub mod retry;
/// Method schemas and their wire encoding.
pub mod schema;
/// Coordination store abstraction.
pub mod store;
/// gRPC transport.
pub mod transport;

pub use error::MeshError;
pub use middleware::{CallContext, Middleware, Next};
pub use node::{MeshNode, NodeEvent, NodeName, NodeOptions};
pub use proxy::{Call, MeshClient, Query};
pub use registry::{Api, Args, Handler, Inbound, Scope};
pub use retry::RetryPolicy;
pub use schema::MethodSchema;
pub use transport::{KeyCertPair, TransportSecurity};
