//! Shared test utilities for integration tests.
//!
//! Builds meshes of real nodes serving gRPC on loopback ports, all sharing one
//! in-process coordination store.

#![allow(dead_code)]

use anyhow::Result;
use meshwork::schema::{FieldType, MessageSchema, MethodSchema};
use meshwork::store::MemoryStore;
use meshwork::{Api, MeshNode, NodeName, NodeOptions};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Announce interval used by every test node.
pub const ANNOUNCE: Duration = Duration::from_millis(50);

/// Drain grace used when tearing nodes down.
pub const GRACE: Duration = Duration::from_secs(2);

/// Options for a loopback node with a short announce interval.
pub fn options(name: &str) -> NodeOptions {
    NodeOptions::default()
        .with_name(NodeName::parse(name).expect("valid node name"))
        .with_listen(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
        .with_announce_interval(ANNOUNCE)
        .with_lease_ttl(2)
        .with_call_timeout(Duration::from_secs(5))
}

/// Schema of a unary method taking `params` positionally.
pub fn unary(params: &[(&str, FieldType)], result: FieldType) -> MethodSchema {
    let request = params
        .iter()
        .fold(MessageSchema::new(), |message, (name, ty)| message.field(*name, ty.clone()));
    MethodSchema::new(request, MessageSchema::result(result))
}

/// A set of nodes over one store, torn down together.
pub struct TestMesh {
    /// Store shared by every node.
    pub store: Arc<MemoryStore>,
    nodes: Vec<Arc<MeshNode>>,
}

impl TestMesh {
    /// Creates an empty mesh.
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            nodes: Vec::new(),
        }
    }

    /// Starts a node serving `api`.
    pub async fn serve(&mut self, name: &str, api: &Api) -> Result<Arc<MeshNode>> {
        self.serve_with(options(name), api).await
    }

    /// Starts a node with custom options serving `api`.
    pub async fn serve_with(&mut self, options: NodeOptions, api: &Api) -> Result<Arc<MeshNode>> {
        let node = Arc::new(MeshNode::new(options, self.store.clone()));
        node.register(api)?;
        node.init().await?;
        self.nodes.push(node.clone());
        Ok(node)
    }

    /// Adds a node that only calls others.
    pub fn client(&mut self, name: &str) -> Arc<MeshNode> {
        self.add(MeshNode::new(options(name), self.store.clone()))
    }

    /// Adds an already built node so it is torn down with the mesh.
    pub fn add(&mut self, node: MeshNode) -> Arc<MeshNode> {
        let node = Arc::new(node);
        self.nodes.push(node.clone());
        node
    }

    /// Destroys every node.
    pub async fn shutdown(self) {
        for node in self.nodes {
            node.destroy(GRACE).await;
        }
    }
}

/// Retries `check` until it succeeds or five seconds pass.
pub async fn eventually<F, Fut, T>(mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match check().await {
            Ok(value) => return Ok(value),
            Err(e) if Instant::now() >= deadline => return Err(e),
            Err(_) => sleep(Duration::from_millis(20)).await,
        }
    }
}
