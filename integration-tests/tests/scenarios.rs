//! End-to-end mesh scenarios.
//!
//! Unary calls across nodes, remote failures, provider failover, streamed
//! results and middleware ordering.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{stream, StreamExt, TryStreamExt};
use meshwork::schema::{FieldType, MessageSchema, MethodSchema};
use meshwork::{Api, CallContext, Handler, MeshError, Middleware, Next};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

mod common;

use common::{unary, TestMesh, ANNOUNCE, GRACE};

fn simple_api() -> Api {
    Api::new().method(
        "testSimple",
        unary(&[("you", FieldType::String)], FieldType::String),
        Handler::unary(|_, args| async move {
            let you = args.first().and_then(Value::as_str).unwrap_or_default();
            Ok(json!(format!("test pass {you}")))
        }),
    )
}

fn whoami_api(name: &'static str) -> Api {
    Api::new().method(
        "whoami",
        unary(&[], FieldType::String),
        Handler::unary(move |_, _| async move { Ok(json!(name)) }),
    )
}

/// A unary call reaches the provider on another node.
#[tokio::test]
async fn test_simple_call_across_nodes() -> Result<()> {
    let mut mesh = TestMesh::new();
    mesh.serve("node1", &simple_api()).await?;
    let node2 = mesh.client("node2");

    let reply = node2.query().get("testSimple").call(vec![json!("this")]).await?;
    assert_eq!(reply, json!("test pass this"));

    mesh.shutdown().await;
    Ok(())
}

/// A handler error is carried back with its message.
#[tokio::test]
async fn test_remote_error_keeps_message() -> Result<()> {
    let mut mesh = TestMesh::new();
    let api = Api::new().method(
        "explode",
        unary(&[], FieldType::String),
        Handler::unary(|_, _| async { Err(anyhow::anyhow!("boom")) }),
    );
    mesh.serve("node1", &api).await?;
    let node2 = mesh.client("node2");

    let err = node2.query().get("explode").call(vec![]).await.unwrap_err();
    assert!(err.is_remote(), "unexpected error: {err}");
    assert!(err.to_string().contains("boom"));

    mesh.shutdown().await;
    Ok(())
}

/// Destroying one of two providers leaves the other serving every call.
#[tokio::test]
async fn test_failover_after_provider_destroyed() -> Result<()> {
    let mut mesh = TestMesh::new();
    let node2a = mesh.serve("node2a", &whoami_api("node2a")).await?;
    mesh.serve("node2b", &whoami_api("node2b")).await?;
    let caller = mesh.client("caller");

    let first = caller.query().get("whoami").call(vec![]).await?;
    assert!(first == json!("node2a") || first == json!("node2b"));

    node2a.destroy(GRACE).await;
    sleep(ANNOUNCE * 2).await;

    for _ in 0..20 {
        let served_by = caller.query().get("whoami").call(vec![]).await?;
        assert_eq!(served_by, json!("node2b"));
    }

    mesh.shutdown().await;
    Ok(())
}

/// A streamed result arrives item by item, in order.
#[tokio::test]
async fn test_stream_yields_items_in_order() -> Result<()> {
    let mut mesh = TestMesh::new();
    let api = Api::new().method(
        "count",
        MethodSchema::new(MessageSchema::new(), MessageSchema::result(FieldType::Int32))
            .with_response_stream(),
        Handler::server_stream(|_, _| {
            stream::iter(1..=9).then(|n| async move {
                sleep(Duration::from_millis(10)).await;
                Ok(json!(n))
            })
        }),
    );
    mesh.serve("node1", &api).await?;
    let node2 = mesh.client("node2");

    let items: Vec<Value> = node2.query().get("count").call(vec![]).try_collect().await?;
    assert_eq!(items, (1..=9).map(|n| json!(n)).collect::<Vec<_>>());

    let collected = node2.query().get("count").call(vec![]).await?;
    assert_eq!(collected, json!([1, 2, 3, 4, 5, 6, 7, 8, 9]));

    mesh.shutdown().await;
    Ok(())
}

struct Recorder {
    label: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Middleware for Recorder {
    async fn handle(&self, ctx: &mut CallContext, next: Next<'_>) {
        self.log.lock().push(format!("before-{}", self.label));
        next.run(ctx).await;
        self.log.lock().push(format!("after-{}", self.label));
    }
}

/// Middleware wraps the handler in onion order.
#[tokio::test]
async fn test_middleware_onion_order() -> Result<()> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let handler_log = log.clone();
    let api = Api::new().method(
        "traced",
        unary(&[], FieldType::Bool),
        Handler::unary(move |_, _| {
            let log = handler_log.clone();
            async move {
                log.lock().push("handler".to_string());
                Ok(json!(true))
            }
        }),
    );

    let mut mesh = TestMesh::new();
    let node1 = mesh.serve("node1", &api).await?;
    node1.use_middleware(Recorder {
        label: "1",
        log: log.clone(),
    });
    node1.use_middleware(Recorder {
        label: "2",
        log: log.clone(),
    });
    let node2 = mesh.client("node2");

    assert_eq!(node2.query().get("traced").call(vec![]).await?, json!(true));
    assert_eq!(
        *log.lock(),
        vec!["before-1", "before-2", "handler", "after-2", "after-1"]
    );

    mesh.shutdown().await;
    Ok(())
}

struct Deny;

#[async_trait]
impl Middleware for Deny {
    async fn handle(&self, ctx: &mut CallContext, _next: Next<'_>) {
        ctx.err = Some(tonic::Status::permission_denied(format!("{} is closed", ctx.entry)));
    }
}

/// A layer that skips `next` answers in place of the handler.
#[tokio::test]
async fn test_middleware_short_circuit() -> Result<()> {
    let mut mesh = TestMesh::new();
    let node1 = mesh.serve("node1", &simple_api()).await?;
    node1.use_middleware(Deny);
    let node2 = mesh.client("node2");

    let err = node2
        .query()
        .get("testSimple")
        .call(vec![json!("x")])
        .await
        .unwrap_err();
    assert!(
        matches!(&err, MeshError::RemoteCall { message, .. } if message == "testSimple is closed"),
        "unexpected error: {err}"
    );

    mesh.shutdown().await;
    Ok(())
}
