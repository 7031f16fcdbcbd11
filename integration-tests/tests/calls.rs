//! Integration tests for the unary call surface: values, retries, deadlines,
//! nested entries and the direct client.

use anyhow::Result;
use meshwork::schema::{FieldSchema, FieldType, MessageSchema, MethodSchema};
use meshwork::{Api, Handler, MeshClient, MeshError, TransportSecurity};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

mod common;

use common::{unary, TestMesh};

/// Echoes its three arguments back as one object.
fn echo_api() -> Api {
    let schema = MethodSchema::new(
        MessageSchema::new()
            .with(FieldSchema::new("xs", 1, FieldType::Int32).repeated())
            .with(FieldSchema::new("tags", 2, FieldType::String).map())
            .with(FieldSchema::new("who", 3, FieldType::String).with_default(json!("anon"))),
        MessageSchema::result(FieldType::Message("Echo".into())),
    )
    .with_type(
        "Echo",
        MessageSchema::new()
            .with(FieldSchema::new("xs", 1, FieldType::Int32).repeated())
            .with(FieldSchema::new("tags", 2, FieldType::String).map())
            .field("who", FieldType::String),
    );
    Api::new().method(
        "echo",
        schema,
        Handler::unary(|_, args| async move {
            Ok(json!({"xs": args[0], "tags": args[1], "who": args[2]}))
        }),
    )
}

/// Arrays, maps and declared defaults survive the trip.
#[tokio::test]
async fn test_structured_values_round_trip() -> Result<()> {
    let mut mesh = TestMesh::new();
    mesh.serve("node1", &echo_api()).await?;
    let node2 = mesh.client("node2");

    let full = node2
        .query()
        .get("echo")
        .call(vec![json!([1, -2, 3]), json!({"k": "v"}), json!("bob")])
        .await?;
    assert_eq!(full, json!({"xs": [1, -2, 3], "tags": {"k": "v"}, "who": "bob"}));

    // Omitted trailing arguments decode as empty collections or defaults.
    let sparse = node2.query().get("echo").call(vec![json!([])]).await?;
    assert_eq!(sparse, json!({"xs": [], "tags": {}, "who": "anon"}));

    mesh.shutdown().await;
    Ok(())
}

/// A value of the wrong type fails before anything is sent.
#[tokio::test]
async fn test_type_mismatch_is_rejected() -> Result<()> {
    let mut mesh = TestMesh::new();
    mesh.serve("node1", &echo_api()).await?;
    let node2 = mesh.client("node2");

    let err = node2
        .query()
        .get("echo")
        .call(vec![json!("not a list")])
        .await
        .unwrap_err();
    assert!(!err.is_remote(), "unexpected error: {err}");
    assert!(err.to_string().contains("xs"), "unexpected error: {err}");

    mesh.shutdown().await;
    Ok(())
}

fn flaky_api(failures: u32, calls: Arc<AtomicU32>) -> Api {
    Api::new().method(
        "flaky",
        unary(&[], FieldType::Uint32),
        Handler::unary(move |_, _| {
            let calls = calls.clone();
            async move {
                let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt <= failures {
                    anyhow::bail!("attempt {attempt} failed");
                }
                Ok(json!(attempt))
            }
        }),
    )
}

/// Enough attempts ride over transient failures.
#[tokio::test]
async fn test_retry_recovers_from_failures() -> Result<()> {
    let calls = Arc::new(AtomicU32::new(0));
    let mut mesh = TestMesh::new();
    mesh.serve("node1", &flaky_api(2, calls.clone())).await?;
    let node2 = mesh.client("node2");

    let attempt = node2.query().get("flaky").call(vec![]).retry(3).await?;
    assert_eq!(attempt, json!(3));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    mesh.shutdown().await;
    Ok(())
}

/// Too few attempts surface the last failure.
#[tokio::test]
async fn test_retry_exhausted_keeps_last_error() -> Result<()> {
    let calls = Arc::new(AtomicU32::new(0));
    let mut mesh = TestMesh::new();
    mesh.serve("node1", &flaky_api(5, calls.clone())).await?;
    let node2 = mesh.client("node2");

    let err = node2.query().get("flaky").call(vec![]).retry(2).await.unwrap_err();
    match &err {
        MeshError::RetryExhausted { attempts, last } => {
            assert_eq!(*attempts, 2);
            assert!(last.to_string().contains("attempt 2 failed"), "unexpected: {last}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_remote());
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    mesh.shutdown().await;
    Ok(())
}

/// Retries also cover finding a provider, so one appearing mid-call is used.
#[tokio::test]
async fn test_retry_waits_for_late_provider() -> Result<()> {
    let api = Api::new().method(
        "late",
        unary(&[], FieldType::String),
        Handler::unary(|_, _| async { Ok(json!("here")) }),
    );
    let mut mesh = TestMesh::new();
    let caller = mesh.client("caller");

    let err = caller.query().get("late").call(vec![]).await.unwrap_err();
    assert!(matches!(err, MeshError::EntryNotFound(_)), "unexpected error: {err}");

    let call = caller
        .query()
        .get("late")
        .call(vec![])
        .retry(40)
        .retry_delay(Duration::from_millis(50));
    let (reply, served) = tokio::join!(call.into_future(), async {
        sleep(Duration::from_millis(150)).await;
        mesh.serve("provider", &api).await
    });
    served?;
    assert_eq!(reply?, json!("here"));

    mesh.shutdown().await;
    Ok(())
}

/// Entries registered on the calling node run in-process, even before it serves.
#[tokio::test]
async fn test_own_entries_are_called_locally() -> Result<()> {
    let calls = Arc::new(AtomicU32::new(0));
    let mut mesh = TestMesh::new();
    let node = mesh.client("solo");
    node.register(&flaky_api(1, calls.clone()))?;
    node.register(&nested_api())?;
    assert!(node.local_addr().is_none());

    let sum = node
        .query()
        .path("billing/invoice/total")
        .call(vec![json!(40), json!(2)])
        .await?;
    assert_eq!(sum, json!(42));

    // Local handlers take part in retries like remote ones.
    let attempt = node.query().get("flaky").call(vec![]).retry(2).await?;
    assert_eq!(attempt, json!(2));
    assert!(mesh.store.keys().is_empty());

    mesh.shutdown().await;
    Ok(())
}

/// A slow handler is cut off at the caller's deadline.
#[tokio::test]
async fn test_call_timeout() -> Result<()> {
    let api = Api::new().method(
        "slow",
        unary(&[], FieldType::Bool),
        Handler::unary(|_, _| async {
            sleep(Duration::from_secs(2)).await;
            Ok(json!(true))
        }),
    );
    let mut mesh = TestMesh::new();
    mesh.serve("node1", &api).await?;
    let node2 = mesh.client("node2");

    let err = node2
        .query()
        .get("slow")
        .call(vec![])
        .timeout(Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::Timeout(_)), "unexpected error: {err}");

    mesh.shutdown().await;
    Ok(())
}

fn nested_api() -> Api {
    Api::new().group(
        "billing",
        Api::new().group(
            "invoice",
            Api::new().method(
                "total",
                unary(&[("a", FieldType::Int64), ("b", FieldType::Int64)], FieldType::Int64),
                Handler::unary(|_, args| async move {
                    Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
                }),
            ),
        ),
    )
}

/// Grouped methods are addressed by their full path, either way it is built.
#[tokio::test]
async fn test_nested_entries() -> Result<()> {
    let mut mesh = TestMesh::new();
    mesh.serve("node1", &nested_api()).await?;
    let node2 = mesh.client("node2");

    let stepwise = node2
        .query()
        .get("billing")
        .get("invoice")
        .get("total")
        .call(vec![json!(2), json!(40)])
        .await?;
    assert_eq!(stepwise, json!(42));

    let joined = node2
        .query()
        .path("billing/invoice/total")
        .call(vec![json!(1), json!(1)])
        .await?;
    assert_eq!(joined, json!(2));

    let err = node2.query().path("billing/invoice").call(vec![]).await.unwrap_err();
    assert!(matches!(err, MeshError::EntryNotFound(_)), "unexpected error: {err}");

    mesh.shutdown().await;
    Ok(())
}

/// A direct client reaches one node without the coordination store.
#[tokio::test]
async fn test_direct_client() -> Result<()> {
    let mut mesh = TestMesh::new();
    let node1 = mesh.serve("node1", &nested_api()).await?;
    let addr = node1.local_addr().ok_or_else(|| anyhow::anyhow!("node1 not bound"))?;

    let client = MeshClient::new(addr.to_string(), TransportSecurity::default());
    let sum = client
        .query()
        .path("billing/invoice/total")
        .call(vec![json!(20), json!(3)])
        .await?;
    assert_eq!(sum, json!(23));

    let schemas = client.schemas().await?;
    assert_eq!(schemas.keys().collect::<Vec<_>>(), vec!["billing/invoice/total"]);

    mesh.shutdown().await;
    Ok(())
}
