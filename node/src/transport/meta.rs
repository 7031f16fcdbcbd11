//! The reserved schema query method.
//!
//! Every node answers `_query_proto` so a caller that only knows a host can
//! learn the wire schema of an entry before calling it.

use super::client::ClientPool;
use super::codec::{encode_single, SchemaCodec};
use super::naming::META_ENTRY;
use crate::error::MeshError;
use crate::registry::MethodRegistry;
use crate::schema::wire::{Message, Part, WireError};
use crate::schema::{FieldType, MessageSchema, MethodSchema};
use axum::extract::Request;
use axum::response::Response;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use tonic::Status;
use tracing::debug;

/// Schema of the meta method: `{entry: string} -> {result: string}`.
pub static META_SCHEMA: LazyLock<Arc<MethodSchema>> = LazyLock::new(|| {
    Arc::new(MethodSchema::new(
        MessageSchema::new().field("entry", FieldType::String),
        MessageSchema::result(FieldType::String),
    ))
});

/// Answers a meta query against `registry`.
///
/// An empty entry returns a JSON object of every registered schema.
fn lookup(registry: &MethodRegistry, entry: &str) -> Result<String, Status> {
    let encode_err = |e: serde_json::Error| Status::internal(e.to_string());
    if entry.is_empty() {
        let all = registry
            .snapshot()
            .into_iter()
            .map(|(entry, record)| Ok((entry, serde_json::to_value(record.schema().as_ref())?)))
            .collect::<Result<Map<String, Value>, serde_json::Error>>()
            .map_err(encode_err)?;
        return serde_json::to_string(&all).map_err(encode_err);
    }
    let record = registry
        .get(entry)
        .ok_or_else(|| Status::not_found(format!("entry '{entry}' is not served here")))?;
    record.schema().to_json().map_err(encode_err)
}

pub(super) async fn serve(registry: MethodRegistry, req: Request) -> Response {
    let svc = tower::service_fn(move |req: tonic::Request<Message>| {
        let registry = registry.clone();
        async move {
            let entry = req
                .get_ref()
                .get("entry")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            debug!(%entry, "Schema query");
            let text = lookup(&registry, &entry)?;
            encode_single(&META_SCHEMA, Part::Response, Value::String(text)).map(tonic::Response::new)
        }
    });
    tonic::server::Grpc::new(SchemaCodec::server(META_SCHEMA.clone()))
        .unary(svc, req)
        .await
        .map(axum::body::Body::new)
}

async fn query(pool: &ClientPool, host: &str, entry: &str) -> Result<String, MeshError> {
    let value = pool
        .unary(host, META_ENTRY, META_SCHEMA.clone(), vec![Value::from(entry)])
        .await
        .map_err(|e| match e {
            MeshError::EntryNotFound(_) => MeshError::EntryNotFound(entry.to_string()),
            other => other,
        })?;
    match value {
        Value::String(text) => Ok(text),
        other => Err(WireError::Malformed(format!("schema query returned {other}")).into()),
    }
}

/// Fetches the schema of `entry` from the node at `host`.
///
/// # Errors
///
/// Returns [`MeshError::EntryNotFound`] if the node does not serve `entry`.
pub async fn fetch_schema(pool: &ClientPool, host: &str, entry: &str) -> Result<MethodSchema, MeshError> {
    let text = query(pool, host, entry).await?;
    MethodSchema::from_json(&text)
        .map_err(|e| WireError::Malformed(format!("schema of {entry}: {e}")).into())
}

/// Fetches every schema served by the node at `host`, keyed by entry.
///
/// # Errors
///
/// Returns the call error if the node cannot be reached.
pub async fn fetch_all(pool: &ClientPool, host: &str) -> Result<BTreeMap<String, MethodSchema>, MeshError> {
    let text = query(pool, host, "").await?;
    serde_json::from_str(&text)
        .map_err(|e| WireError::Malformed(format!("schema listing: {e}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Api, Handler};

    #[test]
    fn test_lookup() {
        let registry = MethodRegistry::new();
        let schema = MethodSchema::new(MessageSchema::new(), MessageSchema::result(FieldType::Bool));
        registry
            .register(&Api::new().method(
                "ping",
                schema.clone(),
                Handler::unary(|_, _| async { Ok(Value::Bool(true)) }),
            ))
            .expect("register");

        let text = lookup(&registry, "ping").expect("known entry");
        assert_eq!(MethodSchema::from_json(&text).ok(), Some(schema.clone()));

        let all: BTreeMap<String, MethodSchema> =
            serde_json::from_str(&lookup(&registry, "").expect("listing")).expect("json");
        assert_eq!(all.get("ping"), Some(&schema));

        let status = lookup(&registry, "missing").unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }
}
