//! Wire message schemas for mesh methods.
//!
//! A [`MethodSchema`] describes the request and response messages of one
//! method plus any nested message types they reference. Schemas are produced
//! by an external generator; this module only models, validates and hashes
//! them. The encoding itself lives in [`wire`].

pub mod wire;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Scalar or nested type of a message field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// 64-bit float.
    Double,
    /// 32-bit float.
    Float,
    /// Signed 32-bit integer.
    Int32,
    /// Signed 64-bit integer.
    Int64,
    /// Unsigned 32-bit integer.
    Uint32,
    /// Unsigned 64-bit integer.
    Uint64,
    /// Boolean.
    Bool,
    /// UTF-8 string.
    String,
    /// Raw bytes, represented as a JSON array of numbers.
    Bytes,
    /// Nested message, looked up by name in [`MethodSchema::types`].
    Message(String),
}

impl FieldType {
    /// Returns `true` for types that may be packed when repeated.
    #[must_use]
    pub fn is_packable(&self) -> bool {
        !matches!(self, Self::String | Self::Bytes | Self::Message(_))
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Double => write!(f, "double"),
            Self::Float => write!(f, "float"),
            Self::Int32 => write!(f, "int32"),
            Self::Int64 => write!(f, "int64"),
            Self::Uint32 => write!(f, "uint32"),
            Self::Uint64 => write!(f, "uint64"),
            Self::Bool => write!(f, "bool"),
            Self::String => write!(f, "string"),
            Self::Bytes => write!(f, "bytes"),
            Self::Message(name) => write!(f, "{name}"),
        }
    }
}

/// Cardinality of a field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldRule {
    /// Must be present unless a default is declared.
    #[default]
    Required,
    /// May be absent.
    Optional,
    /// Zero or more values.
    Repeated,
}

/// One field of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSchema {
    /// Field name, used as the JSON object key.
    pub name: String,
    /// Protobuf field number.
    pub id: u32,
    /// Value type (for map fields, the value type).
    #[serde(rename = "type")]
    pub ty: FieldType,
    /// Cardinality.
    #[serde(default)]
    pub rule: FieldRule,
    /// Key type for map fields. Only `string` is supported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_type: Option<FieldType>,
    /// Value used on decode when the field is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl FieldSchema {
    /// Creates a required field.
    pub fn new(name: impl Into<String>, id: u32, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            id,
            ty,
            rule: FieldRule::Required,
            key_type: None,
            default: None,
        }
    }

    /// Marks the field optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.rule = FieldRule::Optional;
        self
    }

    /// Marks the field repeated.
    #[must_use]
    pub fn repeated(mut self) -> Self {
        self.rule = FieldRule::Repeated;
        self
    }

    /// Turns the field into a string-keyed map of its type.
    #[must_use]
    pub fn map(mut self) -> Self {
        self.key_type = Some(FieldType::String);
        self
    }

    /// Declares the value applied on decode when the field is absent.
    #[must_use]
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Returns `true` for map fields.
    #[must_use]
    pub fn is_map(&self) -> bool {
        self.key_type.is_some()
    }
}

/// An ordered set of fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageSchema {
    /// Fields in declaration order.
    #[serde(default)]
    pub fields: Vec<FieldSchema>,
}

impl MessageSchema {
    /// Creates a message with no fields.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the single-field response message carrying `ty` as `result`.
    #[must_use]
    pub fn result(ty: FieldType) -> Self {
        Self::new().with(FieldSchema::new("result", 1, ty))
    }

    /// Appends a required field numbered after the existing ones.
    #[must_use]
    pub fn field(self, name: impl Into<String>, ty: FieldType) -> Self {
        let id = self.next_id();
        self.with(FieldSchema::new(name, id, ty))
    }

    /// Appends a fully specified field.
    #[must_use]
    pub fn with(mut self, field: FieldSchema) -> Self {
        self.fields.push(field);
        self
    }

    /// Looks up a field by number.
    #[must_use]
    pub fn field_by_id(&self, id: u32) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.id == id)
    }

    /// Fields sorted by ascending id, the positional argument order.
    #[must_use]
    pub fn positional(&self) -> Vec<&FieldSchema> {
        let mut fields: Vec<_> = self.fields.iter().collect();
        fields.sort_by_key(|f| f.id);
        fields
    }

    fn next_id(&self) -> u32 {
        self.fields.iter().map(|f| f.id).max().unwrap_or(0) + 1
    }
}

/// Full wire description of one method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodSchema {
    /// Client sends a stream of request items.
    #[serde(default)]
    pub request_stream: bool,
    /// Server answers with a stream of result items.
    #[serde(default)]
    pub response_stream: bool,
    /// Request message; fields are the positional arguments in id order.
    pub request: MessageSchema,
    /// Response message; empty for methods returning nothing.
    pub response: MessageSchema,
    /// Nested message types referenced by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub types: BTreeMap<String, MessageSchema>,
}

/// Stream direction of a method, derived from its schema flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// One request, one response.
    Unary,
    /// One request, a stream of responses.
    ServerStream,
    /// A stream of requests, one response.
    ClientStream,
    /// Streams in both directions.
    Duplex,
}

impl StreamKind {
    /// Returns `true` when the response side is a stream.
    #[must_use]
    pub fn streams_response(self) -> bool {
        matches!(self, Self::ServerStream | Self::Duplex)
    }

    /// Returns `true` when the request side is a stream.
    #[must_use]
    pub fn streams_request(self) -> bool {
        matches!(self, Self::ClientStream | Self::Duplex)
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unary => write!(f, "unary"),
            Self::ServerStream => write!(f, "server-stream"),
            Self::ClientStream => write!(f, "client-stream"),
            Self::Duplex => write!(f, "duplex"),
        }
    }
}

impl MethodSchema {
    /// Creates a unary schema from its request and response messages.
    #[must_use]
    pub fn new(request: MessageSchema, response: MessageSchema) -> Self {
        Self {
            request_stream: false,
            response_stream: false,
            request,
            response,
            types: BTreeMap::new(),
        }
    }

    /// Marks the request side as a stream.
    #[must_use]
    pub fn with_request_stream(mut self) -> Self {
        self.request_stream = true;
        self
    }

    /// Marks the response side as a stream.
    #[must_use]
    pub fn with_response_stream(mut self) -> Self {
        self.response_stream = true;
        self
    }

    /// Adds a nested message type.
    #[must_use]
    pub fn with_type(mut self, name: impl Into<String>, message: MessageSchema) -> Self {
        self.types.insert(name.into(), message);
        self
    }

    /// Stream direction of the method.
    #[must_use]
    pub fn kind(&self) -> StreamKind {
        match (self.request_stream, self.response_stream) {
            (false, false) => StreamKind::Unary,
            (false, true) => StreamKind::ServerStream,
            (true, false) => StreamKind::ClientStream,
            (true, true) => StreamKind::Duplex,
        }
    }

    /// Content hash identifying this schema across processes.
    ///
    /// Lowercase hex SHA-256 of [`MethodSchema::canonical_json`].
    ///
    /// # Errors
    ///
    /// Returns an error if a default value cannot be serialized.
    pub fn hash(&self) -> Result<String, serde_json::Error> {
        Ok(hex::encode(Sha256::digest(self.canonical_json()?)))
    }

    /// Compact JSON with every object's keys sorted, at any depth.
    ///
    /// # Errors
    ///
    /// Returns an error if a default value cannot be serialized.
    pub fn canonical_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&sorted_keys(serde_json::to_value(self)?))
    }

    /// Canonical JSON text of the schema, as stored and served by the mesh.
    ///
    /// # Errors
    ///
    /// Returns an error if a default value cannot be serialized.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses a schema previously produced by [`MethodSchema::to_json`].
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid schema.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Checks that the schema can be encoded.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        self.validate_message("request", &self.request)?;
        self.validate_message("response", &self.response)?;
        for (name, message) in &self.types {
            self.validate_message(name, message)?;
        }
        if self.response.fields.len() > 1 {
            return Err(format!(
                "response must carry at most one field, found {}",
                self.response.fields.len()
            ));
        }
        if self.request_stream && self.request.fields.len() != 1 {
            return Err("a streaming request must carry exactly one field".to_string());
        }
        Ok(())
    }

    fn validate_message(&self, label: &str, message: &MessageSchema) -> Result<(), String> {
        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for field in &message.fields {
            if field.id == 0 {
                return Err(format!("{label}.{}: field id must be positive", field.name));
            }
            if !ids.insert(field.id) {
                return Err(format!("{label}: duplicate field id {}", field.id));
            }
            if !names.insert(field.name.as_str()) {
                return Err(format!("{label}: duplicate field name {}", field.name));
            }
            if let FieldType::Message(name) = &field.ty {
                if !self.types.contains_key(name) {
                    return Err(format!("{label}.{}: unknown type {name}", field.name));
                }
            }
            match &field.key_type {
                None | Some(FieldType::String) => {}
                Some(other) => {
                    return Err(format!(
                        "{label}.{}: unsupported map key type {other}",
                        field.name
                    ))
                }
            }
        }
        Ok(())
    }
}

/// Rebuilds every object with its keys inserted in sorted order.
fn sorted_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> =
                map.into_iter().map(|(k, v)| (k, sorted_keys(v))).collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sorted_keys).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo() -> MethodSchema {
        MethodSchema::new(
            MessageSchema::new().field("you", FieldType::String),
            MessageSchema::result(FieldType::String),
        )
    }

    #[test]
    fn test_hash_is_stable_and_content_addressed() -> anyhow::Result<()> {
        assert_eq!(echo().hash()?, echo().hash()?);
        assert_eq!(echo().hash()?.len(), 64);
        assert_ne!(echo().hash()?, echo().with_response_stream().hash()?);
        Ok(())
    }

    #[test]
    fn test_canonical_json_sorts_keys() -> anyhow::Result<()> {
        let text = String::from_utf8(echo().canonical_json()?)?;
        let order: Vec<usize> = ["\"request\"", "\"requestStream\"", "\"response\"", "\"responseStream\""]
            .iter()
            .filter_map(|key| text.find(key))
            .collect();
        assert_eq!(order.len(), 4, "{text}");
        assert!(order.windows(2).all(|w| w[0] < w[1]), "{text}");

        let expected = hex::encode(Sha256::digest(text.as_bytes()));
        assert_eq!(echo().hash()?, expected);
        Ok(())
    }

    #[test]
    fn test_json_roundtrip_uses_camel_case() -> anyhow::Result<()> {
        let schema = echo().with_request_stream();
        let text = schema.to_json()?;
        assert!(text.contains("\"requestStream\":true"));
        assert!(text.contains("\"type\":\"string\""));
        assert_eq!(MethodSchema::from_json(&text)?, schema);
        Ok(())
    }

    #[test]
    fn test_nested_type_serializes_as_tagged() -> anyhow::Result<()> {
        let field = FieldSchema::new("point", 1, FieldType::Message("Point".into()));
        assert_eq!(serde_json::to_value(&field)?["type"], json!({"message": "Point"}));
        Ok(())
    }

    #[test]
    fn test_field_ids_are_assigned_in_order() {
        let message = MessageSchema::new()
            .field("a", FieldType::Int32)
            .field("b", FieldType::Int32);
        let ids: Vec<_> = message.fields.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_kind_from_flags() {
        assert_eq!(echo().kind(), StreamKind::Unary);
        assert_eq!(echo().with_response_stream().kind(), StreamKind::ServerStream);
        assert_eq!(echo().with_request_stream().kind(), StreamKind::ClientStream);
        assert_eq!(
            echo().with_request_stream().with_response_stream().kind(),
            StreamKind::Duplex
        );
    }

    #[test]
    fn test_validate_rejects_bad_schemas() {
        assert!(echo().validate().is_ok());

        let dup = MethodSchema::new(
            MessageSchema::new()
                .with(FieldSchema::new("a", 1, FieldType::Int32))
                .with(FieldSchema::new("b", 1, FieldType::Int32)),
            MessageSchema::new(),
        );
        assert!(dup.validate().unwrap_err().contains("duplicate field id"));

        let unknown = MethodSchema::new(
            MessageSchema::new().field("p", FieldType::Message("Point".into())),
            MessageSchema::new(),
        );
        assert!(unknown.validate().unwrap_err().contains("unknown type"));

        let bad_key = MethodSchema::new(
            MessageSchema::new().with(FieldSchema {
                key_type: Some(FieldType::Int32),
                ..FieldSchema::new("m", 1, FieldType::String)
            }),
            MessageSchema::new(),
        );
        assert!(bad_key.validate().unwrap_err().contains("map key"));

        let two_args_stream = MethodSchema::new(
            MessageSchema::new()
                .field("a", FieldType::Int32)
                .field("b", FieldType::Int32),
            MessageSchema::new(),
        )
        .with_request_stream();
        assert!(two_args_stream.validate().is_err());
    }
}
