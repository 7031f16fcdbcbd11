//! Protobuf wire encoding driven by a runtime [`MethodSchema`].
//!
//! Values are `serde_json` objects keyed by field name. Encoding follows the
//! protobuf rules: varints for integers and booleans, fixed-width floats,
//! length-delimited strings, bytes and nested messages. Repeated numeric fields
//! are written packed and read in either form. Maps are repeated key/value
//! entry messages.

use super::{FieldRule, FieldSchema, FieldType, MessageSchema, MethodSchema};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::encoding::{decode_key, decode_varint, encode_key, encode_varint, WireType};
use serde_json::{Map, Number, Value};

/// A decoded message: field name to value.
pub type Message = Map<String, Value>;

/// Errors raised while encoding or decoding a message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WireError {
    /// A value does not have the shape its field requires.
    #[error("{path}: {expected} expected")]
    TypeMismatch {
        /// Dotted path of the offending field.
        path: String,
        /// What the schema requires.
        expected: &'static str,
    },
    /// A nested message type is not declared in the schema.
    #[error("{path}: unknown message type {name}")]
    UnknownType {
        /// Dotted path of the offending field.
        path: String,
        /// Missing type name.
        name: String,
    },
    /// The bytes are not a valid encoding of the message.
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Which message of a method to encode or decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Part {
    /// The request message.
    Request,
    /// The response message.
    Response,
}

impl MethodSchema {
    /// Returns the request or response message.
    #[must_use]
    pub fn part(&self, part: Part) -> &MessageSchema {
        match part {
            Part::Request => &self.request,
            Part::Response => &self.response,
        }
    }
}

/// Encodes `value` as the given part of `schema`.
///
/// Absent and `null` fields are omitted.
///
/// # Errors
///
/// Returns [`WireError::TypeMismatch`] if a value does not fit its field.
pub fn encode(schema: &MethodSchema, part: Part, value: &Message) -> Result<Bytes, WireError> {
    let mut buf = BytesMut::new();
    Walker { schema }.write_message("", schema.part(part), value, &mut buf)?;
    Ok(buf.freeze())
}

/// Decodes the given part of `schema` from the remaining bytes of `buf`.
///
/// Unknown fields are skipped. Absent fields take their declared default, or
/// `[]` for repeated fields, `{}` for maps and `null` otherwise.
///
/// # Errors
///
/// Returns [`WireError::Malformed`] if the bytes do not match the schema.
pub fn decode<B: Buf>(schema: &MethodSchema, part: Part, buf: &mut B) -> Result<Message, WireError> {
    Walker { schema }.read_message("", schema.part(part), buf)
}

/// Maps positional arguments onto request fields in ascending id order.
///
/// Extra arguments are dropped.
#[must_use]
pub fn args_to_message(message: &MessageSchema, args: Vec<Value>) -> Message {
    message
        .positional()
        .into_iter()
        .zip(args)
        .map(|(field, value)| (field.name.clone(), value))
        .collect()
}

/// Reads request fields back into positional arguments.
#[must_use]
pub fn message_to_args(message: &MessageSchema, mut decoded: Message) -> Vec<Value> {
    message
        .positional()
        .into_iter()
        .map(|field| decoded.remove(&field.name).unwrap_or(Value::Null))
        .collect()
}

/// Wraps a single value in the first field of a message.
///
/// Used for results and for the items of streaming requests.
#[must_use]
pub fn wrap_single(message: &MessageSchema, value: Value) -> Message {
    let mut out = Message::new();
    if let Some(field) = message.fields.first() {
        out.insert(field.name.clone(), value);
    }
    out
}

/// Extracts the value of the first field of a message.
#[must_use]
pub fn unwrap_single(message: &MessageSchema, mut decoded: Message) -> Value {
    message
        .fields
        .first()
        .and_then(|field| decoded.remove(&field.name))
        .unwrap_or(Value::Null)
}

fn wire_type_of(ty: &FieldType) -> WireType {
    match ty {
        FieldType::Double => WireType::SixtyFourBit,
        FieldType::Float => WireType::ThirtyTwoBit,
        FieldType::Int32
        | FieldType::Int64
        | FieldType::Uint32
        | FieldType::Uint64
        | FieldType::Bool => WireType::Varint,
        FieldType::String | FieldType::Bytes | FieldType::Message(_) => WireType::LengthDelimited,
    }
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

fn mismatch(path: &str, expected: &'static str) -> WireError {
    WireError::TypeMismatch {
        path: path.to_string(),
        expected,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn integer(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15)
            .map(|f| f as i64)
    })
}

fn put_len_delimited(bytes: &[u8], buf: &mut BytesMut) {
    encode_varint(bytes.len() as u64, buf);
    buf.put_slice(bytes);
}

fn need<B: Buf>(buf: &B, len: usize) -> Result<(), WireError> {
    if buf.remaining() < len {
        return Err(WireError::Malformed(format!(
            "truncated: need {len} bytes, {} left",
            buf.remaining()
        )));
    }
    Ok(())
}

fn read_varint<B: Buf>(buf: &mut B) -> Result<u64, WireError> {
    decode_varint(buf).map_err(|e| WireError::Malformed(e.to_string()))
}

fn read_len<B: Buf>(buf: &mut B) -> Result<Bytes, WireError> {
    let len = usize::try_from(read_varint(buf)?)
        .map_err(|_| WireError::Malformed("length overflow".to_string()))?;
    need(buf, len)?;
    Ok(buf.copy_to_bytes(len))
}

fn skip<B: Buf>(wire_type: WireType, buf: &mut B) -> Result<(), WireError> {
    match wire_type {
        WireType::Varint => {
            read_varint(buf)?;
        }
        WireType::SixtyFourBit => {
            need(buf, 8)?;
            buf.advance(8);
        }
        WireType::ThirtyTwoBit => {
            need(buf, 4)?;
            buf.advance(4);
        }
        WireType::LengthDelimited => {
            read_len(buf)?;
        }
        WireType::StartGroup | WireType::EndGroup => {
            return Err(WireError::Malformed("groups are not supported".to_string()));
        }
    }
    Ok(())
}

fn float_value(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

struct Walker<'a> {
    schema: &'a MethodSchema,
}

impl<'a> Walker<'a> {
    fn lookup(&self, name: &str, path: &str) -> Result<&'a MessageSchema, WireError> {
        self.schema
            .types
            .get(name)
            .ok_or_else(|| WireError::UnknownType {
                path: path.to_string(),
                name: name.to_string(),
            })
    }

    fn write_message(
        &self,
        path: &str,
        message: &MessageSchema,
        value: &Message,
        buf: &mut BytesMut,
    ) -> Result<(), WireError> {
        for field in message.positional() {
            let path = join(path, &field.name);
            let Some(value) = value.get(&field.name).filter(|v| !v.is_null()) else {
                continue;
            };
            if field.is_map() {
                self.write_map(field, &path, value, buf)?;
            } else if field.rule == FieldRule::Repeated {
                self.write_repeated(field, &path, value, buf)?;
            } else {
                encode_key(field.id, wire_type_of(&field.ty), buf);
                self.write_value(&field.ty, &path, value, buf)?;
            }
        }
        Ok(())
    }

    fn write_repeated(
        &self,
        field: &FieldSchema,
        path: &str,
        value: &Value,
        buf: &mut BytesMut,
    ) -> Result<(), WireError> {
        let items = value.as_array().ok_or_else(|| mismatch(path, "array"))?;
        if !field.ty.is_packable() {
            for (i, item) in items.iter().enumerate() {
                encode_key(field.id, wire_type_of(&field.ty), buf);
                self.write_value(&field.ty, &format!("{path}[{i}]"), item, buf)?;
            }
            return Ok(());
        }
        if items.is_empty() {
            return Ok(());
        }
        let mut packed = BytesMut::new();
        for (i, item) in items.iter().enumerate() {
            self.write_value(&field.ty, &format!("{path}[{i}]"), item, &mut packed)?;
        }
        encode_key(field.id, WireType::LengthDelimited, buf);
        put_len_delimited(&packed, buf);
        Ok(())
    }

    fn write_map(
        &self,
        field: &FieldSchema,
        path: &str,
        value: &Value,
        buf: &mut BytesMut,
    ) -> Result<(), WireError> {
        let object = value.as_object().ok_or_else(|| mismatch(path, "object"))?;
        for (key, item) in object {
            let mut entry = BytesMut::new();
            encode_key(1, WireType::LengthDelimited, &mut entry);
            put_len_delimited(key.as_bytes(), &mut entry);
            if !item.is_null() {
                encode_key(2, wire_type_of(&field.ty), &mut entry);
                self.write_value(&field.ty, &join(path, key), item, &mut entry)?;
            }
            encode_key(field.id, WireType::LengthDelimited, buf);
            put_len_delimited(&entry, buf);
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn write_value(
        &self,
        ty: &FieldType,
        path: &str,
        value: &Value,
        buf: &mut BytesMut,
    ) -> Result<(), WireError> {
        match ty {
            FieldType::Double => {
                buf.put_f64_le(value.as_f64().ok_or_else(|| mismatch(path, "number"))?);
            }
            FieldType::Float => {
                let v = value.as_f64().ok_or_else(|| mismatch(path, "number"))?;
                buf.put_f32_le(v as f32);
            }
            FieldType::Int32 => {
                let v = integer(value)
                    .filter(|v| i32::try_from(*v).is_ok())
                    .ok_or_else(|| mismatch(path, "int32"))?;
                encode_varint(v as u64, buf);
            }
            FieldType::Int64 => {
                let v = integer(value).ok_or_else(|| mismatch(path, "integer"))?;
                encode_varint(v as u64, buf);
            }
            FieldType::Uint32 => {
                let v = value
                    .as_u64()
                    .filter(|v| u32::try_from(*v).is_ok())
                    .ok_or_else(|| mismatch(path, "uint32"))?;
                encode_varint(v, buf);
            }
            FieldType::Uint64 => {
                encode_varint(value.as_u64().ok_or_else(|| mismatch(path, "uint64"))?, buf);
            }
            FieldType::Bool => {
                let v = value.as_bool().ok_or_else(|| mismatch(path, "boolean"))?;
                encode_varint(u64::from(v), buf);
            }
            FieldType::String => {
                let v = value.as_str().ok_or_else(|| mismatch(path, "string"))?;
                put_len_delimited(v.as_bytes(), buf);
            }
            FieldType::Bytes => {
                let items = value.as_array().ok_or_else(|| mismatch(path, "byte array"))?;
                let bytes = items
                    .iter()
                    .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
                    .collect::<Option<Vec<u8>>>()
                    .ok_or_else(|| mismatch(path, "byte array"))?;
                put_len_delimited(&bytes, buf);
            }
            FieldType::Message(name) => {
                let nested = self.lookup(name, path)?;
                let object = value.as_object().ok_or_else(|| mismatch(path, "object"))?;
                let mut inner = BytesMut::new();
                self.write_message(path, nested, object, &mut inner)?;
                put_len_delimited(&inner, buf);
            }
        }
        Ok(())
    }

    fn read_message<B: Buf>(
        &self,
        path: &str,
        message: &MessageSchema,
        buf: &mut B,
    ) -> Result<Message, WireError> {
        let mut out = Message::new();
        while buf.has_remaining() {
            let (id, wire_type) =
                decode_key(buf).map_err(|e| WireError::Malformed(e.to_string()))?;
            let Some(field) = message.field_by_id(id) else {
                skip(wire_type, buf)?;
                continue;
            };
            let path = join(path, &field.name);
            if field.is_map() {
                let mut entry = self.expect_len(wire_type, &path, buf)?;
                let (key, value) = self.read_map_entry(field, &path, &mut entry)?;
                let slot = out
                    .entry(field.name.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(map) = slot {
                    map.insert(key, value);
                }
            } else if field.rule == FieldRule::Repeated {
                let mut items = Vec::new();
                if field.ty.is_packable() && wire_type == WireType::LengthDelimited {
                    let mut packed = read_len(buf)?;
                    while packed.has_remaining() {
                        items.push(self.read_value(
                            &field.ty,
                            wire_type_of(&field.ty),
                            &path,
                            &mut packed,
                        )?);
                    }
                } else {
                    items.push(self.read_value(&field.ty, wire_type, &path, buf)?);
                }
                let slot = out
                    .entry(field.name.clone())
                    .or_insert_with(|| Value::Array(Vec::new()));
                if let Value::Array(existing) = slot {
                    existing.extend(items);
                }
            } else {
                let value = self.read_value(&field.ty, wire_type, &path, buf)?;
                out.insert(field.name.clone(), value);
            }
        }
        for field in &message.fields {
            if !out.contains_key(&field.name) {
                out.insert(field.name.clone(), absent_value(field));
            }
        }
        Ok(out)
    }

    fn read_map_entry(
        &self,
        field: &FieldSchema,
        path: &str,
        entry: &mut Bytes,
    ) -> Result<(String, Value), WireError> {
        let mut key = String::new();
        let mut value = Value::Null;
        while entry.has_remaining() {
            let (id, wire_type) =
                decode_key(entry).map_err(|e| WireError::Malformed(e.to_string()))?;
            match id {
                1 => {
                    if let Value::String(k) =
                        self.read_value(&FieldType::String, wire_type, path, entry)?
                    {
                        key = k;
                    }
                }
                2 => value = self.read_value(&field.ty, wire_type, path, entry)?,
                _ => skip(wire_type, entry)?,
            }
        }
        Ok((key, value))
    }

    fn expect_len<B: Buf>(
        &self,
        wire_type: WireType,
        path: &str,
        buf: &mut B,
    ) -> Result<Bytes, WireError> {
        if wire_type != WireType::LengthDelimited {
            return Err(WireError::Malformed(format!(
                "{path}: expected length-delimited field, got {wire_type:?}"
            )));
        }
        read_len(buf)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn read_value<B: Buf>(
        &self,
        ty: &FieldType,
        wire_type: WireType,
        path: &str,
        buf: &mut B,
    ) -> Result<Value, WireError> {
        if wire_type != wire_type_of(ty) {
            return Err(WireError::Malformed(format!(
                "{path}: wire type {wire_type:?} does not carry {ty}"
            )));
        }
        let value = match ty {
            FieldType::Double => {
                need(buf, 8)?;
                float_value(buf.get_f64_le())
            }
            FieldType::Float => {
                need(buf, 4)?;
                float_value(f64::from(buf.get_f32_le()))
            }
            FieldType::Int32 => Value::from(read_varint(buf)? as i64 as i32),
            FieldType::Int64 => Value::from(read_varint(buf)? as i64),
            FieldType::Uint32 => Value::from(read_varint(buf)? as u32),
            FieldType::Uint64 => Value::from(read_varint(buf)?),
            FieldType::Bool => Value::Bool(read_varint(buf)? != 0),
            FieldType::String => {
                let bytes = read_len(buf)?;
                let text = String::from_utf8(bytes.to_vec())
                    .map_err(|_| WireError::Malformed(format!("{path}: invalid utf-8")))?;
                Value::String(text)
            }
            FieldType::Bytes => {
                let bytes = read_len(buf)?;
                Value::Array(bytes.iter().map(|b| Value::from(*b)).collect())
            }
            FieldType::Message(name) => {
                let nested = self.lookup(name, path)?;
                let mut inner = read_len(buf)?;
                Value::Object(self.read_message(path, nested, &mut inner)?)
            }
        };
        Ok(value)
    }
}

fn absent_value(field: &FieldSchema) -> Value {
    if let Some(default) = &field.default {
        return default.clone();
    }
    if field.is_map() {
        Value::Object(Map::new())
    } else if field.rule == FieldRule::Repeated {
        Value::Array(Vec::new())
    } else {
        Value::Null
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldSchema;
    use serde_json::json;

    fn schema(request: MessageSchema) -> MethodSchema {
        MethodSchema::new(request, MessageSchema::result(FieldType::String))
    }

    fn roundtrip(schema: &MethodSchema, value: &Value) -> Result<Value, WireError> {
        let object = value.as_object().cloned().unwrap_or_default();
        let mut bytes = encode(schema, Part::Request, &object)?;
        Ok(Value::Object(decode(schema, Part::Request, &mut bytes)?))
    }

    #[test]
    fn test_scalars_match_protobuf_bytes() -> Result<(), WireError> {
        let s = schema(
            MessageSchema::new()
                .field("a", FieldType::Int32)
                .field("b", FieldType::String),
        );
        let bytes = encode(&s, Part::Request, json!({"a": 150, "b": "hi"}).as_object().unwrap())?;
        assert_eq!(bytes.as_ref(), &[0x08, 0x96, 0x01, 0x12, 0x02, b'h', b'i']);
        Ok(())
    }

    #[test]
    fn test_negative_and_wide_integers() -> Result<(), WireError> {
        let s = schema(
            MessageSchema::new()
                .field("i", FieldType::Int32)
                .field("l", FieldType::Int64)
                .field("u", FieldType::Uint64),
        );
        let value = json!({"i": -5, "l": -9_000_000_000i64, "u": u64::MAX});
        assert_eq!(roundtrip(&s, &value)?, value);
        Ok(())
    }

    #[test]
    fn test_repeated_numbers_are_packed() -> Result<(), WireError> {
        let s = schema(MessageSchema::new().with(FieldSchema::new("xs", 1, FieldType::Int32).repeated()));
        let bytes = encode(&s, Part::Request, json!({"xs": [1, 2, 3]}).as_object().unwrap())?;
        assert_eq!(bytes.as_ref(), &[0x0a, 0x03, 1, 2, 3]);

        // unpacked input is accepted as well
        let mut unpacked = Bytes::from_static(&[0x08, 1, 0x08, 2]);
        let decoded = decode(&s, Part::Request, &mut unpacked)?;
        assert_eq!(decoded["xs"], json!([1, 2]));
        Ok(())
    }

    #[test]
    fn test_nested_repeated_and_maps() -> Result<(), WireError> {
        let s = schema(
            MessageSchema::new()
                .with(FieldSchema::new("points", 1, FieldType::Message("Point".into())).repeated())
                .with(FieldSchema::new("tags", 2, FieldType::String).map())
                .with(FieldSchema::new("blob", 3, FieldType::Bytes).optional()),
        )
        .with_type(
            "Point",
            MessageSchema::new()
                .field("x", FieldType::Double)
                .field("y", FieldType::Double),
        );
        let value = json!({
            "points": [{"x": 1.5, "y": -2.0}, {"x": 0.25, "y": 8.0}],
            "tags": {"a": "1", "b": "2"},
            "blob": [0, 127, 255],
        });
        assert_eq!(roundtrip(&s, &value)?, value);
        Ok(())
    }

    #[test]
    fn test_absent_fields_take_defaults() -> Result<(), WireError> {
        let s = schema(
            MessageSchema::new()
                .with(FieldSchema::new("name", 1, FieldType::String).with_default(json!("anon")))
                .with(FieldSchema::new("xs", 2, FieldType::Int32).repeated())
                .with(FieldSchema::new("m", 3, FieldType::Int32).map())
                .with(FieldSchema::new("o", 4, FieldType::Bool).optional()),
        );
        let decoded = roundtrip(&s, &json!({}))?;
        assert_eq!(decoded, json!({"name": "anon", "xs": [], "m": {}, "o": null}));
        Ok(())
    }

    #[test]
    fn test_unknown_fields_are_skipped() -> Result<(), WireError> {
        let s = schema(MessageSchema::new().field("a", FieldType::Int32));
        // field 9 (varint), field 10 (fixed64), field 11 (bytes), then a = 7
        let mut bytes = Bytes::from_static(&[
            0x48, 0x05, 0x51, 0, 0, 0, 0, 0, 0, 0, 0, 0x5a, 0x01, 0xff, 0x08, 0x07,
        ]);
        assert_eq!(decode(&s, Part::Request, &mut bytes)?["a"], json!(7));
        Ok(())
    }

    #[test]
    fn test_type_mismatch_names_the_field() {
        let s = schema(MessageSchema::new().with(FieldSchema::new("arg", 1, FieldType::String).repeated()));
        let err = encode(&s, Part::Request, json!({"arg": "nope"}).as_object().unwrap()).unwrap_err();
        assert_eq!(err.to_string(), "arg: array expected");
    }

    #[test]
    fn test_wrong_wire_type_is_malformed() {
        let s = schema(MessageSchema::new().field("a", FieldType::Int32));
        // field 1 sent length-delimited instead of as a varint
        let mut bytes = Bytes::from_static(&[0x0a, 0x01, 0x00]);
        let err = decode(&s, Part::Request, &mut bytes).unwrap_err();
        assert!(matches!(err, WireError::Malformed(ref m) if m.starts_with("a: wire type")), "{err}");
    }

    #[test]
    fn test_whole_floats_encode_as_integers() -> Result<(), WireError> {
        let s = schema(MessageSchema::new().field("n", FieldType::Int64));
        assert_eq!(roundtrip(&s, &json!({"n": 3.0}))?, json!({"n": 3}));
        let err = encode(&s, Part::Request, json!({"n": 3.5}).as_object().unwrap()).unwrap_err();
        assert_eq!(err.to_string(), "n: integer expected");
        Ok(())
    }

    #[test]
    fn test_truncated_input_is_malformed() {
        let s = schema(MessageSchema::new().field("b", FieldType::String));
        let mut bytes = Bytes::from_static(&[0x0a, 0x05, b'h']);
        assert!(matches!(
            decode(&s, Part::Request, &mut bytes),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn test_positional_args_follow_field_ids() {
        let message = MessageSchema::new()
            .with(FieldSchema::new("second", 2, FieldType::Int32))
            .with(FieldSchema::new("first", 1, FieldType::Int32));
        let packed = args_to_message(&message, vec![json!(1), json!(2), json!(3)]);
        assert_eq!(Value::Object(packed.clone()), json!({"first": 1, "second": 2}));
        assert_eq!(message_to_args(&message, packed), vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_single_field_wrapping() {
        let result = MessageSchema::result(FieldType::String);
        let wrapped = wrap_single(&result, json!("ok"));
        assert_eq!(unwrap_single(&result, wrapped), json!("ok"));
        assert!(wrap_single(&MessageSchema::new(), json!("ignored")).is_empty());
        assert_eq!(unwrap_single(&MessageSchema::new(), Message::new()), Value::Null);
    }
}
