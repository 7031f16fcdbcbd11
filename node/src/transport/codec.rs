//! Tonic codec whose messages are described by a runtime schema.

use crate::schema::wire::{self, Message, Part};
use crate::schema::MethodSchema;
use bytes::{BufMut, Bytes};
use std::sync::Arc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::Status;

/// Codec for one method.
///
/// Outbound messages are encoded ahead of time with [`wire::encode`], so
/// schema errors surface before a frame is written. Inbound messages are
/// decoded as the request (server side) or the response (client side).
#[derive(Debug, Clone)]
pub struct SchemaCodec {
    schema: Arc<MethodSchema>,
    decode: Part,
}

impl SchemaCodec {
    /// Codec for serving a method: decodes requests.
    #[must_use]
    pub fn server(schema: Arc<MethodSchema>) -> Self {
        Self {
            schema,
            decode: Part::Request,
        }
    }

    /// Codec for calling a method: decodes responses.
    #[must_use]
    pub fn client(schema: Arc<MethodSchema>) -> Self {
        Self {
            schema,
            decode: Part::Response,
        }
    }
}

impl Codec for SchemaCodec {
    type Encode = Bytes;
    type Decode = Message;
    type Encoder = PreEncoded;
    type Decoder = SchemaDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        PreEncoded
    }

    fn decoder(&mut self) -> Self::Decoder {
        SchemaDecoder {
            schema: self.schema.clone(),
            part: self.decode,
        }
    }
}

/// Writes already encoded message bytes.
#[derive(Debug, Clone, Copy)]
pub struct PreEncoded;

impl Encoder for PreEncoded {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.put(item);
        Ok(())
    }
}

/// Decodes frames with a method schema.
#[derive(Debug, Clone)]
pub struct SchemaDecoder {
    schema: Arc<MethodSchema>,
    part: Part,
}

impl Decoder for SchemaDecoder {
    type Item = Message;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        wire::decode(&self.schema, self.part, src)
            .map(Some)
            .map_err(|e| Status::invalid_argument(e.to_string()))
    }
}

/// Encodes a single value as the first field of a message part.
///
/// # Errors
///
/// Returns [`Status::internal`] if the value does not fit the schema.
pub fn encode_single(schema: &MethodSchema, part: Part, value: serde_json::Value) -> Result<Bytes, Status> {
    let message = wire::wrap_single(schema.part(part), value);
    wire::encode(schema, part, &message).map_err(|e| Status::internal(e.to_string()))
}
