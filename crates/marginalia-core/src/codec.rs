//! Payload codec
//!
//! Serialized form is a versioned JSON envelope:
//!
//! ```text
//! { "version": 1, "payload": { "drawings": [...], "texts": [...], "timestamp": "..." } }
//! ```
//!
//! Compatibility rule: unknown fields are ignored, missing required fields
//! are an error. A bare payload object without an envelope is read as
//! version 0. The local store keeps the serialized form zstd-compressed.

use std::io::{self, Cursor};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::AnnotationPayload;

/// Version written by this build
pub const FORMAT_VERSION: u32 = 1;

/// zstd level used for stored blobs
const COMPRESSION_LEVEL: i32 = 3;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Failed to serialize annotations: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Failed to parse annotations: {0}")]
    Deserialize(#[source] serde_json::Error),

    #[error("Failed to compress annotations: {0}")]
    Compress(#[source] io::Error),

    #[error("Failed to decompress annotations: {0}")]
    Decompress(#[source] io::Error),
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u32,
    payload: &'a AnnotationPayload,
}

#[derive(Deserialize)]
struct Envelope {
    payload: AnnotationPayload,
}

/// Serialize a payload into its versioned JSON envelope
pub fn serialize(payload: &AnnotationPayload) -> Result<String, CodecError> {
    serde_json::to_string(&EnvelopeRef {
        version: FORMAT_VERSION,
        payload,
    })
    .map_err(CodecError::Serialize)
}

/// Parse a versioned envelope (or a legacy bare payload)
pub fn deserialize(text: &str) -> Result<AnnotationPayload, CodecError> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(CodecError::Deserialize)?;
    if value.get("version").is_some() {
        let envelope: Envelope =
            serde_json::from_value(value).map_err(CodecError::Deserialize)?;
        Ok(envelope.payload)
    } else {
        serde_json::from_value(value).map_err(CodecError::Deserialize)
    }
}

pub fn compress(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    zstd::stream::encode_all(Cursor::new(bytes), COMPRESSION_LEVEL).map_err(CodecError::Compress)
}

pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    zstd::stream::decode_all(Cursor::new(bytes)).map_err(CodecError::Decompress)
}

/// Serialize and compress, producing the stored blob
pub fn encode_blob(payload: &AnnotationPayload) -> Result<Vec<u8>, CodecError> {
    compress(serialize(payload)?.as_bytes())
}

/// Decompress and parse a stored blob
pub fn decode_blob(blob: &[u8]) -> Result<AnnotationPayload, CodecError> {
    let bytes = decompress(blob)?;
    let text = String::from_utf8(bytes).map_err(|e| {
        CodecError::Decompress(io::Error::new(io::ErrorKind::InvalidData, e))
    })?;
    deserialize(&text)
}
