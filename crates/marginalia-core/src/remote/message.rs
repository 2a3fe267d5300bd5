//! Sync protocol message types
//!
//! Messages exchanged with the annotation sync server using CBOR encoding.
//! Each request opens its own connection; subscriptions keep theirs open and
//! receive `update` messages until closed.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::{RemoteError, RemoteRecord};
use crate::models::DocumentKey;

/// Protocol version
pub const PROTOCOL_V1: &str = "1";

/// Messages sent to the sync server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Open a session for this device
    #[serde(rename = "authenticate")]
    Authenticate {
        #[serde(rename = "deviceId")]
        device_id: String,
        #[serde(rename = "protocolVersion")]
        protocol_version: String,
    },

    /// Write a record
    #[serde(rename = "push")]
    Push {
        #[serde(rename = "principalId")]
        principal_id: String,
        token: String,
        #[serde(rename = "documentKey")]
        document_key: String,
        /// Serialized payload envelope
        #[serde(with = "serde_bytes")]
        annotations: Vec<u8>,
        /// Milliseconds since the Unix epoch
        #[serde(rename = "lastUpdated")]
        last_updated: i64,
    },

    /// Listen for changes to a record
    #[serde(rename = "subscribe")]
    Subscribe {
        #[serde(rename = "principalId")]
        principal_id: String,
        token: String,
        #[serde(rename = "documentKey")]
        document_key: String,
    },
}

/// Messages received from the sync server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Session established
    #[serde(rename = "authenticated")]
    Authenticated {
        #[serde(rename = "principalId")]
        principal_id: String,
        token: String,
    },

    /// Push acknowledged
    #[serde(rename = "ack")]
    Ack {
        #[serde(rename = "documentKey")]
        document_key: String,
        #[serde(rename = "lastUpdated")]
        last_updated: i64,
        applied: bool,
    },

    /// Current or changed value of a subscribed record
    #[serde(rename = "update")]
    Update {
        #[serde(rename = "documentKey")]
        document_key: String,
        #[serde(with = "serde_bytes")]
        annotations: Vec<u8>,
        #[serde(rename = "lastUpdated")]
        last_updated: i64,
    },

    /// Request refused
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl ClientMessage {
    /// Create an authenticate message
    pub fn authenticate(device_id: &str) -> Self {
        ClientMessage::Authenticate {
            device_id: device_id.to_string(),
            protocol_version: PROTOCOL_V1.to_string(),
        }
    }

    /// Create a push message
    pub fn push(principal_id: &str, token: &str, key: &DocumentKey, record: &RemoteRecord) -> Self {
        ClientMessage::Push {
            principal_id: principal_id.to_string(),
            token: token.to_string(),
            document_key: key.as_str().to_string(),
            annotations: record.annotations.clone().into_bytes(),
            last_updated: record.last_updated.timestamp_millis(),
        }
    }

    /// Create a subscribe message
    pub fn subscribe(principal_id: &str, token: &str, key: &DocumentKey) -> Self {
        ClientMessage::Subscribe {
            principal_id: principal_id.to_string(),
            token: token.to_string(),
            document_key: key.as_str().to_string(),
        }
    }

    /// Encode message to CBOR bytes
    pub fn encode(&self) -> Result<Vec<u8>, RemoteError> {
        encode(self)
    }

    /// Decode message from CBOR bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, RemoteError> {
        decode(bytes)
    }
}

impl ServerMessage {
    /// Encode message to CBOR bytes
    pub fn encode(&self) -> Result<Vec<u8>, RemoteError> {
        encode(self)
    }

    /// Decode message from CBOR bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, RemoteError> {
        decode(bytes)
    }

    /// Map a server error code onto the remote error taxonomy
    pub fn error_for(code: &str, message: &str) -> RemoteError {
        match code {
            "unauthorized" | "forbidden" | "token_expired" => RemoteError::Auth(message.to_string()),
            "unavailable" => RemoteError::Network(message.to_string()),
            _ => RemoteError::Rejected(format!("{}: {}", code, message)),
        }
    }
}

/// Build a record from the wire representation
pub(crate) fn record_from_wire(
    annotations: Vec<u8>,
    last_updated: i64,
) -> Result<RemoteRecord, RemoteError> {
    let annotations = String::from_utf8(annotations)
        .map_err(|_| RemoteError::Rejected("annotations are not valid UTF-8".to_string()))?;
    Ok(RemoteRecord {
        annotations,
        last_updated: millis_to_datetime(last_updated)?,
    })
}

pub(crate) fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>, RemoteError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| RemoteError::Rejected(format!("invalid timestamp {}", millis)))
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, RemoteError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(msg, &mut bytes)
        .map_err(|e| RemoteError::Rejected(format!("CBOR encoding failed: {}", e)))?;
    Ok(bytes)
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, RemoteError> {
    ciborium::from_reader(bytes)
        .map_err(|e| RemoteError::Rejected(format!("CBOR decoding failed: {}", e)))
}
