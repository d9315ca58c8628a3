// src/core/protocol/hub_message.rs

//! Implements the JSON hub protocol spoken by the surveillance hub and the
//! corresponding `Encoder` and `Decoder` for network communication.
//!
//! Every message is a JSON object terminated by the ASCII record separator
//! (`0x1E`). A single transport frame may carry several records and a record
//! may be split across frames, so decoding works on an accumulating buffer.

use crate::core::SightwireError;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

/// Terminates every record on the wire.
pub const RECORD_SEPARATOR: u8 = 0x1e;

/// Upper bound for a single record. A peer that streams more than this
/// without a separator is treated as broken.
const MAX_RECORD_SIZE: usize = 4 * 1024 * 1024;

const PROTOCOL_NAME: &str = "json";
const PROTOCOL_VERSION: u32 = 1;

// Numeric message kinds used by the protocol.
const KIND_INVOCATION: u8 = 1;
const KIND_STREAM_ITEM: u8 = 2;
const KIND_COMPLETION: u8 = 3;
const KIND_STREAM_INVOCATION: u8 = 4;
const KIND_CANCEL_INVOCATION: u8 = 5;
const KIND_PING: u8 = 6;
const KIND_CLOSE: u8 = 7;

/// A single hub protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// A named method call. Inbound invocations are the server's push events.
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    StreamItem {
        invocation_id: String,
        item: Value,
    },
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    StreamInvocation {
        invocation_id: String,
        target: String,
        arguments: Vec<Value>,
    },
    CancelInvocation {
        invocation_id: String,
    },
    Ping,
    /// The server is closing the connection. `allow_reconnect` tells the
    /// client whether it may come back.
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// A message kind this client does not understand. Kept so newer servers
    /// do not break older clients.
    Other(u8),
}

impl HubMessage {
    /// Builds a non-blocking invocation (no invocation id, no completion expected).
    pub fn invocation(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        HubMessage::Invocation {
            invocation_id: None,
            target: target.into(),
            arguments,
        }
    }

    /// Parses one record (without its separator).
    pub fn from_json(record: &[u8]) -> Result<Self, SightwireError> {
        let raw: RawHubMessage = serde_json::from_slice(record)
            .map_err(|e| SightwireError::MalformedMessage(e.to_string()))?;
        HubMessage::try_from(raw)
    }

    /// Serializes the message into one record, separator included.
    pub fn encode_to_vec(&self) -> Result<Vec<u8>, SightwireError> {
        let mut buf = BytesMut::new();
        HubProtocolCodec.encode(self.clone(), &mut buf)?;
        Ok(buf.to_vec())
    }
}

/// Collapses invocation arguments into the payload handed to subscribers:
/// `null` for no argument, the argument itself when there is exactly one, the
/// whole array otherwise.
pub fn invocation_payload(mut arguments: Vec<Value>) -> Value {
    match arguments.len() {
        0 => Value::Null,
        1 => arguments.remove(0),
        _ => Value::Array(arguments),
    }
}

/// The wire shape shared by every message kind. Fields absent for a kind
/// are skipped when serializing.
#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct RawHubMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    item: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_reconnect: Option<bool>,
}

fn required<T>(value: Option<T>, field: &str, kind: u8) -> Result<T, SightwireError> {
    value.ok_or_else(|| {
        SightwireError::MalformedMessage(format!("message of type {kind} is missing '{field}'"))
    })
}

impl TryFrom<RawHubMessage> for HubMessage {
    type Error = SightwireError;

    fn try_from(raw: RawHubMessage) -> Result<Self, Self::Error> {
        let kind = raw.kind;
        let message = match kind {
            KIND_INVOCATION => HubMessage::Invocation {
                invocation_id: raw.invocation_id,
                target: required(raw.target, "target", kind)?,
                arguments: raw.arguments.unwrap_or_default(),
            },
            KIND_STREAM_ITEM => HubMessage::StreamItem {
                invocation_id: required(raw.invocation_id, "invocationId", kind)?,
                item: raw.item.unwrap_or(Value::Null),
            },
            KIND_COMPLETION => HubMessage::Completion {
                invocation_id: required(raw.invocation_id, "invocationId", kind)?,
                result: raw.result,
                error: raw.error,
            },
            KIND_STREAM_INVOCATION => HubMessage::StreamInvocation {
                invocation_id: required(raw.invocation_id, "invocationId", kind)?,
                target: required(raw.target, "target", kind)?,
                arguments: raw.arguments.unwrap_or_default(),
            },
            KIND_CANCEL_INVOCATION => HubMessage::CancelInvocation {
                invocation_id: required(raw.invocation_id, "invocationId", kind)?,
            },
            KIND_PING => HubMessage::Ping,
            KIND_CLOSE => HubMessage::Close {
                error: raw.error,
                allow_reconnect: raw.allow_reconnect.unwrap_or(false),
            },
            other => HubMessage::Other(other),
        };
        Ok(message)
    }
}

impl From<HubMessage> for RawHubMessage {
    fn from(message: HubMessage) -> Self {
        match message {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => RawHubMessage {
                kind: KIND_INVOCATION,
                invocation_id,
                target: Some(target),
                arguments: Some(arguments),
                ..Default::default()
            },
            HubMessage::StreamItem {
                invocation_id,
                item,
            } => RawHubMessage {
                kind: KIND_STREAM_ITEM,
                invocation_id: Some(invocation_id),
                item: Some(item),
                ..Default::default()
            },
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => RawHubMessage {
                kind: KIND_COMPLETION,
                invocation_id: Some(invocation_id),
                result,
                error,
                ..Default::default()
            },
            HubMessage::StreamInvocation {
                invocation_id,
                target,
                arguments,
            } => RawHubMessage {
                kind: KIND_STREAM_INVOCATION,
                invocation_id: Some(invocation_id),
                target: Some(target),
                arguments: Some(arguments),
                ..Default::default()
            },
            HubMessage::CancelInvocation { invocation_id } => RawHubMessage {
                kind: KIND_CANCEL_INVOCATION,
                invocation_id: Some(invocation_id),
                ..Default::default()
            },
            HubMessage::Ping => RawHubMessage {
                kind: KIND_PING,
                ..Default::default()
            },
            HubMessage::Close {
                error,
                allow_reconnect,
            } => RawHubMessage {
                kind: KIND_CLOSE,
                error,
                allow_reconnect: allow_reconnect.then_some(true),
                ..Default::default()
            },
            HubMessage::Other(kind) => RawHubMessage {
                kind,
                ..Default::default()
            },
        }
    }
}

/// The first record a client sends after the transport is open.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: u32,
}

impl Default for HandshakeRequest {
    fn default() -> Self {
        Self {
            protocol: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_VERSION,
        }
    }
}

impl HandshakeRequest {
    /// Serializes the request into one record, separator included.
    pub fn encode_to_vec(&self) -> Result<Vec<u8>, SightwireError> {
        let mut buf = serde_json::to_vec(self)?;
        buf.push(RECORD_SEPARATOR);
        Ok(buf)
    }
}

/// The server's answer to the handshake: `{}` on success.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct HandshakeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandshakeResponse {
    /// Takes the handshake response off the front of `src`, leaving any records
    /// that arrived in the same frame in place. Returns `Ok(None)` until a whole
    /// record is buffered.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, SightwireError> {
        match take_record(src)? {
            Some(record) => {
                let response: HandshakeResponse = serde_json::from_slice(&record)
                    .map_err(|e| SightwireError::Handshake(format!("malformed response: {e}")))?;
                Ok(Some(response))
            }
            None => Ok(None),
        }
    }
}

/// Splits the next non-empty record (separator stripped) off the buffer.
/// Returns `Ok(None)` while the record is still incomplete.
fn take_record(src: &mut BytesMut) -> Result<Option<BytesMut>, SightwireError> {
    loop {
        let Some(pos) = src.iter().position(|b| *b == RECORD_SEPARATOR) else {
            if src.len() > MAX_RECORD_SIZE {
                return Err(SightwireError::Protocol(format!(
                    "record exceeds {MAX_RECORD_SIZE} bytes without a separator"
                )));
            }
            return Ok(None);
        };
        let mut record = src.split_to(pos + 1);
        record.truncate(pos);
        if record.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        return Ok(Some(record));
    }
}

/// A `tokio_util::codec` implementation for encoding and decoding `HubMessage`s.
#[derive(Debug, Default, Clone, Copy)]
pub struct HubProtocolCodec;

impl Encoder<HubMessage> for HubProtocolCodec {
    type Error = SightwireError;

    fn encode(&mut self, item: HubMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let raw = RawHubMessage::from(item);
        let json = serde_json::to_vec(&raw)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(RECORD_SEPARATOR);
        Ok(())
    }
}

impl Decoder for HubProtocolCodec {
    type Item = HubMessage;
    type Error = SightwireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        // A partial record stays buffered until the rest arrives.
        match take_record(src)? {
            Some(record) => HubMessage::from_json(&record).map(Some),
            None => Ok(None),
        }
    }
}
