//! WebSocket wire protocol: message types and varint encoding/decoding.
//!
//! Binary frames begin with a varuint message type tag:
//!
//! ```text
//!   Type        Code   Payload
//!   SYNC         0     Yjs sync-protocol message (step1 | step2 | update)
//!   AWARENESS    1     varuint-length-prefixed awareness update
//!   QUERY_AWAR.  3     (empty)
//!   SYNC_STATUS 102    varuint-length-prefixed inner payload: varuint clientLocalVersion
//! ```

use std::io;

/// Top-level message type (first byte of binary message).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Sync = 0,
    Awareness = 1,
    QueryAwareness = 3,
    SyncStatus = 102,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Sync),
            1 => Ok(MessageType::Awareness),
            3 => Ok(MessageType::QueryAwareness),
            102 => Ok(MessageType::SyncStatus),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Sync message subtypes (second byte when `MessageType::Sync`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncMessageType {
    SyncStep1 = 0,
    SyncStep2 = 1,
    Update = 2,
}

impl TryFrom<u8> for SyncMessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SyncMessageType::SyncStep1),
            1 => Ok(SyncMessageType::SyncStep2),
            2 => Ok(SyncMessageType::Update),
            _ => Err(ProtocolError::UnknownSyncType(value)),
        }
    }
}

/// Decoded WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    SyncStep1 { state_vector: Vec<u8> },
    SyncStep2 { update: Vec<u8> },
    Update { update: Vec<u8> },
    Awareness { data: Vec<u8> },
    QueryAwareness,
    SyncStatus { local_version: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),
    #[error("unknown sync message type: {0}")]
    UnknownSyncType(u8),
    #[error("unexpected end of message")]
    UnexpectedEof,
    #[error("invalid UTF-8 in string")]
    InvalidUtf8,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Encode a variable-length unsigned integer (y-protocols format).
pub fn encode_var_uint(value: u64, out: &mut Vec<u8>) {
    let mut v = value;
    loop {
        let mut byte = (v & 0x7F) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if v == 0 {
            break;
        }
    }
}

/// Decode a variable-length unsigned integer.
pub fn decode_var_uint(data: &mut &[u8]) -> Result<u64, ProtocolError> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        if data.is_empty() {
            return Err(ProtocolError::UnexpectedEof);
        }
        let byte = data[0];
        *data = &data[1..];
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 63 {
            break;
        }
    }
    Ok(result)
}

/// Encode a variable-length byte array (length-prefixed).
pub fn encode_var_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    encode_var_uint(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

/// Decode a variable-length byte array.
pub fn decode_var_bytes(data: &mut &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let len = decode_var_uint(data)? as usize;
    if data.len() < len {
        return Err(ProtocolError::UnexpectedEof);
    }
    let bytes = data[..len].to_vec();
    *data = &data[len..];
    Ok(bytes)
}

/// Encode a SyncStep1 message.
pub fn encode_sync_step1(state_vector: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + state_vector.len() + 5);
    out.push(MessageType::Sync as u8);
    out.push(SyncMessageType::SyncStep1 as u8);
    encode_var_bytes(state_vector, &mut out);
    out
}

/// Encode a SyncStep2 message.
pub fn encode_sync_step2(update: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + update.len() + 5);
    out.push(MessageType::Sync as u8);
    out.push(SyncMessageType::SyncStep2 as u8);
    encode_var_bytes(update, &mut out);
    out
}

/// Encode an Update message.
pub fn encode_update(update: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + update.len() + 5);
    out.push(MessageType::Sync as u8);
    out.push(SyncMessageType::Update as u8);
    encode_var_bytes(update, &mut out);
    out
}

/// Encode an awareness update frame, forwarding the inner payload verbatim.
pub fn encode_awareness(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + data.len());
    out.push(MessageType::Awareness as u8);
    out.extend_from_slice(data);
    out
}

/// Encode a QueryAwareness request (no payload).
pub fn encode_query_awareness() -> Vec<u8> {
    vec![MessageType::QueryAwareness as u8]
}

/// Encode a SyncStatus heartbeat/ack frame carrying a local version counter.
pub fn encode_sync_status(local_version: u64) -> Vec<u8> {
    let mut inner = Vec::new();
    encode_var_uint(local_version, &mut inner);
    let mut out = Vec::with_capacity(1 + inner.len() + 5);
    out.push(MessageType::SyncStatus as u8);
    encode_var_bytes(&inner, &mut out);
    out
}

/// Decode a binary WebSocket message.
pub fn decode_message(data: &[u8]) -> Result<WsMessage, ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError::UnexpectedEof);
    }

    let msg_type = MessageType::try_from(data[0])?;
    let mut rest = &data[1..];

    match msg_type {
        MessageType::Sync => {
            if rest.is_empty() {
                return Err(ProtocolError::UnexpectedEof);
            }
            let sync_type = SyncMessageType::try_from(rest[0])?;
            rest = &rest[1..];
            let payload = decode_var_bytes(&mut rest)?;

            match sync_type {
                SyncMessageType::SyncStep1 => Ok(WsMessage::SyncStep1 {
                    state_vector: payload,
                }),
                SyncMessageType::SyncStep2 => Ok(WsMessage::SyncStep2 { update: payload }),
                SyncMessageType::Update => Ok(WsMessage::Update { update: payload }),
            }
        }
        MessageType::Awareness => Ok(WsMessage::Awareness {
            data: rest.to_vec(),
        }),
        MessageType::QueryAwareness => Ok(WsMessage::QueryAwareness),
        MessageType::SyncStatus => {
            let inner = decode_var_bytes(&mut rest)?;
            let mut inner_slice = inner.as_slice();
            let local_version = decode_var_uint(&mut inner_slice)?;
            Ok(WsMessage::SyncStatus { local_version })
        }
    }
}

/// WebSocket subprotocol name. Only one protocol is spoken by this
/// implementation (unlike the teacher's dual y-websocket/commonplace split);
/// it is kept as a named constant so servers and clients agree on it.
pub const SUBPROTOCOL: &str = "epicenter-sync";
