//! Binary protocol for versioned operation synchronization.
//!
//! Wire format (bincode-encoded envelope):
//! ```text
//! ┌──────────┬────────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ session_id │ doc_id   │ version  │ payload  │
//! │ 1 byte   │ 16 bytes   │ variable │ 8 bytes  │ variable │
//! └──────────┴────────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Operation and content payloads are JSON-encoded inside the envelope:
//! document content is an arbitrary JSON tree, and bincode cannot round-trip
//! untagged JSON values.
//!
//! The `version` slot carries the message's version claim: the base version
//! on `Submit`, the resulting version on `Loaded`/`Ack`, and the version the
//! document had *before* the operation on `RemoteOp` (so receivers can check
//! they are applying against the right state).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ot::Operation;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client requests membership in a document room
    Join = 1,
    /// Server reply to Join: full content + current version
    Loaded = 2,
    /// Client submits an operation against a base version
    Submit = 3,
    /// Server ack to the originator: transformed operation + new version
    Ack = 4,
    /// Server reply to the originator: operation refused, document unchanged
    Rejected = 5,
    /// Server broadcast to other room members: applied operation
    RemoteOp = 6,
    /// Server instruction: local state is unrecoverable, re-issue Join
    ResyncRequired = 7,
    /// Heartbeat ping
    Ping = 8,
    /// Heartbeat pong
    Pong = 9,
}

/// Top-level protocol message.
///
/// Serialized with bincode for minimal overhead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub msg_type: MessageType,
    pub session_id: Uuid,
    pub doc_id: String,
    pub version: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

/// Payload of `Loaded`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadedPayload {
    pub content: Value,
}

/// Payload of `Submit`, `Ack`, and `RemoteOp`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationPayload {
    pub operation: Operation,
}

/// Payload of `Rejected`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedPayload {
    pub reason: String,
}

impl WireMessage {
    /// Create a join request.
    pub fn join(session_id: Uuid, doc_id: impl Into<String>) -> Self {
        Self {
            msg_type: MessageType::Join,
            session_id,
            doc_id: doc_id.into(),
            version: 0,
            payload: Vec::new(),
        }
    }

    /// Create a loaded reply carrying the full document state.
    pub fn loaded(
        doc_id: impl Into<String>,
        content: &Value,
        version: u64,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Loaded,
            session_id: Uuid::nil(),
            doc_id: doc_id.into(),
            version,
            payload: encode_json(&LoadedPayload {
                content: content.clone(),
            })?,
        })
    }

    /// Create an operation submission against `base_version`.
    pub fn submit(
        session_id: Uuid,
        doc_id: impl Into<String>,
        operation: &Operation,
        base_version: u64,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Submit,
            session_id,
            doc_id: doc_id.into(),
            version: base_version,
            payload: encode_json(&OperationPayload {
                operation: operation.clone(),
            })?,
        })
    }

    /// Create an acknowledgment carrying the transformed operation.
    pub fn ack(
        session_id: Uuid,
        doc_id: impl Into<String>,
        operation: &Operation,
        new_version: u64,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Ack,
            session_id,
            doc_id: doc_id.into(),
            version: new_version,
            payload: encode_json(&OperationPayload {
                operation: operation.clone(),
            })?,
        })
    }

    /// Create a rejection reply.
    pub fn rejected(
        session_id: Uuid,
        doc_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Rejected,
            session_id,
            doc_id: doc_id.into(),
            version: 0,
            payload: encode_json(&RejectedPayload {
                reason: reason.into(),
            })?,
        })
    }

    /// Create a remote-operation broadcast. `version_before` is the document
    /// version the operation was applied at.
    pub fn remote_op(
        session_id: Uuid,
        doc_id: impl Into<String>,
        operation: &Operation,
        version_before: u64,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::RemoteOp,
            session_id,
            doc_id: doc_id.into(),
            version: version_before,
            payload: encode_json(&OperationPayload {
                operation: operation.clone(),
            })?,
        })
    }

    /// Create a resync instruction.
    pub fn resync_required(doc_id: impl Into<String>) -> Self {
        Self {
            msg_type: MessageType::ResyncRequired,
            session_id: Uuid::nil(),
            doc_id: doc_id.into(),
            version: 0,
            payload: Vec::new(),
        }
    }

    /// Create a ping message.
    pub fn ping(session_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Ping,
            session_id,
            doc_id: String::new(),
            version: 0,
            payload: Vec::new(),
        }
    }

    /// Create a pong message.
    pub fn pong(session_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Pong,
            session_id,
            doc_id: String::new(),
            version: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the content of a `Loaded` payload.
    pub fn content(&self) -> Result<Value, ProtocolError> {
        if self.msg_type != MessageType::Loaded {
            return Err(ProtocolError::InvalidMessageType);
        }
        let payload: LoadedPayload = decode_json(&self.payload)?;
        Ok(payload.content)
    }

    /// Parse the operation of a `Submit`, `Ack`, or `RemoteOp` payload.
    pub fn operation(&self) -> Result<Operation, ProtocolError> {
        match self.msg_type {
            MessageType::Submit | MessageType::Ack | MessageType::RemoteOp => {}
            _ => return Err(ProtocolError::InvalidMessageType),
        }
        let payload: OperationPayload = decode_json(&self.payload)?;
        Ok(payload.operation)
    }

    /// Parse the reason of a `Rejected` payload.
    pub fn reason(&self) -> Result<String, ProtocolError> {
        if self.msg_type != MessageType::Rejected {
            return Err(ProtocolError::InvalidMessageType);
        }
        let payload: RejectedPayload = decode_json(&self.payload)?;
        Ok(payload.reason)
    }
}

fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(value).map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_json<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(bytes).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
