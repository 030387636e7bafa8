//! Binary wire protocol between `SyncClient` and `SyncServer`.
//!
//! Messages are bincode-encoded (standard config, serde) and carried in
//! binary WebSocket frames:
//! ```text
//!  client                                  server
//!    │── Join { doc_id, client_id } ─────────►│
//!    │◄──────────────── Snapshot { content, rev }
//!    │── Submit { op, base_revision } ───────►│
//!    │◄──────────────────── Ack { revision }  │  (to the sender)
//!    │◄── Operation { op, revision, client }  │  (to everyone else)
//!    │◄── OperationError { message, resync }  │
//!    │── Resync ─────────────────────────────►│
//!    │◄──────────────── Snapshot { content, rev }
//! ```

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use quill_ot::{ClientId, DocumentId, Edit, Revision, Snapshot, Submission};

/// Client → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum ClientMessage<E: Edit> {
    /// Attach to a document; answered with `Snapshot`.
    Join {
        doc_id: DocumentId,
        client_id: ClientId,
    },
    Submit {
        doc_id: DocumentId,
        submission: Submission<E>,
    },
    /// Request a fresh snapshot; answered with `Snapshot`.
    Resync { doc_id: DocumentId },
    Leave { doc_id: DocumentId },
    Ping,
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum ServerMessage<E: Edit> {
    Snapshot {
        doc_id: DocumentId,
        snapshot: Snapshot<E::Document>,
    },
    /// The sender's in-flight submission landed at `revision`.
    Ack { doc_id: DocumentId, revision: Revision },
    /// Another session's operation, applied at `revision`.
    Operation {
        doc_id: DocumentId,
        op: E,
        revision: Revision,
        client_id: ClientId,
    },
    /// A submission was rejected. `resync` is set when the sender's
    /// replica can no longer be reconciled.
    OperationError {
        doc_id: DocumentId,
        message: String,
        resync: bool,
    },
    /// Request-level failure (unknown document, full document, bad frame).
    Error { message: String },
    Pong,
    PeerJoined { doc_id: DocumentId, client_id: ClientId },
    PeerLeft { doc_id: DocumentId, client_id: ClientId },
}

impl<E: Edit> ClientMessage<E> {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl<E: Edit> ServerMessage<E> {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(msg)
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("not joined to a document")]
    NotJoined,
}
