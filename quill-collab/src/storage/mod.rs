//! Persistence collaborator for the server authority.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   append(entry, rev, content)   ┌───────────────┐
//! │ Authority   │ ──────────────────────────────► │ DocumentStore │
//! │ (in-memory) │ ◄────────────────────────────── │  (trait)      │
//! └─────────────┘        load on first use        └───────┬───────┘
//!                                                         │
//!                                        ┌────────────────┴──────────┐
//!                                        ▼                           ▼
//!                                 ┌─────────────┐    ┌──────────────────────────────┐
//!                                 │ MemoryStore │    │ RocksStore                   │
//!                                 │ (HashMap)   │    │ CF "documents" — content+rev │
//!                                 └─────────────┘    │ CF "oplog"     — log entries │
//!                                                    │ CF "metadata"  — timestamps  │
//!                                                    └──────────────────────────────┘
//! ```
//!
//! `append` is the single-writer guard: it refuses any revision other
//! than the stored one plus one, so two authorities racing on the same
//! document cannot both commit.

pub mod memory;
pub mod rocks;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use quill_ot::{ClientId, DocumentId, Edit, Revision};

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

/// Default number of log entries retained per document.
pub const DEFAULT_LOG_CAPACITY: usize = 200;

/// One applied operation in a document's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry<E> {
    /// The operation as applied, after transformation.
    pub op: E,
    pub client_id: ClientId,
    /// Revision the author had seen when submitting.
    pub base_revision: Revision,
    /// Revision this operation produced.
    pub applied_revision: Revision,
}

/// Everything the authority needs to serve a document.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument<E: Edit> {
    pub content: E::Document,
    pub revision: Revision,
    /// Most recent entries, oldest first.
    pub log: Vec<LogEntry<E>>,
}

/// Storage errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("document not found: {0}")]
    NotFound(DocumentId),

    #[error("document already exists: {0}")]
    AlreadyExists(DocumentId),

    #[error("revision conflict: expected {expected}, got {found}")]
    RevisionConflict { expected: Revision, found: Revision },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable home of document content, revision and operation history.
///
/// Implementations are shared across connection tasks and called from
/// inside the authority's per-document critical section.
pub trait DocumentStore<E: Edit>: Send + Sync + 'static {
    /// Current state, or `None` for an unknown document.
    fn load(&self, doc_id: DocumentId) -> Result<Option<StoredDocument<E>>, StoreError>;

    /// Register a new document at revision 0.
    fn create(&self, doc_id: DocumentId, content: &E::Document) -> Result<(), StoreError>;

    /// Record `entry` and the resulting content atomically. Fails with
    /// `RevisionConflict` unless `new_revision` is the stored revision
    /// plus one; nothing is written in that case.
    fn append(
        &self,
        doc_id: DocumentId,
        entry: &LogEntry<E>,
        new_revision: Revision,
        new_content: &E::Document,
    ) -> Result<(), StoreError>;

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError>;

    /// Returns whether the document existed.
    fn delete(&self, doc_id: DocumentId) -> Result<bool, StoreError>;
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}
