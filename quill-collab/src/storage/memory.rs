//! Volatile store used when no storage path is configured, and in tests.

use std::collections::HashMap;
use std::sync::RwLock;

use quill_ot::{DocumentId, Edit, Revision};

use super::{DocumentStore, LogEntry, StoreError, StoredDocument, DEFAULT_LOG_CAPACITY};

pub struct MemoryStore<E: Edit> {
    documents: RwLock<HashMap<DocumentId, StoredDocument<E>>>,
    log_capacity: usize,
}

impl<E: Edit> MemoryStore<E> {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            log_capacity: log_capacity.max(1),
        }
    }

    pub fn log_capacity(&self) -> usize {
        self.log_capacity
    }

    /// Stored revision, if the document exists.
    pub fn revision(&self, doc_id: DocumentId) -> Option<Revision> {
        self.documents
            .read()
            .ok()
            .and_then(|docs| docs.get(&doc_id).map(|d| d.revision))
    }
}

impl<E: Edit> Default for MemoryStore<E> {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Database("store lock poisoned".into())
}

impl<E: Edit> DocumentStore<E> for MemoryStore<E> {
    fn load(&self, doc_id: DocumentId) -> Result<Option<StoredDocument<E>>, StoreError> {
        let docs = self.documents.read().map_err(poisoned)?;
        Ok(docs.get(&doc_id).cloned())
    }

    fn create(&self, doc_id: DocumentId, content: &E::Document) -> Result<(), StoreError> {
        let mut docs = self.documents.write().map_err(poisoned)?;
        if docs.contains_key(&doc_id) {
            return Err(StoreError::AlreadyExists(doc_id));
        }
        docs.insert(
            doc_id,
            StoredDocument {
                content: content.clone(),
                revision: 0,
                log: Vec::new(),
            },
        );
        Ok(())
    }

    fn append(
        &self,
        doc_id: DocumentId,
        entry: &LogEntry<E>,
        new_revision: Revision,
        new_content: &E::Document,
    ) -> Result<(), StoreError> {
        let mut docs = self.documents.write().map_err(poisoned)?;
        let doc = docs.get_mut(&doc_id).ok_or(StoreError::NotFound(doc_id))?;
        if new_revision != doc.revision + 1 {
            return Err(StoreError::RevisionConflict {
                expected: doc.revision + 1,
                found: new_revision,
            });
        }

        doc.content = new_content.clone();
        doc.revision = new_revision;
        doc.log.push(entry.clone());
        if doc.log.len() > self.log_capacity {
            let excess = doc.log.len() - self.log_capacity;
            doc.log.drain(..excess);
        }
        Ok(())
    }

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let docs = self.documents.read().map_err(poisoned)?;
        Ok(docs.keys().copied().collect())
    }

    fn delete(&self, doc_id: DocumentId) -> Result<bool, StoreError> {
        let mut docs = self.documents.write().map_err(poisoned)?;
        Ok(docs.remove(&doc_id).is_some())
    }
}
