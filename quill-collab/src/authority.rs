//! The server authority: sequences every edit to a document.
//!
//! ```text
//!  submit(op, base) ──► validate ──► lock doc ──► rebase over log[base..]
//!                                      │                 │
//!                                      │          None ──┴──► publish Noop
//!                                      ▼
//!                          apply ──► store.append ──► commit ──► publish Applied
//! ```
//!
//! Each document is guarded by its own async mutex; documents never
//! contend with each other. State is committed to memory only after the
//! store accepted the append, so a persistence failure leaves the
//! revision untouched.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use quill_ot::{
    transform_sequence, ApplyError, ClientId, DocumentId, Edit, Revision, Snapshot, Submission,
    ValidationError,
};

use crate::broadcast::{BroadcastRegistry, DocumentEvent, Subscription};
use crate::storage::{DocumentStore, LogEntry, StoreError, DEFAULT_LOG_CAPACITY};

/// Authority configuration.
#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    /// Applied operations retained per document for rebasing
    pub log_capacity: usize,
    /// Events buffered per session before it lags
    pub broadcast_capacity: usize,
    /// Sessions allowed per document (None = unlimited)
    pub max_sessions_per_document: Option<usize>,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            log_capacity: DEFAULT_LOG_CAPACITY,
            broadcast_capacity: 256,
            max_sessions_per_document: None,
        }
    }
}

impl AuthorityConfig {
    pub fn for_testing() -> Self {
        Self {
            log_capacity: DEFAULT_LOG_CAPACITY,
            broadcast_capacity: 64,
            max_sessions_per_document: Some(8),
        }
    }
}

/// Errors reported to the submitter (or joiner). None of them change
/// document state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthorityError {
    #[error("invalid operation: {0}")]
    Validation(#[from] ValidationError),

    #[error("document not found: {0}")]
    NotFound(DocumentId),

    #[error("base revision {base} is ahead of document revision {current}")]
    BaseAhead { base: Revision, current: Revision },

    #[error("base revision {base} predates retained history (oldest usable base is {oldest})")]
    BaseTooOld { base: Revision, oldest: Revision },

    #[error("transformed operation does not fit the document: {0}")]
    Diverged(#[from] ApplyError),

    #[error("persistence failed: {0}")]
    Store(#[from] StoreError),

    #[error("document {doc_id} already has {max} sessions")]
    DocumentFull { doc_id: DocumentId, max: usize },
}

impl AuthorityError {
    /// Whether the submitter's replica can no longer be reconciled and
    /// must resync.
    pub fn is_divergence(&self) -> bool {
        matches!(
            self,
            AuthorityError::BaseAhead { .. }
                | AuthorityError::BaseTooOld { .. }
                | AuthorityError::Diverged(_)
        )
    }
}

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome<E> {
    /// Applied as `op` (post-transform), producing `revision`.
    Applied { revision: Revision, op: E },
    /// Transformed to nothing; acknowledged at the unchanged `revision`.
    Noop { revision: Revision },
}

impl<E> SubmitOutcome<E> {
    pub fn revision(&self) -> Revision {
        match self {
            SubmitOutcome::Applied { revision, .. } | SubmitOutcome::Noop { revision } => *revision,
        }
    }
}

struct DocumentState<E: Edit> {
    content: E::Document,
    revision: Revision,
    log: VecDeque<LogEntry<E>>,
}

impl<E: Edit> DocumentState<E> {
    fn snapshot(&self) -> Snapshot<E::Document> {
        Snapshot {
            content: self.content.clone(),
            revision: self.revision,
        }
    }

    /// Smallest base revision the retained log can still rebase from.
    fn oldest_base(&self) -> Revision {
        self.log
            .front()
            .map_or(self.revision, |entry| entry.applied_revision - 1)
    }
}

/// Single writer for every document it serves.
pub struct Authority<E: Edit, S> {
    config: AuthorityConfig,
    store: Arc<S>,
    documents: RwLock<HashMap<DocumentId, Arc<Mutex<DocumentState<E>>>>>,
    registry: BroadcastRegistry<E>,
}

impl<E: Edit, S: DocumentStore<E>> Authority<E, S> {
    pub fn new(config: AuthorityConfig, store: Arc<S>) -> Self {
        let registry = BroadcastRegistry::new(config.broadcast_capacity);
        Self {
            config,
            store,
            documents: RwLock::new(HashMap::new()),
            registry,
        }
    }

    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &BroadcastRegistry<E> {
        &self.registry
    }

    /// Load every persisted document so reconnecting sessions find it warm.
    pub async fn recover(&self) -> Result<usize, AuthorityError> {
        let doc_ids = self.store.list_documents()?;
        let mut recovered = 0;
        for doc_id in &doc_ids {
            match self.document(*doc_id).await {
                Ok(_) => recovered += 1,
                Err(e) => log::error!("Failed to recover document {doc_id}: {e}"),
            }
        }
        log::info!("Recovery complete: {recovered}/{} documents loaded", doc_ids.len());
        Ok(recovered)
    }

    /// Register a new document at revision 0.
    pub async fn create(
        &self,
        doc_id: DocumentId,
        content: E::Document,
    ) -> Result<Snapshot<E::Document>, AuthorityError> {
        self.store.create(doc_id, &content)?;
        log::info!("Created document {doc_id}");
        Ok(Snapshot { content, revision: 0 })
    }

    /// Attach a session to a document: snapshot plus a subscription that
    /// starts exactly after that snapshot.
    pub async fn join(
        &self,
        doc_id: DocumentId,
        client_id: ClientId,
    ) -> Result<(Snapshot<E::Document>, Subscription<E>), AuthorityError> {
        let doc = self.document(doc_id).await?;
        let state = doc.lock().await;

        let group = self.registry.get_or_create(doc_id).await;
        if let Some(max) = self.config.max_sessions_per_document {
            if group.session_count().await >= max && !group.has_session(&client_id).await {
                log::warn!("Rejecting {client_id}: document {doc_id} is full");
                return Err(AuthorityError::DocumentFull { doc_id, max });
            }
        }

        let subscription = group.add_session(client_id).await;
        group.publish(DocumentEvent::PeerJoined(client_id));
        log::info!("Session {client_id} joined document {doc_id} at revision {}", state.revision);

        Ok((state.snapshot(), subscription))
    }

    /// Sequence one submission.
    pub async fn submit(
        &self,
        doc_id: DocumentId,
        submission: Submission<E>,
    ) -> Result<SubmitOutcome<E>, AuthorityError> {
        submission.op.validate()?;

        let doc = self.document(doc_id).await?;
        let mut state = doc.lock().await;

        let Submission {
            op,
            client_id,
            base_revision,
        } = submission;

        if base_revision > state.revision {
            return Err(AuthorityError::BaseAhead {
                base: base_revision,
                current: state.revision,
            });
        }
        let oldest = state.oldest_base();
        if base_revision < oldest {
            log::warn!(
                "Submission from {client_id} on {doc_id} based on {base_revision}, history starts at {oldest}"
            );
            return Err(AuthorityError::BaseTooOld {
                base: base_revision,
                oldest,
            });
        }

        let concurrent = state
            .log
            .iter()
            .filter(|entry| entry.applied_revision > base_revision)
            .map(|entry| (&entry.op, entry.client_id));
        let transformed = transform_sequence(op, client_id, concurrent);

        let Some(op) = transformed else {
            log::debug!(
                "Submission from {client_id} on {doc_id} became a no-op at revision {}",
                state.revision
            );
            self.publish(
                doc_id,
                DocumentEvent::Noop {
                    revision: state.revision,
                    client_id,
                },
            )
            .await;
            return Ok(SubmitOutcome::Noop {
                revision: state.revision,
            });
        };

        let mut content = state.content.clone();
        op.apply_to(&mut content)?;

        let new_revision = state.revision + 1;
        let entry = LogEntry {
            op: op.clone(),
            client_id,
            base_revision,
            applied_revision: new_revision,
        };
        if let Err(e) = self.store.append(doc_id, &entry, new_revision, &content) {
            log::error!("Failed to persist revision {new_revision} of {doc_id}: {e}");
            return Err(e.into());
        }

        state.content = content;
        state.revision = new_revision;
        state.log.push_back(entry);
        while state.log.len() > self.config.log_capacity {
            state.log.pop_front();
        }

        log::trace!("Applied {op:?} to {doc_id} at revision {new_revision}");
        self.publish(
            doc_id,
            DocumentEvent::Applied {
                op: op.clone(),
                revision: new_revision,
                client_id,
            },
        )
        .await;

        Ok(SubmitOutcome::Applied {
            revision: new_revision,
            op,
        })
    }

    /// Fresh snapshot for a session that lost track, with its
    /// subscription moved to the matching stream position.
    pub async fn resync(
        &self,
        doc_id: DocumentId,
        subscription: &mut Subscription<E>,
    ) -> Result<Snapshot<E::Document>, AuthorityError> {
        let doc = self.document(doc_id).await?;
        let state = doc.lock().await;
        subscription.resubscribe();
        log::info!(
            "Session {} resynced {doc_id} at revision {}",
            subscription.client_id(),
            state.revision
        );
        Ok(state.snapshot())
    }

    /// Current content and revision, without joining.
    pub async fn snapshot(&self, doc_id: DocumentId) -> Result<Snapshot<E::Document>, AuthorityError> {
        let doc = self.document(doc_id).await?;
        let state = doc.lock().await;
        Ok(state.snapshot())
    }

    /// Detach a session. The subscription is consumed, so nothing more is
    /// delivered to it. Returns whether it was attached.
    pub async fn leave(&self, doc_id: DocumentId, subscription: Subscription<E>) -> bool {
        let client_id = subscription.client_id();
        drop(subscription);

        let doc = {
            let documents = self.documents.read().await;
            documents.get(&doc_id).cloned()
        };
        let Some(doc) = doc else {
            return false;
        };
        let _state = doc.lock().await;

        let Some(group) = self.registry.get(&doc_id).await else {
            return false;
        };
        let removed = group.remove_session(&client_id).await;
        if removed && !group.has_session(&client_id).await {
            group.publish(DocumentEvent::PeerLeft(client_id));
            log::info!("Session {client_id} left document {doc_id}");
        }
        if self.registry.remove_if_empty(&doc_id).await {
            log::debug!("Broadcast group for {doc_id} removed (empty)");
        }
        removed
    }

    /// Sessions currently attached to a document.
    pub async fn session_count(&self, doc_id: DocumentId) -> usize {
        match self.registry.get(&doc_id).await {
            Some(group) => group.session_count().await,
            None => 0,
        }
    }

    async fn publish(&self, doc_id: DocumentId, event: DocumentEvent<E>) {
        if let Some(group) = self.registry.get(&doc_id).await {
            group.publish(event);
        }
    }

    /// Cached document state, loading it from the store on first use.
    async fn document(
        &self,
        doc_id: DocumentId,
    ) -> Result<Arc<Mutex<DocumentState<E>>>, AuthorityError> {
        // Fast path: read lock
        {
            let documents = self.documents.read().await;
            if let Some(doc) = documents.get(&doc_id) {
                return Ok(doc.clone());
            }
        }

        let mut documents = self.documents.write().await;
        if let Some(doc) = documents.get(&doc_id) {
            return Ok(doc.clone());
        }

        let stored = self
            .store
            .load(doc_id)?
            .ok_or(AuthorityError::NotFound(doc_id))?;

        let mut log: VecDeque<_> = stored.log.into();
        while log.len() > self.config.log_capacity {
            log.pop_front();
        }
        log::debug!(
            "Loaded document {doc_id} at revision {} with {} log entries",
            stored.revision,
            log.len()
        );

        let doc = Arc::new(Mutex::new(DocumentState {
            content: stored.content,
            revision: stored.revision,
            log,
        }));
        documents.insert(doc_id, doc.clone());
        Ok(doc)
    }
}

#[cfg(test)]
impl<E: Edit, S: DocumentStore<E>> Authority<E, S> {
    async fn group(&self, doc_id: DocumentId) -> Option<Arc<crate::broadcast::BroadcastGroup<E>>> {
        self.registry.get(&doc_id).await
    }
}
