//! Per-document fan-out of applied operations and acknowledgments.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. The
//! authority publishes every outcome once; each session's
//! [`Subscription`] turns its own events into acknowledgments and
//! drops other sessions' no-ops, so a session sees acks and remote ops
//! interleaved in exactly the server's revision order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

use quill_ot::{ClientId, DocumentId, Revision};

/// Something that happened to a document, as published by the authority.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentEvent<E> {
    /// `op` was applied and produced `revision`.
    Applied {
        op: E,
        revision: Revision,
        client_id: ClientId,
    },
    /// A submission transformed to nothing; `revision` is unchanged.
    Noop { revision: Revision, client_id: ClientId },
    PeerJoined(ClientId),
    PeerLeft(ClientId),
}

/// What a single session should act on.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery<E> {
    /// This session's head submission landed at `revision`.
    Ack { revision: Revision },
    /// Another session's operation, already applied at `revision`.
    Remote {
        op: E,
        revision: Revision,
        client_id: ClientId,
    },
    PeerJoined(ClientId),
    PeerLeft(ClientId),
}

/// Subscription failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The receiver fell behind and events were lost; the session must resync.
    #[error("subscription lagged by {0} events")]
    Lagged(u64),

    #[error("broadcast group closed")]
    Closed,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub events_sent: u64,
    pub events_dropped: u64,
    pub active_sessions: usize,
}

/// Lock-free counters shared with subscriptions.
#[derive(Default)]
struct AtomicBroadcastStats {
    events_sent: AtomicU64,
    events_dropped: AtomicU64,
}

/// The sessions attached to one document and their shared channel.
///
/// A client id may be attached more than once while a reconnect
/// overlaps the old connection's teardown; it stays a member until its
/// last attachment is removed.
pub struct BroadcastGroup<E> {
    sender: broadcast::Sender<Arc<DocumentEvent<E>>>,
    sessions: RwLock<HashMap<ClientId, usize>>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl<E: Clone + Send + Sync + 'static> BroadcastGroup<E> {
    /// `capacity` bounds how far a slow session may fall behind before
    /// it starts losing events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sessions: RwLock::new(HashMap::new()),
            capacity,
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Register a session. It receives every event published after this
    /// call returns.
    pub async fn add_session(&self, client_id: ClientId) -> Subscription<E> {
        *self.sessions.write().await.entry(client_id).or_insert(0) += 1;
        Subscription {
            client_id,
            receiver: self.sender.subscribe(),
            stats: self.stats.clone(),
        }
    }

    /// Drop one attachment. Returns whether there was one to drop.
    pub async fn remove_session(&self, client_id: &ClientId) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(client_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => sessions.remove(client_id).is_some(),
            None => false,
        }
    }

    /// Returns the number of receivers the event reached.
    pub fn publish(&self, event: DocumentEvent<E>) -> usize {
        let count = self.sender.send(Arc::new(event)).unwrap_or(0);
        self.stats.events_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn has_session(&self, client_id: &ClientId) -> bool {
        self.sessions.read().await.contains_key(client_id)
    }

    pub async fn sessions(&self) -> Vec<ClientId> {
        self.sessions.read().await.keys().copied().collect()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_sent: self.stats.events_sent.load(Ordering::Relaxed),
            events_dropped: self.stats.events_dropped.load(Ordering::Relaxed),
            active_sessions: self.session_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One session's view of its document's event stream.
pub struct Subscription<E> {
    client_id: ClientId,
    receiver: broadcast::Receiver<Arc<DocumentEvent<E>>>,
    stats: Arc<AtomicBroadcastStats>,
}

impl<E: Clone> Subscription<E> {
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Next event relevant to this session.
    pub async fn recv(&mut self) -> Result<Delivery<E>, SubscriptionError> {
        loop {
            let event = match self.receiver.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.stats.events_dropped.fetch_add(n, Ordering::Relaxed);
                    return Err(SubscriptionError::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => return Err(SubscriptionError::Closed),
            };
            if let Some(delivery) = self.route(&event) {
                return Ok(delivery);
            }
        }
    }

    /// Drop anything queued and continue from the next published event.
    /// The authority calls this while holding the document lock so the
    /// snapshot it hands out lines up with the new stream position.
    pub fn resubscribe(&mut self) {
        self.receiver = self.receiver.resubscribe();
    }

    fn route(&self, event: &DocumentEvent<E>) -> Option<Delivery<E>> {
        let me = self.client_id;
        match event {
            DocumentEvent::Applied { revision, client_id, .. }
            | DocumentEvent::Noop { revision, client_id }
                if *client_id == me =>
            {
                Some(Delivery::Ack { revision: *revision })
            }
            DocumentEvent::Applied { op, revision, client_id } => Some(Delivery::Remote {
                op: op.clone(),
                revision: *revision,
                client_id: *client_id,
            }),
            DocumentEvent::Noop { .. } => None,
            DocumentEvent::PeerJoined(id) if *id != me => Some(Delivery::PeerJoined(*id)),
            DocumentEvent::PeerLeft(id) if *id != me => Some(Delivery::PeerLeft(*id)),
            DocumentEvent::PeerJoined(_) | DocumentEvent::PeerLeft(_) => None,
        }
    }
}

/// Registry mapping documents to their broadcast groups.
///
/// Owned by the authority; join and leave are the only ways a session
/// enters or exits a group.
pub struct BroadcastRegistry<E> {
    groups: RwLock<HashMap<DocumentId, Arc<BroadcastGroup<E>>>>,
    default_capacity: usize,
}

impl<E: Clone + Send + Sync + 'static> BroadcastRegistry<E> {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the group for the given document.
    pub async fn get_or_create(&self, doc_id: DocumentId) -> Arc<BroadcastGroup<E>> {
        // Fast path: read lock
        {
            let groups = self.groups.read().await;
            if let Some(group) = groups.get(&doc_id) {
                return group.clone();
            }
        }

        let mut groups = self.groups.write().await;
        // Double-check after acquiring write lock
        if let Some(group) = groups.get(&doc_id) {
            return group.clone();
        }

        let group = Arc::new(BroadcastGroup::new(self.default_capacity));
        groups.insert(doc_id, group.clone());
        group
    }

    pub async fn get(&self, doc_id: &DocumentId) -> Option<Arc<BroadcastGroup<E>>> {
        self.groups.read().await.get(doc_id).cloned()
    }

    /// Drop the group once its last session has left.
    pub async fn remove_if_empty(&self, doc_id: &DocumentId) -> bool {
        let mut groups = self.groups.write().await;
        if let Some(group) = groups.get(doc_id) {
            if group.session_count().await == 0 {
                groups.remove(doc_id);
                return true;
            }
        }
        false
    }

    pub async fn group_count(&self) -> usize {
        self.groups.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<DocumentId> {
        self.groups.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn applied(op: &str, revision: Revision, client: u128) -> DocumentEvent<String> {
        DocumentEvent::Applied {
            op: op.to_string(),
            revision,
            client_id: Uuid::from_u128(client),
        }
    }

    #[tokio::test]
    async fn test_group_add_remove() {
        let group = BroadcastGroup::<String>::new(16);
        let id = Uuid::new_v4();

        let _sub = group.add_session(id).await;
        assert_eq!(group.session_count().await, 1);
        assert!(group.has_session(&id).await);

        assert!(group.remove_session(&id).await);
        assert_eq!(group.session_count().await, 0);
        assert!(!group.has_session(&id).await);
    }

    #[tokio::test]
    async fn test_overlapping_attachments() {
        let group = BroadcastGroup::<String>::new(16);
        let id = Uuid::new_v4();

        let _old = group.add_session(id).await;
        let _new = group.add_session(id).await;
        assert_eq!(group.session_count().await, 1);

        assert!(group.remove_session(&id).await);
        assert!(group.has_session(&id).await);
        assert!(group.remove_session(&id).await);
        assert!(!group.has_session(&id).await);
        assert!(!group.remove_session(&id).await);
    }

    #[tokio::test]
    async fn test_own_events_become_acks() {
        let group = BroadcastGroup::new(16);
        let mut sub = group.add_session(Uuid::from_u128(1)).await;

        group.publish(applied("mine", 1, 1));
        group.publish(DocumentEvent::Noop { revision: 1, client_id: Uuid::from_u128(1) });

        assert_eq!(sub.recv().await.unwrap(), Delivery::Ack { revision: 1 });
        assert_eq!(sub.recv().await.unwrap(), Delivery::Ack { revision: 1 });
    }

    #[tokio::test]
    async fn test_foreign_noops_and_self_presence_skipped() {
        let group = BroadcastGroup::new(16);
        let me = Uuid::from_u128(1);
        let mut sub = group.add_session(me).await;

        group.publish(DocumentEvent::PeerJoined(me));
        group.publish(DocumentEvent::Noop { revision: 0, client_id: Uuid::from_u128(2) });
        group.publish(applied("theirs", 1, 2));

        assert_eq!(
            sub.recv().await.unwrap(),
            Delivery::Remote {
                op: "theirs".to_string(),
                revision: 1,
                client_id: Uuid::from_u128(2),
            }
        );
    }

    #[tokio::test]
    async fn test_fan_out_preserves_order() {
        let group = BroadcastGroup::new(16);
        let mut a = group.add_session(Uuid::from_u128(1)).await;
        let mut b = group.add_session(Uuid::from_u128(2)).await;

        assert_eq!(group.publish(applied("x", 1, 1)), 2);
        group.publish(applied("y", 2, 2));

        assert_eq!(a.recv().await.unwrap(), Delivery::Ack { revision: 1 });
        assert!(matches!(a.recv().await.unwrap(), Delivery::Remote { revision: 2, .. }));
        assert!(matches!(b.recv().await.unwrap(), Delivery::Remote { revision: 1, .. }));
        assert_eq!(b.recv().await.unwrap(), Delivery::Ack { revision: 2 });
    }

    #[tokio::test]
    async fn test_lagged_subscription_reports_loss() {
        let group = BroadcastGroup::new(2);
        let mut sub = group.add_session(Uuid::from_u128(1)).await;

        for rev in 1..=5 {
            group.publish(applied("z", rev, 2));
        }

        assert!(matches!(sub.recv().await, Err(SubscriptionError::Lagged(_))));
        assert!(group.stats().await.events_dropped > 0);
    }

    #[tokio::test]
    async fn test_resubscribe_skips_backlog() {
        let group = BroadcastGroup::new(16);
        let mut sub = group.add_session(Uuid::from_u128(1)).await;

        group.publish(applied("old", 1, 2));
        sub.resubscribe();
        group.publish(applied("new", 2, 2));

        assert!(matches!(sub.recv().await.unwrap(), Delivery::Remote { revision: 2, .. }));
    }

    #[tokio::test]
    async fn test_stats() {
        let group = BroadcastGroup::new(16);
        let _sub = group.add_session(Uuid::new_v4()).await;
        group.publish(DocumentEvent::<String>::PeerLeft(Uuid::new_v4()));
        group.publish(DocumentEvent::<String>::PeerLeft(Uuid::new_v4()));

        let stats = group.stats().await;
        assert_eq!(stats.events_sent, 2);
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(group.capacity(), 16);
    }

    #[tokio::test]
    async fn test_registry_get_or_create() {
        let registry = BroadcastRegistry::<String>::new(16);
        let doc_id = Uuid::new_v4();

        let g1 = registry.get_or_create(doc_id).await;
        let g2 = registry.get_or_create(doc_id).await;
        assert!(Arc::ptr_eq(&g1, &g2));
        assert_eq!(registry.group_count().await, 1);

        let other = Uuid::new_v4();
        registry.get_or_create(other).await;
        let docs = registry.active_documents().await;
        assert!(docs.contains(&doc_id) && docs.contains(&other));
    }

    #[tokio::test]
    async fn test_registry_cleanup() {
        let registry = BroadcastRegistry::<String>::new(16);
        let doc_id = Uuid::new_v4();
        let id = Uuid::new_v4();

        let group = registry.get_or_create(doc_id).await;
        let _sub = group.add_session(id).await;
        assert!(!registry.remove_if_empty(&doc_id).await);

        group.remove_session(&id).await;
        assert!(registry.remove_if_empty(&doc_id).await);
        assert!(registry.get(&doc_id).await.is_none());
    }
}
