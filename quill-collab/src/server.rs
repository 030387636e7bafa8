//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── DocumentStore (memory / RocksDB)
//!             ├── connection task ───┤
//! Client B ──┘        │              └── Authority ── per-doc Mutex
//!                     │                      │
//!                     │               BroadcastRegistry
//!                     ▼                      │
//!              Subscription ◄────────────────┘
//!              (acks + remote ops, revision order)
//! ```
//!
//! One task per connection. Each task selects between inbound frames,
//! its document subscription, and a heartbeat timer. Acknowledgments are
//! not sent by the submit path; they arrive through the subscription so
//! a session sees its ack in the same order as everyone else's ops.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use quill_ot::{ClientId, DocumentId, Edit};

use crate::authority::{Authority, AuthorityConfig, AuthorityError, SubmitOutcome};
use crate::broadcast::{Delivery, Subscription, SubscriptionError};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::storage::{
    DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError, DEFAULT_LOG_CAPACITY,
};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type ConnectionResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum sessions per document
    pub max_sessions_per_document: usize,
    /// Broadcast channel capacity per document
    pub broadcast_capacity: usize,
    /// Operations retained per document for rebasing
    pub log_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Create unknown documents on join instead of rejecting them
    pub auto_create_documents: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_sessions_per_document: 100,
            broadcast_capacity: 256,
            log_capacity: DEFAULT_LOG_CAPACITY,
            heartbeat_interval_secs: 30,
            storage_path: None,
            auto_create_documents: false,
        }
    }
}

impl ServerConfig {
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            max_sessions_per_document: 10,
            broadcast_capacity: 64,
            heartbeat_interval_secs: 30,
            auto_create_documents: true,
            ..Self::default()
        }
    }

    pub fn authority_config(&self) -> AuthorityConfig {
        AuthorityConfig {
            log_capacity: self.log_capacity,
            broadcast_capacity: self.broadcast_capacity,
            max_sessions_per_document: Some(self.max_sessions_per_document),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub applied_operations: u64,
    pub noop_operations: u64,
    pub rejected_operations: u64,
    pub resyncs: u64,
}

/// A connection's attachment to one document.
struct Joined<E> {
    doc_id: DocumentId,
    client_id: ClientId,
    subscription: Subscription<E>,
}

/// The sync server.
pub struct SyncServer<E: Edit, S> {
    config: ServerConfig,
    authority: Arc<Authority<E, S>>,
    stats: Arc<RwLock<ServerStats>>,
}

impl<E: Edit> SyncServer<E, MemoryStore<E>> {
    /// Server without persistence.
    pub fn in_memory(config: ServerConfig) -> Self {
        let store = MemoryStore::new(config.log_capacity);
        Self::new(config, store)
    }
}

impl<E: Edit> SyncServer<E, RocksStore<E>> {
    /// Server persisting to RocksDB at `config.storage_path`.
    pub fn with_storage(config: ServerConfig) -> Result<Self, StoreError> {
        let path = config
            .storage_path
            .clone()
            .unwrap_or_else(|| StoreConfig::default().path);
        let store = RocksStore::open(StoreConfig {
            path,
            log_capacity: config.log_capacity,
            ..StoreConfig::default()
        })?;
        Ok(Self::new(config, store))
    }
}

impl<E: Edit, S: DocumentStore<E>> SyncServer<E, S> {
    pub fn new(config: ServerConfig, store: S) -> Self {
        let authority = Arc::new(Authority::new(config.authority_config(), Arc::new(store)));
        Self {
            config,
            authority,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let recovered = self.authority.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} documents from storage");
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let authority = self.authority.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, authority, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        authority: Arc<Authority<E, S>>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> ConnectionResult<()> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut joined: Option<Joined<E>> = None;
        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs.max(1)));
        heartbeat.tick().await;

        let result: ConnectionResult<()> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += data.len() as u64;
                                }
                                match ClientMessage::<E>::decode(&data) {
                                    Ok(msg) => {
                                        Self::handle_message(
                                            msg, &mut joined, &authority, &stats, &config,
                                            &mut ws_sender,
                                        )
                                        .await?;
                                    }
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        let reply = ServerMessage::<E>::Error { message: e.to_string() };
                                        send(&mut ws_sender, &reply).await?;
                                    }
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Acks and remote operations for the joined document
                    delivery = async {
                        match joined.as_mut() {
                            Some(j) => j.subscription.recv().await,
                            // Not joined yet, nothing to wait on
                            None => std::future::pending().await,
                        }
                    } => {
                        let Some(j) = joined.as_ref() else { continue };
                        let doc_id = j.doc_id;
                        let reply = match delivery {
                            Ok(Delivery::Ack { revision }) => ServerMessage::Ack { doc_id, revision },
                            Ok(Delivery::Remote { op, revision, client_id }) => {
                                ServerMessage::Operation { doc_id, op, revision, client_id }
                            }
                            Ok(Delivery::PeerJoined(client_id)) => ServerMessage::PeerJoined { doc_id, client_id },
                            Ok(Delivery::PeerLeft(client_id)) => ServerMessage::PeerLeft { doc_id, client_id },
                            Err(SubscriptionError::Lagged(n)) => {
                                log::warn!("Session {} lagged by {n} events on {doc_id}", j.client_id);
                                ServerMessage::OperationError {
                                    doc_id,
                                    message: format!("missed {n} events"),
                                    resync: true,
                                }
                            }
                            Err(SubscriptionError::Closed) => {
                                log::warn!("Broadcast group for {doc_id} closed under session {}", j.client_id);
                                joined = None;
                                continue;
                            }
                        };
                        send(&mut ws_sender, &reply).await?;
                    }

                    _ = heartbeat.tick() => {
                        ws_sender.send(Message::Ping(Vec::new().into())).await?;
                    }
                }
            }
            Ok(())
        }
        .await;

        if let Some(j) = joined.take() {
            authority.leave(j.doc_id, j.subscription).await;
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        result
    }

    async fn handle_message(
        msg: ClientMessage<E>,
        joined: &mut Option<Joined<E>>,
        authority: &Authority<E, S>,
        stats: &RwLock<ServerStats>,
        config: &ServerConfig,
        ws_sender: &mut WsSink,
    ) -> ConnectionResult<()> {
        match msg {
            ClientMessage::Join { doc_id, client_id } => {
                if let Some(previous) = joined.take() {
                    authority.leave(previous.doc_id, previous.subscription).await;
                }

                let mut result = authority.join(doc_id, client_id).await;
                if config.auto_create_documents
                    && matches!(result, Err(AuthorityError::NotFound(_)))
                {
                    match authority.create(doc_id, E::Document::default()).await {
                        Ok(_) | Err(AuthorityError::Store(StoreError::AlreadyExists(_))) => {}
                        Err(e) => log::error!("Failed to auto-create document {doc_id}: {e}"),
                    }
                    result = authority.join(doc_id, client_id).await;
                }

                match result {
                    Ok((snapshot, subscription)) => {
                        *joined = Some(Joined {
                            doc_id,
                            client_id,
                            subscription,
                        });
                        send(ws_sender, &ServerMessage::<E>::Snapshot { doc_id, snapshot }).await?;
                    }
                    Err(e) => {
                        log::warn!("Join of {doc_id} by {client_id} refused: {e}");
                        send(ws_sender, &ServerMessage::<E>::Error { message: e.to_string() }).await?;
                    }
                }
            }

            ClientMessage::Submit { doc_id, submission } => {
                let Some(j) = joined.as_ref().filter(|j| j.doc_id == doc_id) else {
                    let message = format!("not joined to document {doc_id}");
                    return send(ws_sender, &ServerMessage::<E>::Error { message }).await;
                };
                if submission.client_id != j.client_id {
                    let message = format!("client id {} does not match session", submission.client_id);
                    return send(ws_sender, &ServerMessage::<E>::Error { message }).await;
                }

                match authority.submit(doc_id, submission).await {
                    Ok(SubmitOutcome::Applied { .. }) => stats.write().await.applied_operations += 1,
                    Ok(SubmitOutcome::Noop { .. }) => stats.write().await.noop_operations += 1,
                    Err(e) => {
                        stats.write().await.rejected_operations += 1;
                        log::warn!("Rejected submission from {} on {doc_id}: {e}", j.client_id);
                        let reply = ServerMessage::<E>::OperationError {
                            doc_id,
                            message: e.to_string(),
                            resync: e.is_divergence(),
                        };
                        send(ws_sender, &reply).await?;
                    }
                }
            }

            ClientMessage::Resync { doc_id } => {
                let Some(j) = joined.as_mut().filter(|j| j.doc_id == doc_id) else {
                    let message = format!("not joined to document {doc_id}");
                    return send(ws_sender, &ServerMessage::<E>::Error { message }).await;
                };
                match authority.resync(doc_id, &mut j.subscription).await {
                    Ok(snapshot) => {
                        stats.write().await.resyncs += 1;
                        send(ws_sender, &ServerMessage::<E>::Snapshot { doc_id, snapshot }).await?;
                    }
                    Err(e) => {
                        send(ws_sender, &ServerMessage::<E>::Error { message: e.to_string() }).await?;
                    }
                }
            }

            ClientMessage::Leave { doc_id } => {
                if let Some(j) = joined.take_if(|j| j.doc_id == doc_id) {
                    authority.leave(j.doc_id, j.subscription).await;
                }
            }

            ClientMessage::Ping => {
                send(ws_sender, &ServerMessage::<E>::Pong).await?;
            }
        }
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn authority(&self) -> &Arc<Authority<E, S>> {
        &self.authority
    }
}

async fn send<E: Edit>(ws_sender: &mut WsSink, msg: &ServerMessage<E>) -> ConnectionResult<()> {
    let encoded = msg.encode()?;
    ws_sender.send(Message::Binary(encoded.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_ot::Operation;
    use uuid::Uuid;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_sessions_per_document, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.log_capacity, 200);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert!(config.storage_path.is_none());
        assert!(!config.auto_create_documents);
    }

    #[test]
    fn test_authority_config_mapping() {
        let config = ServerConfig {
            max_sessions_per_document: 3,
            log_capacity: 50,
            ..ServerConfig::default()
        };
        let authority = config.authority_config();
        assert_eq!(authority.max_sessions_per_document, Some(3));
        assert_eq!(authority.log_capacity, 50);
        assert_eq!(authority.broadcast_capacity, 256);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = SyncServer::<Operation, _>::in_memory(ServerConfig::default());
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.applied_operations, 0);
    }

    #[tokio::test]
    async fn test_server_with_storage_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::default()
        };
        let doc_id = Uuid::new_v4();

        {
            let server = SyncServer::<Operation, _>::with_storage(config.clone()).unwrap();
            server.authority().create(doc_id, "kept".to_string()).await.unwrap();
        }

        let server = SyncServer::<Operation, _>::with_storage(config).unwrap();
        assert_eq!(server.authority().recover().await.unwrap(), 1);
        let snapshot = server.authority().snapshot(doc_id).await.unwrap();
        assert_eq!(snapshot.content, "kept");
    }
}
