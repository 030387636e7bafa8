//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - Optimistic local edits through a `ClientSession`
//! - Automatic resync when the replica can no longer be reconciled

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use quill_ot::{
    ClientId, ClientSession, DocumentId, Edit, Operation, Revision, SessionError, Snapshot,
    SyncState,
};

use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// A snapshot replaced local state
    Synced { revision: Revision },
    /// Our in-flight operation was sequenced
    Acknowledged { revision: Revision },
    /// A remote operation was merged into local content
    RemoteOperation { client_id: ClientId, revision: Revision },
    /// The server rejected our operation
    OperationRejected { message: String },
    /// Local state was discarded and a snapshot requested
    Resyncing { reason: String },
    PeerJoined(ClientId),
    PeerLeft(ClientId),
    Pong,
    /// Request-level failure reported by the server
    ServerError(String),
}

/// Client errors.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("no snapshot received yet")]
    NotSynced,
}

/// What one server message asks of the client.
#[derive(Debug)]
struct Reaction<E: Edit> {
    replies: Vec<ClientMessage<E>>,
    events: Vec<SyncEvent>,
}

impl<E: Edit> Default for Reaction<E> {
    fn default() -> Self {
        Self {
            replies: Vec::new(),
            events: Vec::new(),
        }
    }
}

/// The sync client.
///
/// Keeps one document replica in step with the server. Local edits are
/// applied immediately; acks, remote operations and snapshots are folded
/// in by a background reader task.
pub struct SyncClient<E: Edit> {
    client_id: ClientId,

    doc_id: DocumentId,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Replica, present once the first snapshot arrived
    session: Arc<Mutex<Option<ClientSession<E>>>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<SyncEvent>,

    /// Reader and writer of the current connection
    tasks: Vec<JoinHandle<()>>,

    server_url: String,
}

impl<E: Edit> SyncClient<E> {
    pub fn new(client_id: ClientId, doc_id: DocumentId, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            client_id,
            doc_id,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            session: Arc::new(Mutex::new(None)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            tasks: Vec::new(),
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and join the document.
    ///
    /// Returns once the join request is queued; `SyncEvent::Synced`
    /// follows when the snapshot arrives.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        // A previous connection must not touch the shared session again.
        self.abort_tasks();
        self.outgoing_tx = None;

        {
            let mut state = self.state.write().await;
            if *state != ConnectionState::Reconnecting {
                *state = ConnectionState::Connecting;
            }
        }

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::Connection(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx.clone());

        // Writer task: forward outgoing channel to WebSocket
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let join = ClientMessage::<E>::Join {
            doc_id: self.doc_id,
            client_id: self.client_id,
        };
        out_tx
            .send(Message::Binary(join.encode()?.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        *self.state.write().await = ConnectionState::Connected;
        emit(&self.event_tx, SyncEvent::Connected);

        // Reader task: fold server messages into the session
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let session = self.session.clone();
        let doc_id = self.doc_id;
        let client_id = self.client_id;
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let msg = match ServerMessage::<E>::decode(&data) {
                            Ok(msg) => msg,
                            Err(e) => {
                                log::warn!("Dropping undecodable server message: {e}");
                                continue;
                            }
                        };

                        let events = {
                            let mut guard = session.lock().await;
                            let reaction = process_message(&mut guard, doc_id, client_id, msg);
                            for reply in &reaction.replies {
                                match reply.encode() {
                                    Ok(bytes) => {
                                        let _ = out_tx.send(Message::Binary(bytes.into())).await;
                                    }
                                    Err(e) => log::error!("Failed to encode reply: {e}"),
                                }
                            }
                            reaction.events
                        };

                        for event in events {
                            emit(&event_tx, event);
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            emit(&event_tx, SyncEvent::Disconnected);
        });
        self.tasks = vec![writer, reader];

        Ok(())
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    /// Reconnect after a dropped connection. The next snapshot replaces
    /// whatever local state survived.
    pub async fn reconnect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Reconnecting;
        self.connect().await
    }

    /// Leave the document and close the connection.
    pub async fn disconnect(&mut self) -> Result<(), ProtocolError> {
        if let Some(tx) = self.outgoing_tx.take() {
            let leave = ClientMessage::<E>::Leave { doc_id: self.doc_id };
            let _ = tx.send(Message::Binary(leave.encode()?.into())).await;
            let _ = tx.send(Message::Close(None)).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
        Ok(())
    }

    /// Apply a local edit and submit it when nothing else is in flight.
    pub async fn apply_local(&self, op: E) -> Result<(), ClientError> {
        let tx = self.connected_sender().await?;
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(ClientError::NotSynced)?;

        if let Some(submission) = session.apply_local(op)? {
            let msg = ClientMessage::Submit {
                doc_id: self.doc_id,
                submission,
            };
            send(&tx, &msg).await?;
        }
        Ok(())
    }

    /// Discard local state and request a fresh snapshot.
    pub async fn resync(&self) -> Result<(), ClientError> {
        let tx = self.connected_sender().await?;
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(ClientError::NotSynced)?;
        session.begin_resync();
        send(&tx, &ClientMessage::<E>::Resync { doc_id: self.doc_id }).await?;
        Ok(())
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        send(tx, &ClientMessage::<E>::Ping).await
    }

    /// Local content, including unacknowledged edits.
    pub async fn content(&self) -> Option<E::Document> {
        self.session.lock().await.as_ref().map(|s| s.content().clone())
    }

    /// Content and revision as one snapshot of the replica.
    pub async fn replica(&self) -> Option<Snapshot<E::Document>> {
        self.session.lock().await.as_ref().map(|s| Snapshot {
            content: s.content().clone(),
            revision: s.revision(),
        })
    }

    pub async fn revision(&self) -> Option<Revision> {
        self.session.lock().await.as_ref().map(|s| s.revision())
    }

    pub async fn sync_state(&self) -> Option<SyncState> {
        self.session.lock().await.as_ref().map(|s| s.state())
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Get the document ID.
    pub fn doc_id(&self) -> DocumentId {
        self.doc_id
    }

    async fn connected_sender(&self) -> Result<mpsc::Sender<Message>, ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.outgoing_tx
            .clone()
            .ok_or(ProtocolError::ConnectionClosed)
    }
}

impl SyncClient<Operation> {
    /// Capture an editor change by diffing against local content.
    pub async fn edit(&self, new_content: &str) -> Result<(), ClientError> {
        let tx = self.connected_sender().await?;
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(ClientError::NotSynced)?;

        for submission in session.edit(new_content)? {
            let msg = ClientMessage::Submit {
                doc_id: self.doc_id,
                submission,
            };
            send(&tx, &msg).await?;
        }
        Ok(())
    }
}

impl<E: Edit> Drop for SyncClient<E> {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

async fn send<E: Edit>(tx: &mpsc::Sender<Message>, msg: &ClientMessage<E>) -> Result<(), ProtocolError> {
    let encoded = msg.encode()?;
    tx.send(Message::Binary(encoded.into()))
        .await
        .map_err(|_| ProtocolError::ConnectionClosed)
}

fn emit(event_tx: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    if let Err(e) = event_tx.try_send(event) {
        log::debug!("Sync event dropped: {e}");
    }
}

/// Fold one server message into the replica.
fn process_message<E: Edit>(
    session: &mut Option<ClientSession<E>>,
    doc_id: DocumentId,
    client_id: ClientId,
    msg: ServerMessage<E>,
) -> Reaction<E> {
    let mut reaction = Reaction::default();

    match msg {
        ServerMessage::Snapshot { doc_id: d, snapshot } if d == doc_id => {
            let revision = snapshot.revision;
            match session.as_mut() {
                Some(s) => s.handle_snapshot(snapshot),
                None => *session = Some(ClientSession::new(client_id, snapshot)),
            }
            reaction.events.push(SyncEvent::Synced { revision });
        }

        ServerMessage::Ack { doc_id: d, revision } if d == doc_id => {
            let Some(s) = session.as_mut() else {
                return reaction;
            };
            match s.handle_ack(revision) {
                Ok(next) => {
                    reaction.events.push(SyncEvent::Acknowledged { revision });
                    if let Some(submission) = next {
                        reaction.replies.push(ClientMessage::Submit { doc_id, submission });
                    }
                }
                Err(e) => start_resync(s, doc_id, e, &mut reaction),
            }
        }

        ServerMessage::Operation {
            doc_id: d,
            op,
            revision,
            client_id: origin,
        } if d == doc_id => {
            let Some(s) = session.as_mut() else {
                return reaction;
            };
            let was_resyncing = s.state() == SyncState::AwaitingSnapshot;
            match s.handle_remote(op, revision, origin) {
                Ok(()) if !was_resyncing && origin != client_id => {
                    reaction.events.push(SyncEvent::RemoteOperation {
                        client_id: origin,
                        revision,
                    });
                }
                Ok(()) => {}
                Err(e) => start_resync(s, doc_id, e, &mut reaction),
            }
        }

        ServerMessage::OperationError {
            doc_id: d, message, ..
        } if d == doc_id => {
            reaction.events.push(SyncEvent::OperationRejected {
                message: message.clone(),
            });
            if let Some(s) = session.as_mut() {
                if s.state() != SyncState::AwaitingSnapshot {
                    s.begin_resync();
                    reaction.replies.push(ClientMessage::Resync { doc_id });
                    reaction.events.push(SyncEvent::Resyncing { reason: message });
                }
            }
        }

        ServerMessage::PeerJoined { doc_id: d, client_id: peer } if d == doc_id => {
            reaction.events.push(SyncEvent::PeerJoined(peer));
        }

        ServerMessage::PeerLeft { doc_id: d, client_id: peer } if d == doc_id => {
            reaction.events.push(SyncEvent::PeerLeft(peer));
        }

        ServerMessage::Error { message } => {
            log::warn!("Server error: {message}");
            reaction.events.push(SyncEvent::ServerError(message));
        }

        ServerMessage::Pong => reaction.events.push(SyncEvent::Pong),

        other => log::debug!("Ignoring message for another document: {other:?}"),
    }

    reaction
}

fn start_resync<E: Edit>(
    session: &mut ClientSession<E>,
    doc_id: DocumentId,
    error: SessionError,
    reaction: &mut Reaction<E>,
) {
    log::warn!("Replica of {doc_id} lost sync: {error}");
    session.begin_resync();
    reaction.replies.push(ClientMessage::Resync { doc_id });
    reaction.events.push(SyncEvent::Resyncing {
        reason: error.to_string(),
    });
}
