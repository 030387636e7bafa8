//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use futures_util::{SinkExt, StreamExt};
use quill_collab::client::{ConnectionState, SyncClient, SyncEvent};
use quill_collab::protocol::{ClientMessage, ServerMessage};
use quill_collab::server::{ServerConfig, SyncServer};
use quill_ot::{Operation, Submission, SyncState};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return the port.
async fn start_test_server(auto_create: bool) -> u16 {
    let port = free_port().await;
    let config = ServerConfig {
        auto_create_documents: auto_create,
        ..ServerConfig::for_testing(format!("127.0.0.1:{port}"))
    };
    let server = SyncServer::<Operation, _>::in_memory(config);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    sleep(Duration::from_millis(50)).await;
    port
}

/// Receive events until one matches.
async fn wait_for(
    rx: &mut mpsc::Receiver<SyncEvent>,
    mut predicate: impl FnMut(&SyncEvent) -> bool,
) -> SyncEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn connected_client(
    url: &str,
    doc_id: Uuid,
    id: u128,
) -> (SyncClient<Operation>, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(Uuid::from_u128(id), doc_id, url);
    let mut rx = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    wait_for(&mut rx, |e| matches!(e, SyncEvent::Synced { .. })).await;
    (client, rx)
}

/// Poll until every client is idle on the same revision and content.
async fn converged(clients: &[&SyncClient<Operation>]) -> (String, u64) {
    timeout(Duration::from_secs(5), async {
        loop {
            let mut replicas = Vec::new();
            for client in clients {
                let idle = client.sync_state().await == Some(SyncState::Idle);
                replicas.push((idle, client.replica().await));
            }
            let first = replicas[0].1.clone();
            if replicas.iter().all(|(idle, r)| *idle && r.is_some() && *r == first) {
                let snapshot = first.unwrap();
                return (snapshot.content, snapshot.revision);
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("clients did not converge")
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let port = start_test_server(true).await;
    let url = format!("ws://127.0.0.1:{port}");

    // Connect raw WebSocket
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_connects_and_receives_snapshot() {
    let port = start_test_server(true).await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut client = SyncClient::<Operation>::new(Uuid::new_v4(), Uuid::new_v4(), &url);
    let mut rx = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    assert_eq!(rx.recv().await, Some(SyncEvent::Connected));
    let synced = wait_for(&mut rx, |e| matches!(e, SyncEvent::Synced { .. })).await;
    assert_eq!(synced, SyncEvent::Synced { revision: 0 });
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    assert_eq!(client.content().await.as_deref(), Some(""));
}

#[tokio::test]
async fn test_two_clients_converge() {
    let port = start_test_server(true).await;
    let url = format!("ws://127.0.0.1:{port}");
    let doc_id = Uuid::new_v4();

    let (alice, _alice_rx) = connected_client(&url, doc_id, 1).await;
    let (bob, mut bob_rx) = connected_client(&url, doc_id, 2).await;

    alice.edit("hello").await.unwrap();
    wait_for(&mut bob_rx, |e| matches!(e, SyncEvent::RemoteOperation { .. })).await;
    assert_eq!(converged(&[&alice, &bob]).await, ("hello".to_string(), 1));

    // Concurrent edits at both ends of the document.
    alice.apply_local(Operation::insert(5, " world!")).await.unwrap();
    bob.apply_local(Operation::delete(0, 1)).await.unwrap();
    bob.apply_local(Operation::insert(0, "H")).await.unwrap();

    let (content, revision) = converged(&[&alice, &bob]).await;
    assert_eq!(content, "Hello world!");
    assert_eq!(revision, 4);
}

#[tokio::test]
async fn test_concurrent_typing_converges() {
    let port = start_test_server(true).await;
    let url = format!("ws://127.0.0.1:{port}");
    let doc_id = Uuid::new_v4();

    let (alice, _a) = connected_client(&url, doc_id, 1).await;
    let (bob, _b) = connected_client(&url, doc_id, 2).await;
    let (carol, _c) = connected_client(&url, doc_id, 3).await;

    for i in 0..20 {
        alice.apply_local(Operation::insert(0, "a")).await.unwrap();
        bob.apply_local(Operation::insert(0, "b")).await.unwrap();
        // Only carol deletes, so her content never shrinks underneath her.
        if i % 4 == 0 {
            let carol_len = carol.content().await.unwrap().chars().count();
            if carol_len > 1 {
                carol.apply_local(Operation::delete(carol_len / 2, 1)).await.unwrap();
            }
        }
    }

    let (content, _) = converged(&[&alice, &bob, &carol]).await;
    assert!(content.chars().all(|c| c == 'a' || c == 'b'));
}

#[tokio::test]
async fn test_ping_pong() {
    let port = start_test_server(true).await;
    let url = format!("ws://127.0.0.1:{port}");

    let (client, mut rx) = connected_client(&url, Uuid::new_v4(), 1).await;
    client.send_ping().await.unwrap();
    assert_eq!(wait_for(&mut rx, |e| *e == SyncEvent::Pong).await, SyncEvent::Pong);
}

#[tokio::test]
async fn test_unknown_document_rejected() {
    let port = start_test_server(false).await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut client = SyncClient::<Operation>::new(Uuid::new_v4(), Uuid::new_v4(), &url);
    let mut rx = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    let event = wait_for(&mut rx, |e| matches!(e, SyncEvent::ServerError(_))).await;
    match event {
        SyncEvent::ServerError(message) => assert!(message.contains("not found")),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(client.content().await.is_none());
}

#[tokio::test]
async fn test_manual_resync() {
    let port = start_test_server(true).await;
    let url = format!("ws://127.0.0.1:{port}");
    let doc_id = Uuid::new_v4();

    let (alice, mut alice_rx) = connected_client(&url, doc_id, 1).await;
    alice.edit("abc").await.unwrap();
    wait_for(&mut alice_rx, |e| matches!(e, SyncEvent::Acknowledged { .. })).await;

    alice.resync().await.unwrap();
    let synced = wait_for(&mut alice_rx, |e| matches!(e, SyncEvent::Synced { .. })).await;
    assert_eq!(synced, SyncEvent::Synced { revision: 1 });
    assert_eq!(alice.content().await.as_deref(), Some("abc"));
}

#[tokio::test]
async fn test_stale_submission_reports_resync() {
    let port = start_test_server(true).await;
    let url = format!("ws://127.0.0.1:{port}");
    let doc_id = Uuid::new_v4();
    let client_id = Uuid::new_v4();

    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (mut tx, mut rx) = ws.split();

    let join = ClientMessage::<Operation>::Join { doc_id, client_id };
    tx.send(Message::Binary(join.encode().unwrap().into())).await.unwrap();

    // Base revision 3 does not exist yet.
    let submit = ClientMessage::Submit {
        doc_id,
        submission: Submission {
            op: Operation::insert(0, "x"),
            client_id,
            base_revision: 3,
        },
    };
    tx.send(Message::Binary(submit.encode().unwrap().into())).await.unwrap();

    let mut saw_snapshot = false;
    let reply = timeout(Duration::from_secs(5), async {
        while let Some(Ok(msg)) = rx.next().await {
            let Message::Binary(data) = msg else { continue };
            match ServerMessage::<Operation>::decode(&data).unwrap() {
                ServerMessage::Snapshot { .. } => saw_snapshot = true,
                error @ ServerMessage::OperationError { .. } => return Some(error),
                _ => {}
            }
        }
        None
    })
    .await
    .unwrap();

    assert!(saw_snapshot);
    match reply {
        Some(ServerMessage::OperationError { resync, .. }) => assert!(resync),
        other => panic!("unexpected reply: {other:?}"),
    }
}

#[tokio::test]
async fn test_disconnect_notifies_peers() {
    let port = start_test_server(true).await;
    let url = format!("ws://127.0.0.1:{port}");
    let doc_id = Uuid::new_v4();

    let (_alice, mut alice_rx) = connected_client(&url, doc_id, 1).await;
    let (mut bob, _bob_rx) = connected_client(&url, doc_id, 2).await;

    let joined = wait_for(&mut alice_rx, |e| matches!(e, SyncEvent::PeerJoined(_))).await;
    assert_eq!(joined, SyncEvent::PeerJoined(Uuid::from_u128(2)));

    bob.disconnect().await.unwrap();
    let left = wait_for(&mut alice_rx, |e| matches!(e, SyncEvent::PeerLeft(_))).await;
    assert_eq!(left, SyncEvent::PeerLeft(Uuid::from_u128(2)));
    assert_eq!(bob.connection_state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_reconnect_replaces_previous_connection() {
    let port = start_test_server(true).await;
    let url = format!("ws://127.0.0.1:{port}");
    let doc_id = Uuid::new_v4();

    let (mut alice, mut rx) = connected_client(&url, doc_id, 1).await;
    alice.reconnect().await.unwrap();
    wait_for(&mut rx, |e| matches!(e, SyncEvent::Synced { .. })).await;

    alice.apply_local(Operation::insert(0, "abc")).await.unwrap();
    wait_for(&mut rx, |e| matches!(e, SyncEvent::Acknowledged { .. })).await;

    // The old connection must not fold a second ack into the replica.
    let mut late = Vec::new();
    while let Ok(Some(event)) = timeout(Duration::from_millis(300), rx.recv()).await {
        late.push(event);
    }
    assert!(
        late.iter().all(|e| !matches!(
            e,
            SyncEvent::Acknowledged { .. } | SyncEvent::Resyncing { .. } | SyncEvent::Disconnected
        )),
        "unexpected events after reconnect: {late:?}"
    );
    assert_eq!(alice.connection_state().await, ConnectionState::Connected);
    assert_eq!(converged(&[&alice]).await, ("abc".to_string(), 1));
}
