//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real sessions, verifying the
//! full join / submit / transform / broadcast pipeline.

use cowrite_collab::client::{ClientEvent, ConnectionState, SyncClient};
use cowrite_collab::ot::{Edit, Operation};
use cowrite_collab::protocol::{MessageType, WireMessage};
use cowrite_collab::server::{ServerConfig, SyncServer};

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return the port.
async fn start_test_server(config: ServerConfig) -> u16 {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..config
    };
    let server = SyncServer::new(config).unwrap();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

async fn start_default_server() -> u16 {
    start_test_server(ServerConfig::default()).await
}

fn text_insert(offset: usize, text: &str) -> Operation {
    Operation::single(Edit::InsertText {
        path: vec![],
        offset,
        text: text.into(),
    })
}

/// A raw protocol-level session for precise frame control.
struct TestPeer {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    session_id: Uuid,
}

impl TestPeer {
    async fn connect(port: u16) -> Self {
        let url = format!("ws://127.0.0.1:{port}");
        let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        Self {
            ws,
            session_id: Uuid::new_v4(),
        }
    }

    async fn send(&mut self, msg: WireMessage) {
        self.ws
            .send(Message::Binary(msg.encode().unwrap().into()))
            .await
            .unwrap();
    }

    /// Next decoded protocol message, failing after two seconds.
    async fn recv(&mut self) -> WireMessage {
        let deadline = Duration::from_secs(2);
        loop {
            let frame = timeout(deadline, self.ws.next())
                .await
                .expect("timed out waiting for server message")
                .expect("connection closed")
                .unwrap();
            if let Message::Binary(data) = frame {
                return WireMessage::decode(&data).unwrap();
            }
        }
    }

    /// Assert no protocol message arrives within the window.
    async fn expect_silence(&mut self, window: Duration) {
        if let Ok(Some(Ok(Message::Binary(data)))) = timeout(window, self.ws.next()).await {
            let msg = WireMessage::decode(&data).unwrap();
            panic!("expected silence, got {:?}", msg.msg_type);
        }
    }

    /// Join a document and return (content, version) from the Loaded reply.
    async fn join(&mut self, doc_id: &str) -> (serde_json::Value, u64) {
        self.send(WireMessage::join(self.session_id, doc_id)).await;
        let loaded = self.recv().await;
        assert_eq!(loaded.msg_type, MessageType::Loaded);
        (loaded.content().unwrap(), loaded.version)
    }

    async fn submit(&mut self, doc_id: &str, op: &Operation, base_version: u64) {
        self.send(WireMessage::submit(self.session_id, doc_id, op, base_version).unwrap())
            .await;
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let port = start_default_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "should connect to server");
}

#[tokio::test]
async fn test_join_unknown_document_loads_fresh() {
    let port = start_default_server().await;
    let mut peer = TestPeer::connect(port).await;

    // Client-generated ids: unknown means new, not an error.
    let (content, version) = peer.join("fresh-doc").await;
    assert_eq!(content, json!(""));
    assert_eq!(version, 0);
}

#[tokio::test]
async fn test_first_edit_acked_at_version_one() {
    let port = start_default_server().await;
    let mut peer = TestPeer::connect(port).await;

    peer.join("doc-1").await;

    let op = Operation::set_content(json!(""), json!("hello"));
    peer.submit("doc-1", &op, 0).await;

    let ack = peer.recv().await;
    assert_eq!(ack.msg_type, MessageType::Ack);
    assert_eq!(ack.version, 1);
    assert_eq!(ack.operation().unwrap(), op);

    // A later joiner sees the committed state.
    let mut other = TestPeer::connect(port).await;
    let (content, version) = other.join("doc-1").await;
    assert_eq!(content, json!("hello"));
    assert_eq!(version, 1);
}

#[tokio::test]
async fn test_stale_submission_transformed_and_broadcast() {
    let port = start_default_server().await;
    let doc = "doc-stale";

    // Seed the document so text offsets exist.
    let mut seeder = TestPeer::connect(port).await;
    seeder.join(doc).await;
    seeder
        .submit(doc, &Operation::set_content(json!(""), json!("hello")), 0)
        .await;
    assert_eq!(seeder.recv().await.msg_type, MessageType::Ack);

    // Both sessions load version 1.
    let mut a = TestPeer::connect(port).await;
    let mut b = TestPeer::connect(port).await;
    assert_eq!(a.join(doc).await.1, 1);
    assert_eq!(b.join(doc).await.1, 1);

    // A commits first.
    a.submit(doc, &text_insert(0, ">> "), 1).await;
    let ack_a = a.recv().await;
    assert_eq!(ack_a.msg_type, MessageType::Ack);
    assert_eq!(ack_a.version, 2);

    // B still submits against version 1: the server transforms it.
    b.submit(doc, &text_insert(5, "!"), 1).await;
    loop {
        let msg = b.recv().await;
        match msg.msg_type {
            // B also receives A's edit as a remote operation.
            MessageType::RemoteOp => {
                assert_eq!(msg.version, 1);
                continue;
            }
            MessageType::Ack => {
                assert_eq!(msg.version, 3);
                // The ack carries the transformed operation, shifted past ">> ".
                assert_eq!(msg.operation().unwrap(), text_insert(8, "!"));
                break;
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    // A receives the *transformed* operation, tagged with the version
    // the document had before it applied.
    let remote = a.recv().await;
    assert_eq!(remote.msg_type, MessageType::RemoteOp);
    assert_eq!(remote.version, 2);
    assert_eq!(remote.operation().unwrap(), text_insert(8, "!"));

    // Everyone converges on the same content.
    let mut reader = TestPeer::connect(port).await;
    let (content, version) = reader.join(doc).await;
    assert_eq!(content, json!(">> hello!"));
    assert_eq!(version, 3);
}

#[tokio::test]
async fn test_future_base_version_demands_resync() {
    let port = start_default_server().await;
    let doc = "doc-future";

    let mut peer = TestPeer::connect(port).await;
    let mut witness = TestPeer::connect(port).await;
    peer.join(doc).await;
    witness.join(doc).await;

    // Claiming version 10 while the server sits at 0 is impossible.
    peer.submit(doc, &text_insert(0, "x"), 10).await;
    let reply = peer.recv().await;
    assert_eq!(reply.msg_type, MessageType::ResyncRequired);

    // Nothing was applied and nothing reached the rest of the room.
    witness.expect_silence(Duration::from_millis(200)).await;
    let mut reader = TestPeer::connect(port).await;
    assert_eq!(reader.join(doc).await.1, 0);

    // The instructed recovery is a plain re-join.
    let (content, version) = peer.join(doc).await;
    assert_eq!(content, json!(""));
    assert_eq!(version, 0);
}

#[tokio::test]
async fn test_invalid_operation_rejected_without_side_effects() {
    let port = start_default_server().await;
    let doc = "doc-invalid";

    let mut peer = TestPeer::connect(port).await;
    let mut witness = TestPeer::connect(port).await;
    peer.join(doc).await;
    witness.join(doc).await;

    // Deleting text that does not match the (empty) document.
    let bad = Operation::single(Edit::DeleteText {
        path: vec![],
        offset: 0,
        text: "nope".into(),
    });
    peer.submit(doc, &bad, 0).await;

    let reply = peer.recv().await;
    assert_eq!(reply.msg_type, MessageType::Rejected);
    assert!(reply.reason().unwrap().contains("malformed operation"));

    witness.expect_silence(Duration::from_millis(200)).await;

    // Document untouched: the same base version still works.
    peer.submit(doc, &text_insert(0, "ok"), 0).await;
    let ack = peer.recv().await;
    assert_eq!(ack.msg_type, MessageType::Ack);
    assert_eq!(ack.version, 1);
}

#[tokio::test]
async fn test_cross_document_independence() {
    let port = start_default_server().await;

    let mut a = TestPeer::connect(port).await;
    let mut b = TestPeer::connect(port).await;
    a.join("doc-x").await;
    b.join("doc-y").await;

    a.submit("doc-x", &text_insert(0, "x"), 0).await;
    b.submit("doc-y", &text_insert(0, "y"), 0).await;

    // Each document keeps its own version counter.
    assert_eq!(a.recv().await.version, 1);
    assert_eq!(b.recv().await.version, 1);

    // No cross-room traffic.
    a.expect_silence(Duration::from_millis(200)).await;
    b.expect_silence(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_submit_before_join_is_ignored() {
    let port = start_default_server().await;
    let mut peer = TestPeer::connect(port).await;

    peer.submit("doc-1", &text_insert(0, "x"), 0).await;
    peer.expect_silence(Duration::from_millis(200)).await;

    // The connection survives and can still join.
    let (_, version) = peer.join("doc-1").await;
    assert_eq!(version, 0);
}

#[tokio::test]
async fn test_disconnect_leaves_document_intact() {
    let port = start_default_server().await;
    let doc = "doc-leave";

    {
        let mut peer = TestPeer::connect(port).await;
        peer.join(doc).await;
        peer.submit(doc, &Operation::set_content(json!(""), json!("kept")), 0)
            .await;
        assert_eq!(peer.recv().await.msg_type, MessageType::Ack);
        // Dropped here: the socket closes.
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut later = TestPeer::connect(port).await;
    let (content, version) = later.join(doc).await;
    assert_eq!(content, json!("kept"));
    assert_eq!(version, 1);
}

#[tokio::test]
async fn test_allowed_origin_enforced() {
    let port = start_test_server(ServerConfig {
        allowed_origin: Some("http://localhost:3000".to_string()),
        ..ServerConfig::default()
    })
    .await;
    let url = format!("ws://127.0.0.1:{port}");

    // No Origin header: refused during the handshake.
    assert!(tokio_tungstenite::connect_async(&url).await.is_err());

    // Matching Origin: accepted.
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    let mut request = url.into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", "http://localhost:3000".parse().unwrap());
    assert!(tokio_tungstenite::connect_async(request).await.is_ok());
}

#[tokio::test]
async fn test_protocol_ping_pong() {
    let port = start_default_server().await;
    let mut peer = TestPeer::connect(port).await;
    peer.join("doc-1").await;

    peer.send(WireMessage::ping(peer.session_id)).await;
    let pong = peer.recv().await;
    assert_eq!(pong.msg_type, MessageType::Pong);
}

#[tokio::test]
async fn test_sync_client_end_to_end() {
    let port = start_default_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let doc = "doc-client";

    let mut alice = SyncClient::new(doc, &url);
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    assert_eq!(alice.connection_state().await, ConnectionState::Connected);

    // Wait for Alice's load.
    wait_for(&mut alice_events, |e| matches!(e, ClientEvent::Loaded { .. })).await;

    let mut bob = SyncClient::new(doc, &url);
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, ClientEvent::Loaded { .. })).await;

    // Alice edits; the ack confirms and Bob receives the remote operation.
    alice
        .submit_edit(Operation::set_content(json!(""), json!("shared text")))
        .await
        .unwrap();
    wait_for(&mut alice_events, |e| matches!(e, ClientEvent::Acked { .. })).await;
    wait_for(&mut bob_events, |e| {
        matches!(e, ClientEvent::RemoteOperation { .. })
    })
    .await;

    assert_eq!(alice.content().await, json!("shared text"));
    assert_eq!(bob.content().await, json!("shared text"));
    assert_eq!(alice.version().await, 1);
    assert_eq!(bob.version().await, 1);
}

#[tokio::test]
async fn test_sync_client_sequential_edits() {
    let port = start_default_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut client = SyncClient::new("doc-seq", &url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, ClientEvent::Loaded { .. })).await;

    client
        .submit_edit(Operation::set_content(json!(""), json!("")))
        .await
        .unwrap();
    wait_for(&mut events, |e| matches!(e, ClientEvent::Acked { .. })).await;

    for (i, ch) in ["a", "b", "c"].iter().enumerate() {
        client.submit_edit(text_insert(i, ch)).await.unwrap();
        wait_for(&mut events, |e| matches!(e, ClientEvent::Acked { .. })).await;
    }

    assert_eq!(client.content().await, json!("abc"));
    assert_eq!(client.version().await, 4);
}

/// Pump a client's event stream until a matching event arrives.
async fn wait_for(
    events: &mut tokio::sync::mpsc::Receiver<ClientEvent>,
    mut pred: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    let deadline = Duration::from_secs(2);
    loop {
        let event = timeout(deadline, events.recv())
            .await
            .expect("timed out waiting for client event")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

#[tokio::test]
async fn test_concurrent_sessions_converge() {
    // Many sessions hammer one document from the same base; every ack and
    // broadcast taken together must leave all of them with identical content.
    let port = start_default_server().await;
    let doc = "doc-converge";

    let mut seeder = TestPeer::connect(port).await;
    seeder.join(doc).await;
    seeder
        .submit(doc, &Operation::set_content(json!(""), json!("....")), 0)
        .await;
    assert_eq!(seeder.recv().await.msg_type, MessageType::Ack);

    let mut peers = Vec::new();
    for _ in 0..4 {
        let mut peer = TestPeer::connect(port).await;
        assert_eq!(peer.join(doc).await.1, 1);
        peers.push(peer);
    }

    // All four submit at the same base version concurrently.
    let mut handles = Vec::new();
    for (i, mut peer) in peers.into_iter().enumerate() {
        let doc = doc.to_string();
        handles.push(tokio::spawn(async move {
            peer.submit(&doc, &text_insert(i, &format!("{i}")), 1).await;
            // Drain until our ack arrives.
            loop {
                let msg = peer.recv().await;
                if msg.msg_type == MessageType::Ack {
                    return msg.version;
                }
            }
        }));
    }
    let mut versions = Vec::new();
    for handle in handles {
        versions.push(handle.await.unwrap());
    }
    versions.sort();
    // One version per applied operation, strictly advancing.
    assert_eq!(versions, vec![2, 3, 4, 5]);

    // Fresh join observes the converged document.
    let mut reader = TestPeer::connect(port).await;
    let (content, version) = reader.join(doc).await;
    assert_eq!(version, 5);
    let text = content.as_str().unwrap();
    assert_eq!(text.len(), 8);
    for ch in ["0", "1", "2", "3"] {
        assert!(text.contains(ch), "missing {ch} in {text}");
    }
}
