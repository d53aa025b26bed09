//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, join, disconnect)
//! - A local `(content, version)` mirror with optimistic edits
//! - Ack / remote-operation handling with rejoin on divergence
//! - Offline queue: edits made while disconnected are composed into one
//!   operation and replayed after the next join
//!
//! One operation is in flight at a time; edits submitted meanwhile are
//! composed into a buffer and sent after the acknowledgment. When the server
//! had to transform the in-flight operation (a concurrent edit won the race),
//! the client re-joins and reloads authoritative state instead of guessing.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use futures_util::StreamExt;
use serde_json::Value;
use uuid::Uuid;

use crate::ot::{self, Operation, OtError};
use crate::protocol::{MessageType, ProtocolError, WireMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Full document state received after a join
    Loaded { content: Value, version: u64 },
    /// Our operation was applied (possibly transformed)
    Acked { operation: Operation, version: u64 },
    /// Another session's operation was applied
    RemoteOperation {
        operation: Operation,
        version_before: u64,
    },
    /// Our operation was refused; local state reloads via rejoin
    Rejected { reason: String },
    /// Server demanded a resynchronization
    ResyncRequired,
}

/// Client-side errors.
#[derive(Debug)]
pub enum ClientError {
    Protocol(ProtocolError),
    Operation(OtError),
    QueueFull,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Protocol(e) => write!(f, "{e}"),
            ClientError::Operation(e) => write!(f, "{e}"),
            ClientError::QueueFull => write!(f, "offline queue full"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        ClientError::Protocol(e)
    }
}

impl From<OtError> for ClientError {
    fn from(e: OtError) -> Self {
        ClientError::Operation(e)
    }
}

/// Offline queue for edits made while disconnected.
///
/// Queued operations are composed into one before replay, so a long offline
/// editing session replays as a single submission.
pub struct OfflineQueue {
    queue: VecDeque<Operation>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an operation for later replay.
    pub fn enqueue(&mut self, op: Operation) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(op);
        true
    }

    /// Drain the queue into a single composed operation.
    pub fn compose_drain(&mut self) -> Option<Operation> {
        let mut drained = self.queue.drain(..);
        let first = drained.next()?;
        Some(drained.fold(first, Operation::compose))
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// The client's view of the document.
struct LocalDocument {
    content: Value,
    version: u64,
    /// Operation awaiting acknowledgment
    in_flight: Option<Operation>,
    /// Edits composed while waiting for the ack
    buffer: Option<Operation>,
}

impl LocalDocument {
    fn reset(&mut self, content: Value, version: u64) {
        self.content = content;
        self.version = version;
        self.in_flight = None;
        self.buffer = None;
    }
}

/// The sync client.
pub struct SyncClient {
    session_id: Uuid,
    doc_id: String,
    server_url: String,

    state: Arc<RwLock<ConnectionState>>,
    doc: Arc<RwLock<LocalDocument>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<WireMessage>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl SyncClient {
    /// Create a new sync client for one document.
    pub fn new(doc_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            session_id: Uuid::new_v4(),
            doc_id: doc_id.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            doc: Arc::new(RwLock::new(LocalDocument {
                content: Value::Null,
                version: 0,
                in_flight: None,
                buffer: None,
            })),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Current local content.
    pub async fn content(&self) -> Value {
        self.doc.read().await.content.clone()
    }

    /// Current locally known version.
    pub async fn version(&self) -> u64 {
        self.doc.read().await.version
    }

    /// Number of operations waiting in the offline queue.
    pub async fn queued_edits(&self) -> usize {
        self.offline_queue.lock().await.len()
    }

    /// Connect to the server and join the document room.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                log::error!("connect to {} failed: {e}", self.server_url);
                return Err(ProtocolError::ConnectionClosed.into());
            }
        };

        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to the WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<WireMessage>(256);
        self.outgoing_tx = Some(out_tx.clone());
        tokio::spawn(async move {
            use futures_util::SinkExt;
            while let Some(msg) = out_rx.recv().await {
                let encoded = match msg.encode() {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        log::error!("failed to encode outgoing message: {e}");
                        continue;
                    }
                };
                if ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Binary(
                        encoded.into(),
                    ))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        // Join the room
        let join = WireMessage::join(self.session_id, &self.doc_id);
        let _ = out_tx.send(join).await;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Reader task: process incoming messages
        let session_id = self.session_id;
        let doc_id = self.doc_id.clone();
        let state = self.state.clone();
        let doc = self.doc.clone();
        let offline_queue = self.offline_queue.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let wire = match WireMessage::decode(&bytes) {
                            Ok(wire) => wire,
                            Err(e) => {
                                log::warn!("failed to decode server message: {e}");
                                continue;
                            }
                        };
                        handle_server_message(
                            wire,
                            session_id,
                            &doc_id,
                            &doc,
                            &offline_queue,
                            &out_tx,
                            &event_tx,
                        )
                        .await;
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => {
                        break;
                    }
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Submit a local edit.
    ///
    /// Applies it optimistically to the local mirror, then sends it against
    /// the current version — or queues it when disconnected.
    pub async fn submit_edit(&self, op: Operation) -> Result<(), ClientError> {
        let state = *self.state.read().await;
        if state != ConnectionState::Connected {
            let mut doc = self.doc.write().await;
            doc.content = ot::apply(&doc.content, &op)?;
            drop(doc);
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(op) {
                return Err(ClientError::QueueFull);
            }
            log::debug!("queued edit while disconnected ({} pending)", queue.len());
            return Ok(());
        }

        let out_tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ClientError::Protocol(ProtocolError::ConnectionClosed))?;
        submit_local(&self.doc, out_tx, self.session_id, &self.doc_id, op).await
    }

    /// Send a protocol-level heartbeat.
    pub async fn ping(&self) -> Result<(), ClientError> {
        let out_tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ClientError::Protocol(ProtocolError::ConnectionClosed))?;
        out_tx
            .send(WireMessage::ping(self.session_id))
            .await
            .map_err(|_| ClientError::Protocol(ProtocolError::ConnectionClosed))
    }
}

/// Optimistically apply an edit and put it on the wire (or into the buffer
/// when another operation is already in flight).
async fn submit_local(
    doc: &Arc<RwLock<LocalDocument>>,
    out_tx: &mpsc::Sender<WireMessage>,
    session_id: Uuid,
    doc_id: &str,
    op: Operation,
) -> Result<(), ClientError> {
    let mut doc = doc.write().await;
    doc.content = ot::apply(&doc.content, &op)?;

    if doc.in_flight.is_some() {
        doc.buffer = Some(match doc.buffer.take() {
            Some(buffered) => buffered.compose(op),
            None => op,
        });
        return Ok(());
    }

    let submit = WireMessage::submit(session_id, doc_id, &op, doc.version)?;
    doc.in_flight = Some(op);
    drop(doc);
    out_tx
        .send(submit)
        .await
        .map_err(|_| ClientError::Protocol(ProtocolError::ConnectionClosed))
}

async fn handle_server_message(
    wire: WireMessage,
    session_id: Uuid,
    doc_id: &str,
    doc: &Arc<RwLock<LocalDocument>>,
    offline_queue: &Arc<Mutex<OfflineQueue>>,
    out_tx: &mpsc::Sender<WireMessage>,
    event_tx: &mpsc::Sender<ClientEvent>,
) {
    match wire.msg_type {
        MessageType::Loaded => {
            let content = match wire.content() {
                Ok(content) => content,
                Err(e) => {
                    log::warn!("bad loaded payload: {e}");
                    return;
                }
            };
            {
                let mut doc = doc.write().await;
                doc.reset(content.clone(), wire.version);
            }
            log::info!("loaded document {doc_id} at version {}", wire.version);

            // Replay edits made while offline as one composed operation.
            let replay = offline_queue.lock().await.compose_drain();
            if let Some(op) = replay {
                log::info!("replaying offline edits for {doc_id}");
                if let Err(e) = submit_local(doc, out_tx, session_id, doc_id, op).await {
                    log::warn!("offline replay no longer applies: {e}");
                }
            }

            let _ = event_tx
                .send(ClientEvent::Loaded {
                    content,
                    version: wire.version,
                })
                .await;
        }

        MessageType::Ack => {
            let op = match wire.operation() {
                Ok(op) => op,
                Err(e) => {
                    log::warn!("bad ack payload: {e}");
                    return;
                }
            };
            let mut rejoin = false;
            let mut next: Option<WireMessage> = None;
            {
                let mut doc = doc.write().await;
                doc.version = wire.version;
                match doc.in_flight.take() {
                    // The server applied our operation unchanged: the
                    // optimistic mirror is already correct.
                    Some(sent) if sent == op => {
                        if let Some(buffered) = doc.buffer.take() {
                            match WireMessage::submit(session_id, doc_id, &buffered, doc.version)
                            {
                                Ok(msg) => {
                                    doc.in_flight = Some(buffered);
                                    next = Some(msg);
                                }
                                Err(e) => {
                                    log::error!("failed to encode buffered edit: {e}");
                                    rejoin = true;
                                }
                            }
                        }
                    }
                    // Transformed ack: a concurrent edit won; reload
                    // authoritative state rather than patching blind.
                    _ => rejoin = true,
                }
            }
            if let Some(msg) = next {
                let _ = out_tx.send(msg).await;
            }
            if rejoin {
                let _ = out_tx.send(WireMessage::join(session_id, doc_id)).await;
            }
            let _ = event_tx
                .send(ClientEvent::Acked {
                    operation: op,
                    version: wire.version,
                })
                .await;
        }

        MessageType::RemoteOp => {
            let op = match wire.operation() {
                Ok(op) => op,
                Err(e) => {
                    log::warn!("bad remote operation payload: {e}");
                    return;
                }
            };
            let mut rejoin = false;
            {
                let mut doc = doc.write().await;
                let clean = doc.in_flight.is_none() && doc.buffer.is_none();
                if clean && doc.version == wire.version {
                    match ot::apply(&doc.content, &op) {
                        Ok(content) => {
                            doc.content = content;
                            doc.version += 1;
                        }
                        Err(e) => {
                            log::warn!("remote operation does not apply locally: {e}");
                            rejoin = true;
                        }
                    }
                } else {
                    // Either we have optimistic local edits or we missed a
                    // version: reload instead of diverging.
                    rejoin = true;
                }
                if rejoin {
                    doc.in_flight = None;
                    doc.buffer = None;
                }
            }
            if rejoin {
                let _ = out_tx.send(WireMessage::join(session_id, doc_id)).await;
            }
            let _ = event_tx
                .send(ClientEvent::RemoteOperation {
                    operation: op,
                    version_before: wire.version,
                })
                .await;
        }

        MessageType::Rejected => {
            let reason = wire.reason().unwrap_or_else(|_| "unknown".to_string());
            log::warn!("operation rejected for {doc_id}: {reason}");
            // The optimistic mirror holds a refused edit; reload.
            {
                let mut doc = doc.write().await;
                doc.in_flight = None;
                doc.buffer = None;
            }
            let _ = out_tx.send(WireMessage::join(session_id, doc_id)).await;
            let _ = event_tx.send(ClientEvent::Rejected { reason }).await;
        }

        MessageType::ResyncRequired => {
            log::warn!("server demanded resync for {doc_id}");
            {
                let mut doc = doc.write().await;
                doc.in_flight = None;
                doc.buffer = None;
            }
            let _ = out_tx.send(WireMessage::join(session_id, doc_id)).await;
            let _ = event_tx.send(ClientEvent::ResyncRequired).await;
        }

        MessageType::Pong => {}

        other => {
            log::debug!("unexpected server message type: {other:?}");
        }
    }
}
