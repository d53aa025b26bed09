//! WebSocket gateway: maps transport sessions onto document rooms.
//!
//! Architecture:
//! ```text
//! Session A ──┐
//!             ├── Room (doc_id) ── DocEntry ── per-id apply lock
//! Session B ──┘        │               │
//!                      │               ├── Registry (cache + eviction)
//!                      │               │        │
//!                      │               │        └── DocumentStore (RocksDB)
//!                      │               │
//!                      └── BroadcastGroup ── every other session in the room
//! ```
//!
//! Each connection runs one task: a `select!` loop over its socket and its
//! room's broadcast receiver. Submissions are acknowledged to the originator
//! with the transformed operation and new version; everyone else in the room
//! receives the transformed operation tagged with the version it was applied
//! at. A disconnect drops only the acknowledgment — an operation that reached
//! the registry is applied and broadcast regardless.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{MessageType, WireMessage};
use crate::registry::{DocEntry, Registry, RegistryConfig};
use crate::storage::{DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Origin header required for cross-origin connections (None = any)
    pub allowed_origin: Option<String>,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Idle period before an unwatched document is evicted from memory
    pub idle_timeout: Duration,
    /// Committed operations retained per document for stale submissions
    pub max_history: usize,
    /// First persistence retry delay
    pub retry_base_delay: Duration,
    /// Persistence retry delay ceiling
    pub retry_max_delay: Duration,
    /// Failed persists before a degraded-mode warning
    pub retry_warn_ceiling: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let registry = RegistryConfig::default();
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            allowed_origin: None,
            storage_path: None,
            broadcast_capacity: registry.broadcast_capacity,
            idle_timeout: registry.idle_timeout,
            max_history: registry.max_history,
            retry_base_delay: registry.retry_base_delay,
            retry_max_delay: registry.retry_max_delay,
            retry_warn_ceiling: registry.retry_warn_ceiling,
        }
    }
}

impl ServerConfig {
    fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            broadcast_capacity: self.broadcast_capacity,
            idle_timeout: self.idle_timeout,
            max_history: self.max_history,
            retry_base_delay: self.retry_base_delay,
            retry_max_delay: self.retry_max_delay,
            retry_warn_ceiling: self.retry_warn_ceiling,
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
    pub rejected_operations: u64,
    pub active_documents: usize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<Registry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    ///
    /// Opens the document store: RocksDB when `storage_path` is set, an
    /// in-memory store otherwise.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn DocumentStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryStore::new()),
        };
        let registry = Registry::new(store, config.registry_config());
        Ok(Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Result<Self, StoreError> {
        Self::new(ServerConfig::default())
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(
        bind_addr: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    /// Count the documents recoverable from persistent storage.
    ///
    /// Content loads lazily on first join; this only reports what survived
    /// the restart.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let ids = self.registry.store().list()?;
        if !ids.is_empty() {
            log::info!("{} documents recoverable from storage", ids.len());
        }
        Ok(ids.len())
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.registry.start();
        self.recover().await?;

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, registry, stats, config).await
                {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<Registry>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = match &config.allowed_origin {
            Some(allowed) => {
                let allowed = allowed.clone();
                tokio_tungstenite::accept_hdr_async(
                    stream,
                    move |req: &Request, resp: Response| {
                        let origin_ok = req
                            .headers()
                            .get("origin")
                            .and_then(|v| v.to_str().ok())
                            .map(|origin| origin == allowed)
                            .unwrap_or(false);
                        if origin_ok {
                            Ok(resp)
                        } else {
                            let mut deny =
                                ErrorResponse::new(Some("origin not allowed".to_string()));
                            *deny.status_mut() = StatusCode::FORBIDDEN;
                            Err(deny)
                        }
                    },
                )
                .await?
            }
            None => tokio_tungstenite::accept_async(stream).await?,
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // State for this connection
        let mut session_id: Option<Uuid> = None;
        let mut joined: Option<Arc<DocEntry>> = None;
        let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;
        // Arrival order within this session, for tie-breaking
        let mut seq: u64 = 0;

        // The session loop runs inside a block so that room cleanup below
        // happens on every exit path, send failures included.
        let loop_result: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            loop {
                tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let wire = match WireMessage::decode(&bytes) {
                                Ok(wire) => wire,
                                Err(e) => {
                                    log::warn!("failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };

                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            match wire.msg_type {
                                MessageType::Join => {
                                    // One room per session: leave any previous one.
                                    if let (Some(prev), Some(sid)) = (joined.take(), session_id) {
                                        registry.unsubscribe(&prev, &sid).await;
                                        broadcast_rx = None;
                                    }

                                    let sid = if wire.session_id.is_nil() {
                                        Uuid::new_v4()
                                    } else {
                                        wire.session_id
                                    };
                                    session_id = Some(sid);

                                    match registry.get_or_create(&wire.doc_id).await {
                                        Ok(entry) => {
                                            broadcast_rx =
                                                Some(registry.subscribe(&entry, sid).await);
                                            let (content, version) =
                                                registry.snapshot(&entry).await;
                                            let loaded = WireMessage::loaded(
                                                &wire.doc_id,
                                                &content,
                                                version,
                                            )?;
                                            ws_sender
                                                .send(Message::Binary(loaded.encode()?.into()))
                                                .await?;
                                            log::info!(
                                                "session {sid} joined document {} at version {version}",
                                                wire.doc_id
                                            );
                                            joined = Some(entry);

                                            let mut s = stats.write().await;
                                            s.active_documents =
                                                registry.document_count().await;
                                        }
                                        Err(e) => {
                                            log::error!(
                                                "failed to load document {}: {e}",
                                                wire.doc_id
                                            );
                                            let reply = WireMessage::rejected(
                                                sid,
                                                &wire.doc_id,
                                                format!("failed to load document: {e}"),
                                            )?;
                                            ws_sender
                                                .send(Message::Binary(reply.encode()?.into()))
                                                .await?;
                                        }
                                    }
                                }

                                MessageType::Submit => {
                                    let (entry, sid) = match (joined.as_ref(), session_id) {
                                        (Some(entry), Some(sid)) if entry.id == wire.doc_id => {
                                            (entry, sid)
                                        }
                                        _ => {
                                            log::warn!(
                                                "submit for unjoined document {} from {addr}",
                                                wire.doc_id
                                            );
                                            continue;
                                        }
                                    };

                                    let op = match wire.operation() {
                                        Ok(op) => op,
                                        Err(e) => {
                                            let reply = WireMessage::rejected(
                                                sid,
                                                &wire.doc_id,
                                                format!("malformed operation payload: {e}"),
                                            )?;
                                            ws_sender
                                                .send(Message::Binary(reply.encode()?.into()))
                                                .await?;
                                            continue;
                                        }
                                    };

                                    seq += 1;
                                    match registry
                                        .submit(entry, op, wire.version, sid, seq)
                                        .await
                                    {
                                        Ok(applied) => {
                                            {
                                                let mut s = stats.write().await;
                                                s.applied_operations += 1;
                                            }
                                            // Fan out first: the room must converge
                                            // even when the originator's ack is lost.
                                            let remote = WireMessage::remote_op(
                                                sid,
                                                &wire.doc_id,
                                                &applied.operation,
                                                applied.new_version - 1,
                                            )?;
                                            let _ = entry.room.broadcast(&remote);

                                            let ack = WireMessage::ack(
                                                sid,
                                                &wire.doc_id,
                                                &applied.operation,
                                                applied.new_version,
                                            )?;
                                            ws_sender
                                                .send(Message::Binary(ack.encode()?.into()))
                                                .await?;
                                        }
                                        Err(rejected) if rejected.needs_resync() => {
                                            {
                                                let mut s = stats.write().await;
                                                s.rejected_operations += 1;
                                            }
                                            log::warn!(
                                                "session {sid} out of sync on {}: {rejected}",
                                                wire.doc_id
                                            );
                                            let resync =
                                                WireMessage::resync_required(&wire.doc_id);
                                            ws_sender
                                                .send(Message::Binary(resync.encode()?.into()))
                                                .await?;
                                        }
                                        Err(rejected) => {
                                            {
                                                let mut s = stats.write().await;
                                                s.rejected_operations += 1;
                                            }
                                            log::debug!(
                                                "rejected operation from {sid} on {}: {rejected}",
                                                wire.doc_id
                                            );
                                            let reply = WireMessage::rejected(
                                                sid,
                                                &wire.doc_id,
                                                rejected.to_string(),
                                            )?;
                                            ws_sender
                                                .send(Message::Binary(reply.encode()?.into()))
                                                .await?;
                                        }
                                    }
                                }

                                MessageType::Ping => {
                                    if let Some(sid) = session_id {
                                        let pong = WireMessage::pong(sid);
                                        ws_sender
                                            .send(Message::Binary(pong.encode()?.into()))
                                            .await?;
                                    }
                                }

                                _ => {
                                    log::debug!("unhandled message type: {:?}", wire.msg_type);
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection closed from {addr}");
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

                // Outgoing broadcast message
                msg = async {
                    if let Some(ref mut rx) = broadcast_rx {
                        rx.recv().await
                    } else {
                        // No room yet — wait forever
                        std::future::pending().await
                    }
                } => {
                    match msg {
                        Ok(data) => {
                            // Don't echo the session's own operations back
                            if let Ok(wire) = WireMessage::decode(&data) {
                                if Some(wire.session_id) == session_id {
                                    continue;
                                }
                            }
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("session {session_id:?} lagged by {n} messages");
                        }
                        Err(_) => break,
                    }
                }
            }
            }
            Ok(())
        }
        .await;

        // Cleanup: leave the room; document state stays cached for the
        // registry's idle eviction.
        if let (Some(sid), Some(entry)) = (session_id, joined) {
            registry.unsubscribe(&entry, &sid).await;
            log::info!("session {sid} left document {}", entry.id);
        }

        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_documents = registry.document_count().await;
        }

        loop_result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the document registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}
