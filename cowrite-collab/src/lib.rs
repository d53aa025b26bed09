//! # cowrite-collab — Real-time collaborative document synchronization
//!
//! One logical mutable document per id, many concurrent editing sessions.
//! Submissions carry the version they were authored against; the server
//! transforms stale submissions over the history they missed, applies them in
//! a globally consistent order, and fans the result out to every other
//! session in the document's room.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │    Binary Proto     │ (gateway)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ local mirror│                     │  Registry   │── per-id apply lock
//! │ + offline Q │                     │  (cache)    │── idle eviction
//! └─────────────┘                     └──────┬──────┘
//!                                            │ write-behind + retry
//!                                            ▼
//!                                     ┌─────────────┐
//!                                     │DocumentStore│ (RocksDB / memory)
//!                                     └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`ot`] — path-addressed edit operations: apply, transform, compose
//! - [`protocol`] — binary wire protocol (bincode envelope, JSON payloads)
//! - [`engine`] — version reconciliation against retained history
//! - [`registry`] — per-document canonical state, caching, persistence
//! - [`broadcast`] — room fan-out with backpressure
//! - [`server`] — WebSocket session/room gateway
//! - [`client`] — sync client with optimistic local mirror and offline queue
//! - [`storage`] — durable key-value document store

pub mod ot;
pub mod protocol;
pub mod engine;
pub mod registry;
pub mod broadcast;
pub mod server;
pub mod client;
pub mod storage;

// Re-exports for convenience
pub use ot::{apply, transform, Edit, Operation, OtError, Path, PathSegment, Side};
pub use protocol::{MessageType, ProtocolError, WireMessage};
pub use engine::{Applied, DocState, HistoryEntry, Rejected, SessionId};
pub use registry::{DocEntry, Registry, RegistryConfig};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ClientError, ClientEvent, ConnectionState, OfflineQueue, SyncClient};
pub use storage::{
    DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError, StoredDocument,
};
