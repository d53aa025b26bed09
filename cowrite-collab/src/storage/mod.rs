//! Durable key-value storage for document content.
//!
//! The registry is a cache over this layer: it loads on first join, persists
//! write-behind after every apply, and evicts idle entries — the store is the
//! durable owner of content and version across process restarts.
//!
//! ```text
//! ┌─────────────┐   load / create / persist   ┌──────────────┐
//! │  Registry   │ ──────────────────────────► │ DocumentStore│
//! │ (in-memory) │                             │  (trait)     │
//! └─────────────┘                             └──────┬───────┘
//!                                       ┌────────────┴──────────┐
//!                                       ▼                       ▼
//!                                 RocksStore              MemoryStore
//!                                 (durable, LZ4)          (tests, no-disk)
//! ```
//!
//! Store failures are never fatal to live editing: the registry keeps
//! applying and broadcasting from memory and retries persistence.

pub mod rocks;

pub use rocks::{RocksStore, StoreConfig};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use serde_json::Value;

/// A document as the store sees it: content plus the version counter that
/// stamps how many operations have ever been applied to it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub content: Value,
    pub version: u64,
}

impl StoredDocument {
    /// A brand-new document: empty text at version zero.
    pub fn fresh(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: Value::String(String::new()),
            version: 0,
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend failure (I/O, database, injected fault)
    Database(String),
    /// Document not found
    NotFound(String),
    /// Serialization failed
    Serialization(String),
    /// Compression failed
    Compression(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
            StoreError::Serialization(e) => write!(f, "Serialization error: {e}"),
            StoreError::Compression(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable document storage.
///
/// Calls are synchronous and fast (point reads/writes); the registry keeps
/// them off the per-document apply path.
pub trait DocumentStore: Send + Sync {
    /// Load a document by id. `StoreError::NotFound` when absent.
    fn load(&self, id: &str) -> Result<StoredDocument, StoreError>;

    /// Create a document. Idempotent: an existing document is returned
    /// unchanged rather than overwritten.
    fn create(&self, id: &str) -> Result<StoredDocument, StoreError>;

    /// Persist content and version for a document id.
    fn persist(&self, id: &str, content: &Value, version: u64) -> Result<(), StoreError>;

    /// List all document ids present in the store.
    fn list(&self) -> Result<Vec<String>, StoreError>;
}

/// In-memory store for tests and storage-less deployments.
///
/// `fail_persists` injects persistence faults so degraded-mode behavior is
/// testable end to end.
#[derive(Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<String, StoredDocument>>,
    fail_persists: AtomicBool,
    persist_count: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `persist` calls fail (or succeed again).
    pub fn fail_persists(&self, fail: bool) {
        self.fail_persists.store(fail, Ordering::SeqCst);
    }

    /// Number of successful persists observed.
    pub fn persist_count(&self) -> u64 {
        self.persist_count.load(Ordering::SeqCst)
    }
}

impl DocumentStore for MemoryStore {
    fn load(&self, id: &str) -> Result<StoredDocument, StoreError> {
        let documents = self
            .documents
            .read()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        documents
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn create(&self, id: &str) -> Result<StoredDocument, StoreError> {
        let mut documents = self
            .documents
            .write()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(documents
            .entry(id.to_string())
            .or_insert_with(|| StoredDocument::fresh(id))
            .clone())
    }

    fn persist(&self, id: &str, content: &Value, version: u64) -> Result<(), StoreError> {
        if self.fail_persists.load(Ordering::SeqCst) {
            return Err(StoreError::Database("injected persistence fault".into()));
        }
        let mut documents = self
            .documents
            .write()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        documents.insert(
            id.to_string(),
            StoredDocument {
                id: id.to_string(),
                content: content.clone(),
                version,
            },
        );
        self.persist_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let documents = self
            .documents
            .read()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(documents.keys().cloned().collect())
    }
}
