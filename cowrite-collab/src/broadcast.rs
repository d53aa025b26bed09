//! Fan-out broadcast to the other members of a document room.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Each
//! session gets an independent receiver that buffers up to `capacity`
//! messages; lagging receivers drop messages rather than stalling peers.
//!
//! Broadcast happens after the per-document apply region is released, so a
//! slow subscriber never blocks other editors' submissions.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, WireMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_sessions: usize,
}

/// A broadcast group for a single document room.
///
/// All sessions viewing the same document share one channel. The sender's
/// own message is filtered out on the receiving side by session id.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,

    /// Sessions currently subscribed to this room
    sessions: RwLock<HashSet<Uuid>>,

    /// Channel capacity (messages buffered per receiver)
    capacity: usize,

    /// Lock-free send counter
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sessions: RwLock::new(HashSet::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Add a session to this room. Returns its receiver.
    pub async fn add_session(&self, session_id: Uuid) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session_id);
        self.sender.subscribe()
    }

    /// Remove a session from this room.
    pub async fn remove_session(&self, session_id: &Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session_id)
    }

    /// Broadcast a message to every receiver in the room.
    ///
    /// Returns the number of receivers that got the message. Stats are
    /// tracked via atomics — no lock on the hot path.
    pub fn broadcast(&self, msg: &WireMessage) -> Result<usize, ProtocolError> {
        let encoded = Arc::new(msg.encode()?);
        let count = self.sender.send(encoded).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(count)
    }

    /// Get the current session count.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Check if a session is subscribed.
    pub async fn has_session(&self, session_id: &Uuid) -> bool {
        self.sessions.read().await.contains(session_id)
    }

    /// Get broadcast statistics.
    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_sessions: self.sessions.read().await.len(),
        }
    }

    /// Get the channel capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Subscribe without room membership (raw receiver).
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}
