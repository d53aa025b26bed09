//! Document registry: the single point of truth for live document state.
//!
//! Each document id maps to one cached entry holding its canonical
//! [`DocState`] behind a per-entry mutex — the exclusive-execution region
//! that guarantees at most one in-flight apply per document, while documents
//! with different ids proceed fully in parallel.
//!
//! The registry is a cache over the injected [`DocumentStore`]: entries load
//! on first access (a write-locked double-check suppresses duplicate
//! concurrent loads), persist write-behind after every apply, and are evicted
//! after an idle period with no subscribers. A dirty or still-persisting
//! entry is never evicted, so a store outage cannot lose committed edits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::broadcast::BroadcastGroup;
use crate::engine::{Applied, DocState, Rejected, SessionId};
use crate::ot::Operation;
use crate::storage::{DocumentStore, StoreError};

/// Registry tuning knobs.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Broadcast channel capacity per document room
    pub broadcast_capacity: usize,
    /// Idle period with zero subscribers before an entry is evicted
    pub idle_timeout: Duration,
    /// Committed operations retained per document for transforming stale bases
    pub max_history: usize,
    /// First persistence retry delay (doubles per attempt)
    pub retry_base_delay: Duration,
    /// Retry delay ceiling
    pub retry_max_delay: Duration,
    /// Consecutive failures before a degraded-mode warning
    pub retry_warn_ceiling: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            idle_timeout: Duration::from_secs(300),
            max_history: 1024,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(30),
            retry_warn_ceiling: 8,
        }
    }
}

/// One cached document: canonical state, room membership, persistence flags.
pub struct DocEntry {
    pub id: String,
    state: Mutex<DocState>,
    /// Fan-out channel for this document's room
    pub room: BroadcastGroup,
    /// Set when in-memory state is ahead of the store
    dirty: AtomicBool,
    /// Set while a persister task owns this entry
    persist_queued: AtomicBool,
    /// Consecutive failed persist attempts
    failures: AtomicU32,
    /// When the room last became empty (None while subscribed)
    empty_since: Mutex<Option<Instant>>,
}

impl DocEntry {
    /// Whether in-memory state has not yet reached the store.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst) || self.persist_queued.load(Ordering::SeqCst)
    }
}

/// The registry itself. Create with [`Registry::new`], then [`Registry::start`]
/// to launch the persister and eviction sweeper.
pub struct Registry {
    entries: RwLock<HashMap<String, Arc<DocEntry>>>,
    store: Arc<dyn DocumentStore>,
    config: RegistryConfig,
    persist_tx: mpsc::UnboundedSender<Arc<DocEntry>>,
    persist_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Arc<DocEntry>>>>,
}

impl Registry {
    pub fn new(store: Arc<dyn DocumentStore>, config: RegistryConfig) -> Arc<Self> {
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            store,
            config,
            persist_tx,
            persist_rx: std::sync::Mutex::new(Some(persist_rx)),
        })
    }

    /// Launch the write-behind persister and the eviction sweeper.
    pub fn start(self: &Arc<Self>) {
        let rx = self
            .persist_rx
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(rx) = rx {
            let registry = self.clone();
            tokio::spawn(registry.run_persister(rx));
        }
        let registry = self.clone();
        tokio::spawn(async move {
            registry.run_sweeper().await;
        });
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Get the cached entry for `id`, loading (or creating) it from the
    /// store on a miss. Concurrent calls for the same missing id resolve to
    /// the same entry: the write lock serializes the load and the
    /// double-check keeps it from running twice.
    pub async fn get_or_create(&self, id: &str) -> Result<Arc<DocEntry>, StoreError> {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(id) {
                return Ok(entry.clone());
            }
        }

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(id) {
            return Ok(entry.clone());
        }

        let stored = match self.store.load(id) {
            Ok(doc) => doc,
            // Document ids are client-generated: an unknown id means a new
            // document, not an error. `create` is idempotent as a safety net.
            Err(StoreError::NotFound(_)) => {
                log::info!("creating document {id}");
                self.store.create(id)?
            }
            Err(e) => return Err(e),
        };
        log::info!("loaded document {id} at version {}", stored.version);

        let entry = Arc::new(DocEntry {
            id: id.to_string(),
            state: Mutex::new(DocState::new(
                id,
                stored.content,
                stored.version,
                self.config.max_history,
            )),
            room: BroadcastGroup::new(self.config.broadcast_capacity),
            dirty: AtomicBool::new(false),
            persist_queued: AtomicBool::new(false),
            failures: AtomicU32::new(0),
            empty_since: Mutex::new(Some(Instant::now())),
        });
        entries.insert(id.to_string(), entry.clone());
        Ok(entry)
    }

    /// Reconcile and apply one submission under the entry's apply lock, then
    /// schedule write-behind persistence. The lock covers only the in-memory
    /// transform/apply; persistence and broadcast happen after release.
    pub async fn submit(
        &self,
        entry: &Arc<DocEntry>,
        op: Operation,
        base_version: u64,
        author: SessionId,
        seq: u64,
    ) -> Result<Applied, Rejected> {
        let applied = {
            let mut state = entry.state.lock().await;
            state.reconcile(op, base_version, author, seq)?
        };
        self.schedule_persist(entry);
        Ok(applied)
    }

    /// Current content and version, for `Loaded` replies.
    pub async fn snapshot(&self, entry: &Arc<DocEntry>) -> (Value, u64) {
        let state = entry.state.lock().await;
        (state.content().clone(), state.version())
    }

    /// Add a session to the document's room.
    pub async fn subscribe(
        &self,
        entry: &Arc<DocEntry>,
        session_id: Uuid,
    ) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let rx = entry.room.add_session(session_id).await;
        *entry.empty_since.lock().await = None;
        rx
    }

    /// Remove a session; an emptied room starts its idle clock.
    pub async fn unsubscribe(&self, entry: &Arc<DocEntry>, session_id: &Uuid) {
        entry.room.remove_session(session_id).await;
        if entry.room.session_count().await == 0 {
            *entry.empty_since.lock().await = Some(Instant::now());
        }
    }

    /// Number of cached documents.
    pub async fn document_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// One eviction pass: compact history of empty rooms, then drop entries
    /// idle past the timeout with nothing left to persist. Returns the number
    /// evicted. Runs periodically via [`Registry::start`].
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut candidates = Vec::new();
        {
            let entries = self.entries.read().await;
            for (id, entry) in entries.iter() {
                if entry.room.session_count().await > 0 {
                    continue;
                }
                // No subscriber can still submit against old history.
                {
                    let mut state = entry.state.lock().await;
                    let version = state.version();
                    state.compact(version);
                }
                let idle = {
                    let empty_since = entry.empty_since.lock().await;
                    empty_since
                        .map(|since| now.duration_since(since) >= self.config.idle_timeout)
                        .unwrap_or(false)
                };
                if idle && !entry.is_dirty() {
                    candidates.push(id.clone());
                }
            }
        }
        if candidates.is_empty() {
            return 0;
        }

        let mut entries = self.entries.write().await;
        let mut evicted = 0;
        for id in candidates {
            let removable = match entries.get(&id) {
                Some(entry) => {
                    entry.room.session_count().await == 0 && !entry.is_dirty()
                }
                None => false,
            };
            if removable {
                entries.remove(&id);
                evicted += 1;
                log::info!("evicted idle document {id}");
            }
        }
        evicted
    }

    fn schedule_persist(&self, entry: &Arc<DocEntry>) {
        entry.dirty.store(true, Ordering::SeqCst);
        if !entry.persist_queued.swap(true, Ordering::SeqCst) {
            let _ = self.persist_tx.send(entry.clone());
        }
    }

    async fn run_persister(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Arc<DocEntry>>) {
        // One task per entry so a document stuck in retries never delays
        // persistence of the others.
        while let Some(entry) = rx.recv().await {
            let registry = self.clone();
            tokio::spawn(async move {
                registry.persist_entry(&entry).await;
            });
        }
    }

    /// Persist an entry until the store accepts it: bounded exponential
    /// backoff, at-least-once. Past the warn ceiling the document is reported
    /// degraded but keeps serving edits from memory and keeps retrying.
    async fn persist_entry(&self, entry: &Arc<DocEntry>) {
        let mut delay = self.config.retry_base_delay;
        loop {
            entry.dirty.store(false, Ordering::SeqCst);
            let (content, version) = {
                let state = entry.state.lock().await;
                (state.content().clone(), state.version())
            };
            match self.store.persist(&entry.id, &content, version) {
                Ok(()) => {
                    if entry.failures.swap(0, Ordering::SeqCst) > 0 {
                        log::info!(
                            "persistence recovered for {} at version {version}",
                            entry.id
                        );
                    }
                    // Edits that landed while writing need another pass.
                    if entry.dirty.load(Ordering::SeqCst) {
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    entry.dirty.store(true, Ordering::SeqCst);
                    let failures = entry.failures.fetch_add(1, Ordering::SeqCst) + 1;
                    if failures == self.config.retry_warn_ceiling {
                        log::warn!(
                            "document {} degraded: {failures} failed persists, \
                             serving from memory (last error: {e})",
                            entry.id
                        );
                    } else {
                        log::error!(
                            "persist failed for {} (attempt {failures}): {e}",
                            entry.id
                        );
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.config.retry_max_delay);
                }
            }
        }
        entry.persist_queued.store(false, Ordering::SeqCst);
        // An edit may have raced the hand-off above; requeue if so.
        if entry.dirty.load(Ordering::SeqCst)
            && !entry.persist_queued.swap(true, Ordering::SeqCst)
        {
            let _ = self.persist_tx.send(entry.clone());
        }
    }

    async fn run_sweeper(self: Arc<Self>) {
        let period = (self.config.idle_timeout / 4).max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Rejected;
    use crate::ot::Edit;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn text_insert(offset: usize, text: &str) -> Operation {
        Operation::single(Edit::InsertText {
            path: vec![],
            offset,
            text: text.into(),
        })
    }

    fn test_registry(store: Arc<MemoryStore>, idle: Duration) -> Arc<Registry> {
        Registry::new(
            store,
            RegistryConfig {
                idle_timeout: idle,
                retry_base_delay: Duration::from_millis(5),
                retry_max_delay: Duration::from_millis(20),
                retry_warn_ceiling: 3,
                ..RegistryConfig::default()
            },
        )
    }

    async fn eventually(mut check: impl FnMut() -> bool, what: &str) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_entry() {
        let registry = test_registry(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        let a = registry.get_or_create("doc").await.unwrap();
        let b = registry.get_or_create("doc").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.document_count().await, 1);
    }

    #[tokio::test]
    async fn test_missing_document_created_fresh() {
        let store = Arc::new(MemoryStore::new());
        let registry = test_registry(store.clone(), Duration::from_secs(60));

        let entry = registry.get_or_create("brand-new").await.unwrap();
        let (content, version) = registry.snapshot(&entry).await;
        assert_eq!(content, json!(""));
        assert_eq!(version, 0);
        // The safety-net create reached the store.
        assert_eq!(store.load("brand-new").unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_submit_applies_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let registry = test_registry(store.clone(), Duration::from_secs(60));
        registry.start();

        let entry = registry.get_or_create("doc").await.unwrap();
        let applied = registry
            .submit(&entry, text_insert(0, "hello"), 0, Uuid::new_v4(), 1)
            .await
            .unwrap();
        assert_eq!(applied.new_version, 1);

        eventually(
            || {
                !entry.is_dirty()
                    && store.load("doc").map(|d| d.version == 1).unwrap_or(false)
            },
            "write-behind persist",
        )
        .await;
        assert_eq!(store.load("doc").unwrap().content, json!("hello"));
    }

    #[tokio::test]
    async fn test_store_outage_does_not_stop_edits() {
        let store = Arc::new(MemoryStore::new());
        let registry = test_registry(store.clone(), Duration::from_millis(10));
        registry.start();

        let entry = registry.get_or_create("doc").await.unwrap();
        store.fail_persists(true);

        let session = Uuid::new_v4();
        registry
            .submit(&entry, text_insert(0, "a"), 0, session, 1)
            .await
            .unwrap();
        registry
            .submit(&entry, text_insert(1, "b"), 1, session, 2)
            .await
            .unwrap();

        let (content, version) = registry.snapshot(&entry).await;
        assert_eq!(content, json!("ab"));
        assert_eq!(version, 2);

        // Dirty entries survive sweeps even past the idle timeout.
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.sweep().await;
        assert_eq!(registry.document_count().await, 1);

        // Store comes back: retries land the final state.
        store.fail_persists(false);
        eventually(
            || store.load("doc").map(|d| d.version == 2).unwrap_or(false),
            "persist after recovery",
        )
        .await;
        assert_eq!(store.load("doc").unwrap().content, json!("ab"));
    }

    #[tokio::test]
    async fn test_idle_eviction_and_reload() {
        let store = Arc::new(MemoryStore::new());
        let registry = test_registry(store.clone(), Duration::from_millis(20));
        registry.start();

        let entry = registry.get_or_create("doc").await.unwrap();
        let session = Uuid::new_v4();
        let _rx = registry.subscribe(&entry, session).await;
        registry
            .submit(&entry, text_insert(0, "kept"), 0, session, 1)
            .await
            .unwrap();
        registry.unsubscribe(&entry, &session).await;

        eventually(
            || store.load("doc").map(|d| d.version == 1).unwrap_or(false),
            "persist before eviction",
        )
        .await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(registry.sweep().await, 1);
        assert_eq!(registry.document_count().await, 0);

        // Reload from the store: durable state was unaffected by eviction.
        let entry = registry.get_or_create("doc").await.unwrap();
        let (content, version) = registry.snapshot(&entry).await;
        assert_eq!(content, json!("kept"));
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn test_subscribed_entry_not_evicted() {
        let store = Arc::new(MemoryStore::new());
        let registry = test_registry(store, Duration::from_millis(10));

        let entry = registry.get_or_create("doc").await.unwrap();
        let _rx = registry.subscribe(&entry, Uuid::new_v4()).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(registry.sweep().await, 0);
        assert_eq!(registry.document_count().await, 1);
    }

    #[tokio::test]
    async fn test_cross_document_independence() {
        let store = Arc::new(MemoryStore::new());
        let registry = test_registry(store, Duration::from_secs(60));

        let x = registry.get_or_create("doc-x").await.unwrap();
        let y = registry.get_or_create("doc-y").await.unwrap();

        let session = Uuid::new_v4();
        let rx = registry.submit(&x, text_insert(0, "x"), 0, session, 1);
        let ry = registry.submit(&y, text_insert(0, "y"), 0, session, 2);
        let (rx, ry) = tokio::join!(rx, ry);

        // Neither submission observes the other's version counter.
        assert_eq!(rx.unwrap().new_version, 1);
        assert_eq!(ry.unwrap().new_version, 1);
        assert_eq!(registry.snapshot(&x).await.0, json!("x"));
        assert_eq!(registry.snapshot(&y).await.0, json!("y"));
    }

    #[tokio::test]
    async fn test_stale_submission_rejected_after_compaction() {
        let store = Arc::new(MemoryStore::new());
        let registry = test_registry(store, Duration::from_secs(60));

        let entry = registry.get_or_create("doc").await.unwrap();
        let session = Uuid::new_v4();
        for i in 0..3u64 {
            registry
                .submit(&entry, text_insert(0, "x"), i, session, i)
                .await
                .unwrap();
        }
        // Empty room: sweep compacts the full history.
        registry.sweep().await;

        let err = registry
            .submit(&entry, text_insert(0, "y"), 1, Uuid::new_v4(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Rejected::HistoryEvicted { .. }));
    }
}
