//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents` — JSON document content (LZ4 compressed)
//! - `metadata`  — per-document metadata (bincode: version, timestamps)
//!
//! Content and metadata for one document are written in a single atomic
//! `WriteBatch`, so a crash never leaves a version without its content.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{DocumentStore, StoreError, StoredDocument};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("cowrite_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-document metadata stored alongside content.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentMetadata {
    version: u64,
    created_at: u64,
    updated_at: u64,
}

impl DocumentMetadata {
    fn new(version: u64) -> Self {
        let now = unix_now();
        Self {
            version,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(meta)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// RocksDB-backed document store.
///
/// LZ4-compressed content, bloom filters for fast key lookup, block cache
/// for hot document access, atomic write batches for consistency.
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the document store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        // Block-based table with bloom filter and cache
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // LZ4 — fast decompression on the load path
        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        opts
    }

    /// Whether a document exists without loading its content.
    pub fn document_exists(&self, id: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, id.as_bytes())?.is_some())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn load_metadata(&self, id: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(DocumentMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write(
        &self,
        id: &str,
        content: &Value,
        meta: &DocumentMetadata,
    ) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let raw =
            serde_json::to_vec(content).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&raw);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, id.as_bytes(), &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

impl DocumentStore for RocksStore {
    fn load(&self, id: &str) -> Result<StoredDocument, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let compressed = self
            .db
            .get_cf(&cf, id.as_bytes())?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let raw = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let content: Value =
            serde_json::from_slice(&raw).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let meta = self
            .load_metadata(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        Ok(StoredDocument {
            id: id.to_string(),
            content,
            version: meta.version,
        })
    }

    fn create(&self, id: &str) -> Result<StoredDocument, StoreError> {
        if self.document_exists(id)? {
            return self.load(id);
        }
        let fresh = StoredDocument::fresh(id);
        self.write(id, &fresh.content, &DocumentMetadata::new(0))?;
        Ok(fresh)
    }

    fn persist(&self, id: &str, content: &Value, version: u64) -> Result<(), StoreError> {
        let meta = match self.load_metadata(id)? {
            Some(mut meta) => {
                meta.version = version;
                meta.updated_at = unix_now();
                meta
            }
            None => DocumentMetadata::new(version),
        };
        self.write(id, content, &meta)
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();

        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            ids.push(id);
        }

        Ok(ids)
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use uuid::Uuid;

    fn temp_db_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("cowrite_test_rocks_{name}_{}", Uuid::new_v4()))
    }

    fn cleanup(path: &Path) {
        let _ = fs::remove_dir_all(path);
    }

    #[test]
    fn test_store_open_close() {
        let path = temp_db_path("open_close");
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert!(store.path().exists());
        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_persist_load_roundtrip() {
        let path = temp_db_path("roundtrip");
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();

        let content = json!({"body": "Hello, persistence!", "tags": ["a", "b"]});
        store.persist("doc-1", &content, 12).unwrap();

        let loaded = store.load("doc-1").unwrap();
        assert_eq!(loaded.id, "doc-1");
        assert_eq!(loaded.content, content);
        assert_eq!(loaded.version, 12);

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_load_missing() {
        let path = temp_db_path("missing");
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();

        assert!(matches!(
            store.load("ghost"),
            Err(StoreError::NotFound(_))
        ));

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_create_idempotent() {
        let path = temp_db_path("create");
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();

        let fresh = store.create("doc-1").unwrap();
        assert_eq!(fresh.content, json!(""));
        assert_eq!(fresh.version, 0);

        store.persist("doc-1", &json!("edited"), 4).unwrap();

        // Create again: existing state wins.
        let again = store.create("doc-1").unwrap();
        assert_eq!(again.content, json!("edited"));
        assert_eq!(again.version, 4);

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_survives_reopen() {
        let path = temp_db_path("reopen");
        let config = StoreConfig::for_testing(&path);

        {
            let store = RocksStore::open(config.clone()).unwrap();
            store.persist("doc-1", &json!("persisted state"), 8).unwrap();
        }

        {
            let store = RocksStore::open(config).unwrap();
            let loaded = store.load("doc-1").unwrap();
            assert_eq!(loaded.content, json!("persisted state"));
            assert_eq!(loaded.version, 8);
        }

        cleanup(&path);
    }

    #[test]
    fn test_list_documents() {
        let path = temp_db_path("list");
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();

        for id in ["alpha", "beta", "gamma"] {
            store.create(id).unwrap();
        }

        let mut ids = store.list().unwrap();
        ids.sort();
        assert_eq!(ids, vec!["alpha", "beta", "gamma"]);

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_multiple_documents_isolation() {
        let path = temp_db_path("isolation");
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();

        store.persist("doc-a", &json!("contents of a"), 5).unwrap();
        store.persist("doc-b", &json!("contents of b"), 3).unwrap();

        assert_eq!(store.load("doc-a").unwrap().version, 5);
        assert_eq!(store.load("doc-b").unwrap().version, 3);
        assert_eq!(store.load("doc-a").unwrap().content, json!("contents of a"));
        assert_eq!(store.load("doc-b").unwrap().content, json!("contents of b"));

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_large_content_compresses() {
        let path = temp_db_path("large");
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();

        let body = "The quick brown fox jumps over the lazy dog. ".repeat(10_000);
        store.persist("doc-1", &json!(body), 1).unwrap();

        let loaded = store.load("doc-1").unwrap();
        assert_eq!(loaded.content, json!(body));

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_metadata_timestamps() {
        let path = temp_db_path("metadata");
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();

        store.create("doc-1").unwrap();
        let meta = store.load_metadata("doc-1").unwrap().unwrap();
        assert!(meta.created_at > 0);
        assert!(meta.updated_at >= meta.created_at);

        store.persist("doc-1", &json!("x"), 1).unwrap();
        let meta = store.load_metadata("doc-1").unwrap().unwrap();
        assert_eq!(meta.version, 1);

        drop(store);
        cleanup(&path);
    }
}
