//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents` — current content and revision (bincode, LZ4 compressed)
//! - `oplog`     — applied operations (bincode, LZ4 compressed, keyed by doc_id:revision)
//! - `metadata`  — document metadata (bincode: timestamps, revision, sizes)
//!
//! Every append is one `WriteBatch`: new content, the log entry, updated
//! metadata, and a range delete of log entries that fell out of the
//! retention window.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use quill_ot::{DocumentId, Edit, Revision};

use super::{decode, encode, DocumentStore, LogEntry, StoreError, StoredDocument, DEFAULT_LOG_CAPACITY};

/// Column family names.
const CF_DOCUMENTS: &str = "documents";
const CF_OPLOG: &str = "oplog";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_OPLOG, CF_METADATA];

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
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
    /// Log entries retained per document (default: 200)
    pub log_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quill_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

/// Document metadata stored alongside the content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: Uuid,
    /// Revision of the stored content
    pub revision: Revision,
    /// Encoded content size before compression
    pub content_size: u64,
    /// Encoded content size after compression
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: Uuid) -> Self {
        let now = now_secs();
        Self {
            doc_id,
            revision: 0,
            content_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Stored form of the `documents` column family value.
#[derive(Serialize, Deserialize)]
struct DocumentRecord<D> {
    content: D,
    revision: Revision,
}

/// RocksDB-backed document store.
pub struct RocksStore<E> {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes the read-check-write of `append` and `create`.
    write_lock: Mutex<()>,
    _edit: PhantomData<fn() -> E>,
}

impl<E: Edit> RocksStore<E> {
    /// Open the store at the configured path, creating the database and
    /// column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
            _edit: PhantomData,
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_OPLOG => {
                // Many small writes, prefix-scanned by doc_id
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {
                opts.set_max_write_buffer_number(2);
            }
        }

        opts
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub fn load_metadata(&self, doc_id: DocumentId) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(StoreError::NotFound(doc_id)),
        }
    }

    fn load_record(
        &self,
        doc_id: DocumentId,
    ) -> Result<Option<DocumentRecord<E::Document>>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(compressed) => {
                let bytes = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                decode(&bytes).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Retained log entries in revision order.
    pub fn load_log(&self, doc_id: DocumentId) -> Result<Vec<LogEntry<E>>, StoreError> {
        let cf = self.cf(CF_OPLOG)?;
        let start_key = Self::log_key(doc_id, 0);

        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() < 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            let bytes = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            entries.push(decode(&bytes)?);
        }
        Ok(entries)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn log_capacity(&self) -> usize {
        self.config.log_capacity
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    /// Build a log key: doc_id (16 bytes) + revision (8 bytes big-endian).
    fn log_key(doc_id: DocumentId, revision: Revision) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(doc_id.as_bytes());
        key.extend_from_slice(&revision.to_be_bytes());
        key
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Database("write lock poisoned".into()))
    }
}

impl<E: Edit> DocumentStore<E> for RocksStore<E> {
    fn load(&self, doc_id: DocumentId) -> Result<Option<StoredDocument<E>>, StoreError> {
        let Some(record) = self.load_record(doc_id)? else {
            return Ok(None);
        };
        let log = self.load_log(doc_id)?;
        Ok(Some(StoredDocument {
            content: record.content,
            revision: record.revision,
            log,
        }))
    }

    fn create(&self, doc_id: DocumentId, content: &E::Document) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        if self.db.get_cf(self.cf(CF_METADATA)?, doc_id.as_bytes())?.is_some() {
            return Err(StoreError::AlreadyExists(doc_id));
        }

        let encoded = encode(&DocumentRecord { content, revision: 0 })?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let mut meta = DocumentMetadata::new(doc_id);
        meta.content_size = encoded.len() as u64;
        meta.compressed_size = compressed.len() as u64;

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_DOCUMENTS)?, doc_id.as_bytes(), &compressed);
        batch.put_cf(self.cf(CF_METADATA)?, doc_id.as_bytes(), encode(&meta)?);
        self.write(batch)?;

        log::debug!("Created document {doc_id}");
        Ok(())
    }

    fn append(
        &self,
        doc_id: DocumentId,
        entry: &LogEntry<E>,
        new_revision: Revision,
        new_content: &E::Document,
    ) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        let mut meta = self.load_metadata(doc_id)?;
        if new_revision != meta.revision + 1 {
            return Err(StoreError::RevisionConflict {
                expected: meta.revision + 1,
                found: new_revision,
            });
        }

        let encoded = encode(&DocumentRecord {
            content: new_content,
            revision: new_revision,
        })?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);
        let entry_bytes = lz4_flex::compress_prepend_size(&encode(entry)?);

        meta.revision = new_revision;
        meta.content_size = encoded.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let cf_oplog = self.cf(CF_OPLOG)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_DOCUMENTS)?, doc_id.as_bytes(), &compressed);
        batch.put_cf(cf_oplog, Self::log_key(doc_id, new_revision), &entry_bytes);
        batch.put_cf(self.cf(CF_METADATA)?, doc_id.as_bytes(), encode(&meta)?);

        // Keep revisions (new_revision - capacity, new_revision]
        let cutoff = (new_revision + 1).saturating_sub(self.config.log_capacity as u64);
        if cutoff > 0 {
            batch.delete_range_cf(
                cf_oplog,
                Self::log_key(doc_id, 0),
                Self::log_key(doc_id, cutoff),
            );
        }

        self.write(batch)
    }

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut doc_ids = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if key.len() == 16 {
                let id = Uuid::from_bytes(
                    key.as_ref()
                        .try_into()
                        .map_err(|_| StoreError::Deserialization("Invalid UUID key".into()))?,
                );
                doc_ids.push(id);
            }
        }

        Ok(doc_ids)
    }

    fn delete(&self, doc_id: DocumentId) -> Result<bool, StoreError> {
        let _guard = self.lock()?;
        let cf_meta = self.cf(CF_METADATA)?;
        if self.db.get_cf(cf_meta, doc_id.as_bytes())?.is_none() {
            return Ok(false);
        }

        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_DOCUMENTS)?, doc_id.as_bytes());
        batch.delete_cf(cf_meta, doc_id.as_bytes());
        batch.delete_range_cf(
            self.cf(CF_OPLOG)?,
            Self::log_key(doc_id, 0),
            Self::log_key(doc_id, u64::MAX),
        );
        self.write(batch)?;

        log::info!("Deleted document {doc_id}");
        Ok(true)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
