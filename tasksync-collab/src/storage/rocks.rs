//! RocksDB-backed row store.
//!
//! Column families:
//! - `rows`    : One entry per row, keyed by `<table>\0<id>`, JSON value
//!                carrying the row and its commit sequence
//! - `retired` : Ids of deleted rows, keyed like `rows`, empty values
//! - `metadata`: Per-table metadata (bincode: version, row count, times)
//!
//! Rows are written through on every committed change, so a restarted
//! server serves exactly the state its clients last saw.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use chrono::Utc;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tasksync_core::{RawRow, RecordId};

const CF_ROWS: &str = "rows";
const CF_RETIRED: &str = "retired";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_ROWS, CF_RETIRED, CF_METADATA];

/// Separates the table name from the row id in `rows` keys.
const KEY_SEPARATOR: u8 = 0;

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
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tasksync_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
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
        }
    }
}

/// Per-table metadata stored alongside the rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub table: String,
    /// Bumped on every committed write
    pub version: u64,
    pub row_count: u64,
    /// Seconds since epoch
    pub created_at: i64,
    pub updated_at: i64,
}

impl TableMetadata {
    fn new(table: &str) -> Self {
        let now = Utc::now().timestamp();
        Self {
            table: table.to_string(),
            version: 0,
            row_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now().timestamp();
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// A persisted row with the sequence it was committed at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub seq: u64,
    pub row: RawRow,
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB-backed row store.
pub struct RowStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes metadata read-modify-write cycles.
    meta_lock: Mutex<()>,
}

impl RowStore {
    /// Open the store at the configured path, creating it if missing.
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

        log::info!("Opened row store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            meta_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_ROWS => {
                // Many small writes, prefix-scanned per table on recovery
                opts.set_max_write_buffer_number(4);
            }
            CF_RETIRED | CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── Rows ─────────────────────────────────────────────────────────

    /// Insert or replace a row.
    pub fn put_row(
        &self,
        table: &str,
        id: &RecordId,
        seq: u64,
        row: &RawRow,
    ) -> Result<(), StoreError> {
        self.put_rows(table, &[(id.clone(), seq, row.clone())])
    }

    /// Insert or replace several rows in one atomic write.
    pub fn put_rows(&self, table: &str, rows: &[(RecordId, u64, RawRow)]) -> Result<(), StoreError> {
        let cf_rows = self.cf(CF_ROWS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let _guard = self.lock_meta();
        let mut meta = self.metadata_or_new(table)?;
        let mut batch = WriteBatch::default();
        for (id, seq, row) in rows {
            let key = Self::row_key(table, id);
            let value = serde_json::to_vec(&StoredRow {
                seq: *seq,
                row: row.clone(),
            })
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
            if self.db.get_cf(&cf_rows, &key)?.is_none() {
                meta.row_count += 1;
            }
            batch.put_cf(&cf_rows, &key, &value);
        }
        meta.touch();
        batch.put_cf(&cf_meta, table.as_bytes(), &meta.encode()?);
        self.write(batch)
    }

    /// Delete a row and retire its id. Missing rows are not an error.
    pub fn delete_row(&self, table: &str, id: &RecordId) -> Result<bool, StoreError> {
        Ok(self.delete_rows(table, std::slice::from_ref(id))? > 0)
    }

    /// Delete rows and retire their ids in one atomic write. Returns how
    /// many rows existed.
    pub fn delete_rows(&self, table: &str, ids: &[RecordId]) -> Result<usize, StoreError> {
        let cf_rows = self.cf(CF_ROWS)?;
        let cf_retired = self.cf(CF_RETIRED)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let _guard = self.lock_meta();
        let mut batch = WriteBatch::default();
        let mut deleted = 0;
        for id in ids {
            let key = Self::row_key(table, id);
            if self.db.get_cf(&cf_rows, &key)?.is_none() {
                continue;
            }
            batch.delete_cf(&cf_rows, &key);
            batch.put_cf(&cf_retired, &key, b"");
            deleted += 1;
        }
        if deleted == 0 {
            return Ok(0);
        }

        let mut meta = self.metadata_or_new(table)?;
        meta.row_count = meta.row_count.saturating_sub(deleted as u64);
        meta.touch();
        batch.put_cf(&cf_meta, table.as_bytes(), &meta.encode()?);
        self.write(batch)?;
        Ok(deleted)
    }

    /// Ids of every row ever deleted from `table`.
    pub fn load_retired(&self, table: &str) -> Result<Vec<RecordId>, StoreError> {
        let cf = self.cf(CF_RETIRED)?;
        let prefix = Self::table_prefix(table);
        let mut ids = Vec::new();

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let id = std::str::from_utf8(&key[prefix.len()..])
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            ids.push(RecordId::new(id));
        }
        Ok(ids)
    }

    pub fn load_row(&self, table: &str, id: &RecordId) -> Result<Option<StoredRow>, StoreError> {
        let cf = self.cf(CF_ROWS)?;
        match self.db.get_cf(&cf, Self::row_key(table, id))? {
            Some(bytes) => Ok(Some(Self::decode_row(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load every row of a table, in commit-sequence order.
    pub fn load_table(&self, table: &str) -> Result<Vec<StoredRow>, StoreError> {
        let cf = self.cf(CF_ROWS)?;
        let prefix = Self::table_prefix(table);
        let mut rows = Vec::new();

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            rows.push(Self::decode_row(&value)?);
        }

        rows.sort_by_key(|r| r.seq);
        Ok(rows)
    }

    /// Delete a table, its rows and its retired ids.
    pub fn delete_table(&self, table: &str) -> Result<u64, StoreError> {
        let cf_rows = self.cf(CF_ROWS)?;
        let cf_retired = self.cf(CF_RETIRED)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let prefix = Self::table_prefix(table);

        let mut batch = WriteBatch::default();
        let mut count = 0u64;
        let iter = self
            .db
            .iterator_cf(&cf_rows, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            batch.delete_cf(&cf_rows, &key);
            count += 1;
        }
        let retired = self
            .db
            .iterator_cf(&cf_retired, IteratorMode::From(&prefix, Direction::Forward));
        for item in retired {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            batch.delete_cf(&cf_retired, &key);
        }
        batch.delete_cf(&cf_meta, table.as_bytes());

        let _guard = self.lock_meta();
        self.write(batch)?;
        Ok(count)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, table: &str) -> Result<TableMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, table.as_bytes())? {
            Some(bytes) => TableMetadata::decode(&bytes),
            None => Err(StoreError::TableNotFound(table.to_string())),
        }
    }

    /// Names of every table with persisted state.
    pub fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut tables = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let name = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            tables.push(name);
        }
        Ok(tables)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn lock_meta(&self) -> std::sync::MutexGuard<'_, ()> {
        // A poisoned lock only means another writer panicked; the guarded
        // data is `()`.
        self.meta_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn metadata_or_new(&self, table: &str) -> Result<TableMetadata, StoreError> {
        match self.load_metadata(table) {
            Ok(meta) => Ok(meta),
            Err(StoreError::TableNotFound(_)) => Ok(TableMetadata::new(table)),
            Err(e) => Err(e),
        }
    }

    fn decode_row(bytes: &[u8]) -> Result<StoredRow, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    fn table_prefix(table: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(table.len() + 1);
        key.extend_from_slice(table.as_bytes());
        key.push(KEY_SEPARATOR);
        key
    }

    /// `<table>\0<id>`
    fn row_key(table: &str, id: &RecordId) -> Vec<u8> {
        let mut key = Self::table_prefix(table);
        key.extend_from_slice(id.as_str().as_bytes());
        key
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
