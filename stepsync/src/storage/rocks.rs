//! RocksDB-backed durable storage.
//!
//! Column families:
//! - `document`: current snapshot (LZ4-compressed JSON), single key
//! - `steps`:    retained step records, keyed by version (8 bytes BE)
//! - `commits`:  latest commit record, keyed by new version (8 bytes BE)
//!
//! Every commit is one `WriteBatch`: commit record, snapshot, new steps and
//! range deletes for evicted steps and superseded commit records. RocksDB
//! applies a batch atomically, so after a crash the three column families
//! always agree. On open the latest commit record is still checked against
//! the snapshot and redone if the snapshot lags behind it.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

use super::{Backend, CommitRecord, Recovered, StoreError, StoredStep};
use crate::document::{Document, StepRecord};

const CF_DOCUMENT: &str = "document";
const CF_STEPS: &str = "steps";
const CF_COMMITS: &str = "commits";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENT, CF_STEPS, CF_COMMITS];

const DOCUMENT_KEY: &[u8] = b"current";

/// RocksDB configuration.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every commit batch (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("stepsync_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl RocksConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Config for testing (small caches).
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

/// Snapshot at rest.
#[derive(Debug, Serialize, Deserialize)]
struct StoredDocument {
    version: u64,
    /// LZ4 (size-prepended) JSON content
    compressed: Vec<u8>,
}

impl StoredDocument {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (doc, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(doc)
    }

    fn into_document(self) -> Result<Document, StoreError> {
        let json = lz4_flex::decompress_size_prepended(&self.compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let content: Value = serde_json::from_slice(&json)
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(Document {
            version: self.version,
            content,
        })
    }
}

/// Durable backend over RocksDB.
pub struct RocksBackend {
    /// RocksDB instance (single-threaded mode; the store serializes writes)
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksConfig,
}

impl RocksBackend {
    /// Open the database, creating it and its column families if missing.
    pub fn open(config: RocksConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened step store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &RocksConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENT => {
                // Snapshot is already LZ4-compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_STEPS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
            }
            CF_COMMITS => {
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Number of step records currently on disk.
    pub fn stored_step_count(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_STEPS)?;
        let mut count = 0;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    // ─── Reads ────────────────────────────────────────────────────────

    fn read_document(&self) -> Result<Option<Document>, StoreError> {
        let cf = self.cf(CF_DOCUMENT)?;
        match self.db.get_cf(&cf, DOCUMENT_KEY)? {
            Some(bytes) => Ok(Some(StoredDocument::decode(&bytes)?.into_document()?)),
            None => Ok(None),
        }
    }

    /// All stored steps up to `max_version`, keeping only the contiguous
    /// run that ends at the highest version.
    fn read_steps(&self, max_version: u64) -> Result<Vec<StepRecord>, StoreError> {
        let cf = self.cf(CF_STEPS)?;
        let mut steps: Vec<StoredStep> = Vec::new();

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            let step = StoredStep::decode(&value)?;
            if step.version > max_version {
                break;
            }
            if let Some(last) = steps.last() {
                if step.version != last.version + 1 {
                    log::warn!(
                        "Gap in stored steps between {} and {}, dropping older run",
                        last.version,
                        step.version
                    );
                    steps.clear();
                }
            }
            steps.push(step);
        }

        steps.iter().map(StoredStep::to_record).collect()
    }

    /// Newest commit record that decodes and verifies.
    fn latest_commit(&self) -> Result<Option<CommitRecord>, StoreError> {
        let cf = self.cf(CF_COMMITS)?;
        for item in self.db.iterator_cf(&cf, IteratorMode::End) {
            let (key, value) = item?;
            match CommitRecord::decode(&value) {
                Ok(record) => return Ok(Some(record)),
                Err(e) => log::warn!("Skipping unreadable commit record {key:?}: {e}"),
            }
        }
        Ok(None)
    }

    // ─── Writes ───────────────────────────────────────────────────────

    /// Stage the snapshot and steps of `record` into `batch`.
    fn materialize(
        &self,
        batch: &mut WriteBatch,
        record: &CommitRecord,
        retain_from: u64,
    ) -> Result<(), StoreError> {
        let cf_document = self.cf(CF_DOCUMENT)?;
        let cf_steps = self.cf(CF_STEPS)?;

        let stored = StoredDocument {
            version: record.new_version,
            compressed: lz4_flex::compress_prepend_size(&record.snapshot),
        };
        batch.put_cf(&cf_document, DOCUMENT_KEY, stored.encode()?);

        for step in &record.steps {
            batch.put_cf(&cf_steps, version_key(step.version), step.encode()?);
        }
        if retain_from > 0 {
            batch.delete_range_cf(&cf_steps, version_key(0), version_key(retain_from));
        }
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or(StoreError::MissingColumnFamily(name))
    }
}

impl Backend for RocksBackend {
    fn load(&self) -> Result<Option<Recovered>, StoreError> {
        let mut document = self.read_document()?;

        if let Some(record) = self.latest_commit()? {
            let lagging = document
                .as_ref()
                .map_or(true, |d| d.version < record.new_version);
            if lagging {
                log::warn!(
                    "Snapshot behind commit record {}, redoing commit",
                    record.new_version
                );
                let mut batch = WriteBatch::default();
                self.materialize(&mut batch, &record, 0)?;
                self.write_batch(batch)?;
                document = Some(record.document()?);
            }
        }

        let Some(document) = document else {
            return Ok(None);
        };
        let steps = self.read_steps(document.version)?;
        log::info!(
            "Recovered document at version {} with {} retained steps",
            document.version,
            steps.len()
        );
        Ok(Some(Recovered { document, steps }))
    }

    fn write_commit(&self, record: &CommitRecord, retain_from: u64) -> Result<(), StoreError> {
        let cf_commits = self.cf(CF_COMMITS)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_commits, version_key(record.new_version), record.encode()?);
        self.materialize(&mut batch, record, retain_from)?;
        // Only the newest record is ever needed for redo
        batch.delete_range_cf(&cf_commits, version_key(0), version_key(record.new_version));

        self.write_batch(batch)
    }

    fn name(&self) -> &'static str {
        "rocksdb"
    }
}

fn version_key(version: u64) -> [u8; 8] {
    version.to_be_bytes()
}
