//! RocksDB-backed draft store.
//!
//! Column families:
//! - `drafts`    : id (16 bytes) → bincode record, code LZ4 compressed
//! - `draft_keys`: bincode session key → id
//!
//! Both families are written in one `WriteBatch`, so a key never points at a
//! record that was not stored.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Draft, DraftKey, DraftRecord, DraftStore, StoreError, Verdict};
use crate::language::Language;

const CF_DRAFTS: &str = "drafts";
const CF_DRAFT_KEYS: &str = "draft_keys";

const COLUMN_FAMILIES: &[&str] = &[CF_DRAFTS, CF_DRAFT_KEYS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// fsync on every write
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("codesync_drafts"),
            sync_writes: true,
            max_open_files: 256,
            block_cache_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_writes: false,
            max_open_files: 64,
            block_cache_size: 8 * 1024 * 1024,
        }
    }
}

/// On-disk form of a [`DraftRecord`].
#[derive(Debug, Serialize, Deserialize)]
struct StoredDraft {
    id: Uuid,
    key: DraftKey,
    language: Language,
    verdict: Verdict,
    created_at: u64,
    updated_at: u64,
    /// LZ4 with prepended size
    code_lz4: Vec<u8>,
}

impl StoredDraft {
    fn from_record(record: &DraftRecord) -> Self {
        Self {
            id: record.id,
            key: record.key.clone(),
            language: record.language,
            verdict: record.verdict,
            created_at: record.created_at,
            updated_at: record.updated_at,
            code_lz4: lz4_flex::compress_prepend_size(record.code.as_bytes()),
        }
    }

    fn into_record(self) -> Result<DraftRecord, StoreError> {
        let bytes = lz4_flex::decompress_size_prepended(&self.code_lz4)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let code =
            String::from_utf8(bytes).map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(DraftRecord {
            id: self.id,
            key: self.key,
            code,
            language: self.language,
            verdict: self.verdict,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable draft store.
pub struct RocksDraftStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write upserts
    write_lock: Mutex<()>,
}

impl RocksDraftStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened draft store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, cache: &Cache) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            // Code is already LZ4 compressed per record
            CF_DRAFTS => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
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

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn id_for(&self, key: &DraftKey) -> Result<Option<Uuid>, StoreError> {
        let cf = self.cf(CF_DRAFT_KEYS)?;
        match self.db.get_cf(cf, encode(key)?)? {
            Some(bytes) => Uuid::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn record(&self, id: Uuid) -> Result<Option<DraftRecord>, StoreError> {
        let cf = self.cf(CF_DRAFTS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => decode::<StoredDraft>(&bytes)?.into_record().map(Some),
            None => Ok(None),
        }
    }

    /// Write `draft` under `id`. Caller holds the write lock.
    fn upsert(&self, id: Uuid, draft: &Draft) -> Result<(), StoreError> {
        let cf_drafts = self.cf(CF_DRAFTS)?;
        let cf_keys = self.cf(CF_DRAFT_KEYS)?;

        let mut batch = WriteBatch::default();
        let record = match self.record(id)? {
            Some(mut record) => {
                if record.key != draft.key {
                    batch.delete_cf(cf_keys, encode(&record.key)?);
                }
                record.apply(draft);
                record
            }
            None => DraftRecord::new(id, draft),
        };

        batch.put_cf(cf_drafts, id.as_bytes(), encode(&StoredDraft::from_record(&record))?);
        batch.put_cf(cf_keys, encode(&draft.key)?, id.as_bytes());

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        log::debug!("Stored draft {id} for {}", draft.key);
        Ok(())
    }
}

impl DraftStore for RocksDraftStore {
    fn save(&self, draft: &Draft) -> Result<Uuid, StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::LockPoisoned)?;
        let id = self.id_for(&draft.key)?.unwrap_or_else(Uuid::new_v4);
        self.upsert(id, draft)?;
        Ok(id)
    }

    fn update(&self, id: Uuid, draft: &Draft) -> Result<Uuid, StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::LockPoisoned)?;
        self.upsert(id, draft)?;
        Ok(id)
    }

    fn load(&self, key: &DraftKey) -> Result<Option<DraftRecord>, StoreError> {
        match self.id_for(key)? {
            Some(id) => self.record(id),
            None => Ok(None),
        }
    }

    fn get(&self, id: Uuid) -> Result<Option<DraftRecord>, StoreError> {
        self.record(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksDraftStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksDraftStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    fn draft(code: &str) -> Draft {
        Draft {
            key: DraftKey::new("user-1", "two-sum"),
            code: code.into(),
            language: Language::Cpp,
            verdict: Verdict::Draft,
        }
    }

    #[test]
    fn test_open_creates_directory() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
    }

    #[test]
    fn test_load_missing() {
        let (_dir, store) = open_temp();
        assert!(store.load(&DraftKey::new("nobody", "q")).unwrap().is_none());
        assert!(store.get(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let (_dir, store) = open_temp();
        let id = store.save(&draft("int main() { return 0; }")).unwrap();

        let record = store.load(&DraftKey::new("user-1", "two-sum")).unwrap().unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.code, "int main() { return 0; }");
        assert_eq!(record.language, Language::Cpp);
        assert!(record.created_at > 0);
        assert_eq!(store.get(id).unwrap(), Some(record));
    }

    #[test]
    fn test_resave_updates_in_place() {
        let (_dir, store) = open_temp();
        let first = store.save(&draft("v1")).unwrap();
        let second = store
            .save(&Draft {
                verdict: Verdict::Passed,
                ..draft("v2")
            })
            .unwrap();

        assert_eq!(first, second);
        let record = store.get(first).unwrap().unwrap();
        assert_eq!(record.code, "v2");
        assert_eq!(record.verdict, Verdict::Passed);
        assert!(record.updated_at >= record.created_at);
    }

    #[test]
    fn test_large_repetitive_code() {
        let (_dir, store) = open_temp();
        let code = "cout << i << endl;\n".repeat(10_000);
        let id = store.save(&draft(&code)).unwrap();
        assert_eq!(store.get(id).unwrap().unwrap().code, code);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert!(config.sync_writes);
        assert_eq!(config.block_cache_size, 64 * 1024 * 1024);
    }
}
