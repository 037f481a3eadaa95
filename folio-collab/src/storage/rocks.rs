//! RocksDB-backed scene store.
//!
//! Column families:
//! - `scenes`: current scene content (LZ4, keyed by scene_id)
//! - `versions`: immutable snapshots (bincode, keyed by scene_id ‖ version_number BE)
//! - `metadata`: per-scene counters (bincode, keyed by scene_id)
//!
//! Version keys sort by scene then number, so one scene's log is a single
//! contiguous range scan.
//!
//! The inherent methods block on disk. The [`SceneRepository`] impl runs them
//! on the blocking pool; a `RocksStore` clone shares the same database.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use folio_core::{SceneId, SceneVersion, VersionId};

use super::snapshot::{CompressedSnapshot, SnapshotStats};
use super::{SceneRepository, StoreError};

const CF_SCENES: &str = "scenes";
const CF_VERSIONS: &str = "versions";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SCENES, CF_VERSIONS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write (default: true; a save is only reported once durable)
    pub sync_writes: bool,
    /// Max open files (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("folio_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
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

/// Per-scene bookkeeping kept next to the content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneMetadata {
    pub scene_id: SceneId,
    pub version_count: u64,
    pub last_version_number: u64,
    pub content_size: u64,
    pub compressed_size: u64,
    pub updated_at: DateTime<Utc>,
}

impl SceneMetadata {
    fn new(scene_id: SceneId) -> Self {
        Self {
            scene_id,
            version_count: 0,
            last_version_number: 0,
            content_size: 0,
            compressed_size: 0,
            updated_at: Utc::now(),
        }
    }
}

/// On-disk form of a [`SceneVersion`]; content is held compressed.
#[derive(Debug, Serialize, Deserialize)]
struct StoredVersion {
    id: VersionId,
    scene_id: SceneId,
    version_number: u64,
    label: String,
    content: CompressedSnapshot,
    word_count: usize,
    is_auto_save: bool,
    created_at: DateTime<Utc>,
}

impl StoredVersion {
    fn from_version(version: &SceneVersion) -> Self {
        Self {
            id: version.id,
            scene_id: version.scene_id,
            version_number: version.version_number,
            label: version.label.clone(),
            content: CompressedSnapshot::compress(&version.content),
            word_count: version.word_count,
            is_auto_save: version.is_auto_save,
            created_at: version.created_at,
        }
    }

    fn into_version(self) -> Result<SceneVersion, StoreError> {
        Ok(SceneVersion {
            id: self.id,
            scene_id: self.scene_id,
            version_number: self.version_number,
            label: self.label,
            content: self.content.decompress()?,
            word_count: self.word_count,
            is_auto_save: self.is_auto_save,
            created_at: self.created_at,
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

/// RocksDB-backed [`SceneRepository`].
#[derive(Clone)]
pub struct RocksStore {
    db: Arc<DBWithThreadMode<SingleThreaded>>,
    config: Arc<StoreConfig>,
    /// Serializes read-modify-write of metadata and the version conflict check.
    write_lock: Arc<Mutex<()>>,
    stats: Arc<Mutex<SnapshotStats>>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
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

        log::info!("Opened scene store at {}", config.path.display());

        Ok(Self {
            db: Arc::new(db),
            config: Arc::new(config),
            write_lock: Arc::new(Mutex::new(())),
            stats: Arc::new(Mutex::new(SnapshotStats::default())),
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
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SCENES => {
                // Values are already LZ4 compressed.
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_VERSIONS => {
                opts.set_compression_type(DBCompressionType::None);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── Scenes ───────────────────────────────────────────────────────

    pub fn load_scene(&self, scene_id: SceneId) -> Result<String, StoreError> {
        let cf = self.cf(CF_SCENES)?;
        match self.db.get_cf(cf, scene_id.as_bytes())? {
            Some(bytes) => CompressedSnapshot::from_bytes(bytes)?.decompress(),
            None => Err(StoreError::NotFound(scene_id)),
        }
    }

    pub fn save_scene(&self, scene_id: SceneId, content: &str) -> Result<SceneMetadata, StoreError> {
        let cf_scenes = self.cf(CF_SCENES)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let snapshot = CompressedSnapshot::compress(content);

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut meta = self.load_or_new_metadata(scene_id)?;
        meta.content_size = snapshot.original_size as u64;
        meta.compressed_size = snapshot.compressed_size() as u64;
        meta.updated_at = Utc::now();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_scenes, scene_id.as_bytes(), snapshot.as_bytes());
        batch.put_cf(cf_meta, scene_id.as_bytes(), encode(&meta)?);
        self.write(batch)?;

        self.record_snapshot(&snapshot);
        log::debug!(
            "Saved scene {scene_id}: {} → {} bytes",
            meta.content_size,
            meta.compressed_size
        );
        Ok(meta)
    }

    pub fn scene_exists(&self, scene_id: SceneId) -> Result<bool, StoreError> {
        let cf = self.cf(CF_SCENES)?;
        Ok(self.db.get_cf(cf, scene_id.as_bytes())?.is_some())
    }

    /// Every scene that has metadata.
    pub fn list_scenes(&self) -> Result<Vec<SceneId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Deserialization("invalid scene key".into()))?;
            ids.push(Uuid::from_bytes(bytes));
        }
        Ok(ids)
    }

    // ─── Versions ─────────────────────────────────────────────────────

    pub fn store_version(&self, version: &SceneVersion) -> Result<VersionId, StoreError> {
        let cf_versions = self.cf(CF_VERSIONS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let key = Self::version_key(version.scene_id, version.version_number);
        let stored = StoredVersion::from_version(version);

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.db.get_cf(cf_versions, &key)?.is_some() {
            return Err(StoreError::Conflict {
                scene_id: version.scene_id,
                version_number: version.version_number,
            });
        }

        let mut meta = self.load_or_new_metadata(version.scene_id)?;
        meta.version_count += 1;
        meta.last_version_number = meta.last_version_number.max(version.version_number);
        meta.updated_at = Utc::now();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_versions, &key, encode(&stored)?);
        batch.put_cf(cf_meta, version.scene_id.as_bytes(), encode(&meta)?);
        self.write(batch)?;

        self.record_snapshot(&stored.content);
        Ok(version.id)
    }

    /// Versions of a scene in ascending number order.
    pub fn load_versions(&self, scene_id: SceneId) -> Result<Vec<SceneVersion>, StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        let start = Self::version_key(scene_id, 0);

        let mut versions = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, value) = item?;
            if key.len() < 24 || &key[..16] != scene_id.as_bytes() {
                break;
            }
            let stored: StoredVersion = decode(&value)?;
            versions.push(stored.into_version()?);
        }
        Ok(versions)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn metadata(&self, scene_id: SceneId) -> Result<SceneMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, scene_id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(StoreError::NotFound(scene_id)),
        }
    }

    fn load_or_new_metadata(&self, scene_id: SceneId) -> Result<SceneMetadata, StoreError> {
        match self.metadata(scene_id) {
            Ok(meta) => Ok(meta),
            Err(StoreError::NotFound(_)) => Ok(SceneMetadata::new(scene_id)),
            Err(e) => Err(e),
        }
    }

    /// Compression totals for everything written since open.
    pub fn snapshot_stats(&self) -> SnapshotStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn flush(&self) -> Result<(), StoreError> {
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
            .ok_or_else(|| StoreError::Backend(format!("column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn record_snapshot(&self, snapshot: &CompressedSnapshot) {
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(snapshot);
    }

    /// scene_id (16 bytes) + version_number (8 bytes big-endian).
    fn version_key(scene_id: SceneId, version_number: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(scene_id.as_bytes());
        key.extend_from_slice(&version_number.to_be_bytes());
        key
    }
}

/// Run a store call on the blocking pool.
async fn blocking<T, F>(store: &RocksStore, call: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&RocksStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || call(&store))
        .await
        .map_err(|e| StoreError::Backend(format!("store task failed: {e}")))?
}

#[async_trait]
impl SceneRepository for RocksStore {
    async fn get(&self, scene_id: SceneId) -> Result<String, StoreError> {
        blocking(self, move |store| store.load_scene(scene_id)).await
    }

    async fn put(&self, scene_id: SceneId, content: &str) -> Result<(), StoreError> {
        let content = content.to_string();
        blocking(self, move |store| store.save_scene(scene_id, &content).map(|_| ())).await
    }

    async fn append_version(&self, version: &SceneVersion) -> Result<VersionId, StoreError> {
        let version = version.clone();
        blocking(self, move |store| store.store_version(&version)).await
    }

    async fn list_versions(&self, scene_id: SceneId) -> Result<Vec<SceneVersion>, StoreError> {
        blocking(self, move |store| store.load_versions(scene_id)).await
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
