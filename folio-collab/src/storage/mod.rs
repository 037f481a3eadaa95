//! Scene persistence.
//!
//! ```text
//! ┌──────────────────┐  get / put       ┌──────────────────────────────┐
//! │ AutoSaveScheduler│ ───────────────► │ SceneRepository              │
//! └──────────────────┘                  │   MemoryStore  (in-process)  │
//! ┌──────────────────┐  append / list   │   RocksStore   (RocksDB)     │
//! │ VersionStore     │ ───────────────► │     CF "scenes"   content    │
//! └──────────────────┘                  │     CF "versions" snapshots  │
//!                                       │     CF "metadata" counters   │
//!                                       └──────────────────────────────┘
//! ```
//!
//! Repositories store what they are given. Version numbering and labels are
//! decided by [`crate::versions::VersionStore`]; a repository only refuses a
//! version number that already exists for the scene.

pub mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocks;
pub mod snapshot;

use async_trait::async_trait;
use thiserror::Error;

use folio_core::{SceneId, SceneVersion, VersionId};

pub use memory::MemoryStore;
#[cfg(feature = "rocksdb")]
pub use rocks::{RocksStore, SceneMetadata, StoreConfig};
pub use snapshot::{CompressedSnapshot, SnapshotStats};

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("scene not found: {0}")]
    NotFound(SceneId),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("version {version_number} already exists for scene {scene_id}")]
    Conflict {
        scene_id: SceneId,
        version_number: u64,
    },
}

#[cfg(feature = "rocksdb")]
impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Durable storage for scene content and the version log.
#[async_trait]
pub trait SceneRepository: Send + Sync {
    /// Current persisted content of a scene.
    async fn get(&self, scene_id: SceneId) -> Result<String, StoreError>;

    /// Overwrite the persisted content of a scene.
    async fn put(&self, scene_id: SceneId, content: &str) -> Result<(), StoreError>;

    /// Append an immutable version. Fails with [`StoreError::Conflict`] if the
    /// version number is taken.
    async fn append_version(&self, version: &SceneVersion) -> Result<VersionId, StoreError>;

    /// All versions of a scene, in no particular order.
    async fn list_versions(&self, scene_id: SceneId) -> Result<Vec<SceneVersion>, StoreError>;
}
