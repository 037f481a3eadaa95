use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use folio_core::{SceneId, SceneVersion, VersionId};

use super::{SceneRepository, StoreError};

/// In-memory scene repository.
///
/// Used for tests and for editors that keep everything in process. Counts
/// writes so callers can check how many saves actually reached storage.
#[derive(Default)]
pub struct MemoryStore {
    scenes: RwLock<HashMap<SceneId, String>>,
    versions: RwLock<HashMap<SceneId, Vec<SceneVersion>>>,
    puts: AtomicU64,
    appends: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a scene's content without counting it as a save.
    pub async fn insert_scene(&self, scene_id: SceneId, content: impl Into<String>) {
        self.scenes.write().await.insert(scene_id, content.into());
    }

    /// Number of `put` calls that succeeded.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Number of `append_version` calls that succeeded.
    pub fn append_count(&self) -> u64 {
        self.appends.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SceneRepository for MemoryStore {
    async fn get(&self, scene_id: SceneId) -> Result<String, StoreError> {
        self.scenes
            .read()
            .await
            .get(&scene_id)
            .cloned()
            .ok_or(StoreError::NotFound(scene_id))
    }

    async fn put(&self, scene_id: SceneId, content: &str) -> Result<(), StoreError> {
        self.scenes.write().await.insert(scene_id, content.to_string());
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn append_version(&self, version: &SceneVersion) -> Result<VersionId, StoreError> {
        let mut versions = self.versions.write().await;
        let log = versions.entry(version.scene_id).or_default();
        if log.iter().any(|v| v.version_number == version.version_number) {
            return Err(StoreError::Conflict {
                scene_id: version.scene_id,
                version_number: version.version_number,
            });
        }
        log.push(version.clone());
        self.appends.fetch_add(1, Ordering::Relaxed);
        Ok(version.id)
    }

    async fn list_versions(&self, scene_id: SceneId) -> Result<Vec<SceneVersion>, StoreError> {
        Ok(self
            .versions
            .read()
            .await
            .get(&scene_id)
            .cloned()
            .unwrap_or_default())
    }
}
