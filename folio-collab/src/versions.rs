//! Append-only version log per scene, with a restore that never loses work.
//!
//! Numbering is `max(existing) + 1`, computed and written under a per-scene
//! async lock. Scenes never contend with each other: the lock map is only
//! held long enough to fetch the scene's lock, and a scene's entry is
//! dropped once nobody holds or waits on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use folio_core::{SceneId, SceneVersion, VersionId, AUTOSAVE_LABEL, RESTORE_SAFETY_LABEL};

use crate::error::{CollabError, Result};
use crate::storage::SceneRepository;

/// Result of a restore: the version to apply, and the snapshot taken of the
/// buffer it replaces.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreOutcome {
    pub target: SceneVersion,
    pub safety_snapshot: SceneVersion,
}

pub struct VersionStore {
    repository: Arc<dyn SceneRepository>,
    scene_locks: Mutex<HashMap<SceneId, Arc<AsyncMutex<()>>>>,
}

impl VersionStore {
    pub fn new(repository: Arc<dyn SceneRepository>) -> Self {
        Self {
            repository,
            scene_locks: Mutex::new(HashMap::new()),
        }
    }

    fn scene_locks(&self) -> std::sync::MutexGuard<'_, HashMap<SceneId, Arc<AsyncMutex<()>>>> {
        self.scene_locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn lock_scene(&self, scene_id: SceneId) -> SceneTurn<'_> {
        let lock = self.scene_locks().entry(scene_id).or_default().clone();
        SceneTurn {
            store: self,
            scene_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Append a snapshot of `content`.
    ///
    /// A blank label is rejected for manual saves and replaced with
    /// `"Auto-save"` for automatic ones. Nothing is written on rejection.
    pub async fn save_version(
        &self,
        scene_id: SceneId,
        label: &str,
        content: &str,
        is_auto_save: bool,
    ) -> Result<SceneVersion> {
        let label = label.trim();
        let label = match (label.is_empty(), is_auto_save) {
            (false, _) => label,
            (true, true) => AUTOSAVE_LABEL,
            (true, false) => return Err(CollabError::validation("version label must not be empty")),
        };

        let _turn = self.lock_scene(scene_id).await;

        let next = self
            .repository
            .list_versions(scene_id)
            .await?
            .iter()
            .map(|v| v.version_number)
            .max()
            .unwrap_or(0)
            + 1;

        let version = SceneVersion::new(scene_id, next, label, content, is_auto_save);
        self.repository.append_version(&version).await?;
        log::debug!(
            "Scene {scene_id}: version {next} \"{}\" ({} words)",
            version.label,
            version.word_count
        );
        Ok(version)
    }

    /// Newest first.
    pub async fn list_versions(&self, scene_id: SceneId) -> Result<Vec<SceneVersion>> {
        let mut versions = self.repository.list_versions(scene_id).await?;
        versions.sort_by(|a, b| b.version_number.cmp(&a.version_number));
        Ok(versions)
    }

    pub async fn get_version(&self, scene_id: SceneId, version_id: VersionId) -> Result<SceneVersion> {
        self.repository
            .list_versions(scene_id)
            .await?
            .into_iter()
            .find(|v| v.id == version_id)
            .ok_or(CollabError::VersionNotFound { scene_id, version_id })
    }

    /// Snapshot `current_content`, then hand back the target version.
    ///
    /// The snapshot is taken even when the target equals the current
    /// content. An unknown target fails before anything is written. The
    /// caller's buffer is not touched.
    pub async fn restore_version(
        &self,
        scene_id: SceneId,
        version_id: VersionId,
        current_content: &str,
    ) -> Result<RestoreOutcome> {
        let target = self.get_version(scene_id, version_id).await?;
        let safety_snapshot = self
            .save_version(scene_id, RESTORE_SAFETY_LABEL, current_content, true)
            .await?;
        log::info!(
            "Scene {scene_id}: restoring version {} (safety snapshot {})",
            target.version_number,
            safety_snapshot.version_number
        );
        Ok(RestoreOutcome { target, safety_snapshot })
    }
}

/// Signed word difference between a version and the live buffer.
pub fn diff_word_count(version: &SceneVersion, current_word_count: usize) -> i64 {
    version.word_count_diff(current_word_count)
}

/// Exclusive numbering rights for one scene.
struct SceneTurn<'a> {
    store: &'a VersionStore,
    scene_id: SceneId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SceneTurn<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.store.scene_locks();
        if locks
            .get(&self.scene_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.scene_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, StoreError};
    use uuid::Uuid;

    fn store() -> (Arc<MemoryStore>, VersionStore) {
        let repo = Arc::new(MemoryStore::new());
        (repo.clone(), VersionStore::new(repo))
    }

    #[tokio::test]
    async fn test_numbers_start_at_one() {
        let (_, versions) = store();
        let scene = Uuid::new_v4();
        let v1 = versions.save_version(scene, "First", "a b", false).await.unwrap();
        let v2 = versions.save_version(scene, "Second", "a b c", false).await.unwrap();
        assert_eq!(v1.version_number, 1);
        assert_eq!(v2.version_number, 2);
        assert_eq!(v2.word_count, 3);
    }

    #[tokio::test]
    async fn test_blank_manual_label_rejected_before_write() {
        let (repo, versions) = store();
        let scene = Uuid::new_v4();
        let err = versions.save_version(scene, "   ", "text", false).await.unwrap_err();
        assert!(matches!(err, CollabError::Validation(_)));
        assert_eq!(repo.append_count(), 0);
    }

    #[tokio::test]
    async fn test_blank_auto_label_defaulted() {
        let (_, versions) = store();
        let v = versions.save_version(Uuid::new_v4(), "", "text", true).await.unwrap();
        assert_eq!(v.label, "Auto-save");
        assert!(v.is_auto_save);
    }

    #[tokio::test]
    async fn test_label_trimmed() {
        let (_, versions) = store();
        let v = versions
            .save_version(Uuid::new_v4(), "  Chapter end  ", "text", false)
            .await
            .unwrap();
        assert_eq!(v.label, "Chapter end");
    }

    #[tokio::test]
    async fn test_list_descending() {
        let (_, versions) = store();
        let scene = Uuid::new_v4();
        for label in ["one", "two", "three"] {
            versions.save_version(scene, label, label, false).await.unwrap();
        }
        let numbers: Vec<u64> = versions
            .list_versions(scene)
            .await
            .unwrap()
            .iter()
            .map(|v| v.version_number)
            .collect();
        assert_eq!(numbers, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_get_version_not_found() {
        let (_, versions) = store();
        let scene = Uuid::new_v4();
        let missing = Uuid::new_v4();
        match versions.get_version(scene, missing).await {
            Err(CollabError::VersionNotFound { scene_id, version_id }) => {
                assert_eq!(scene_id, scene);
                assert_eq!(version_id, missing);
            }
            other => panic!("Expected VersionNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_restore_snapshots_current_buffer() {
        let (_, versions) = store();
        let scene = Uuid::new_v4();
        let v1 = versions.save_version(scene, "Draft", "old words", false).await.unwrap();

        let outcome = versions
            .restore_version(scene, v1.id, "new words here")
            .await
            .unwrap();
        assert_eq!(outcome.target, v1);
        assert_eq!(outcome.safety_snapshot.version_number, 2);
        assert_eq!(outcome.safety_snapshot.label, "Auto-save before restore");
        assert_eq!(outcome.safety_snapshot.content, "new words here");
        assert!(outcome.safety_snapshot.is_auto_save);
    }

    #[tokio::test]
    async fn test_restore_latest_still_adds_one_version() {
        let (_, versions) = store();
        let scene = Uuid::new_v4();
        let v1 = versions.save_version(scene, "Only", "same", false).await.unwrap();

        versions.restore_version(scene, v1.id, "same").await.unwrap();
        assert_eq!(versions.list_versions(scene).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_restore_unknown_version_writes_nothing() {
        let (repo, versions) = store();
        let scene = Uuid::new_v4();
        versions.save_version(scene, "Draft", "x", false).await.unwrap();

        let result = versions.restore_version(scene, Uuid::new_v4(), "y").await;
        assert!(matches!(result, Err(CollabError::VersionNotFound { .. })));
        assert_eq!(repo.append_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_saves_are_gapless() {
        let (_, versions) = store();
        let versions = Arc::new(versions);
        let scenes: Vec<SceneId> = (0..3).map(|_| Uuid::new_v4()).collect();

        let mut handles = Vec::new();
        for i in 0..60 {
            let versions = versions.clone();
            let scene = scenes[i % scenes.len()];
            handles.push(tokio::spawn(async move {
                versions
                    .save_version(scene, &format!("v{i}"), "text", i % 2 == 0)
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(versions.scene_locks().is_empty());

        for scene in scenes {
            let mut numbers: Vec<u64> = versions
                .list_versions(scene)
                .await
                .unwrap()
                .iter()
                .map(|v| v.version_number)
                .collect();
            numbers.reverse();
            assert_eq!(numbers, (1..=20).collect::<Vec<u64>>());
        }
    }

    #[test]
    fn test_diff_word_count() {
        let version = SceneVersion::new(Uuid::new_v4(), 1, "v", "one two three", false);
        assert_eq!(diff_word_count(&version, 5), -2);
        assert_eq!(diff_word_count(&version, 0), 3);
    }

    #[tokio::test]
    async fn test_scene_lock_dropped_after_save() {
        let (_, versions) = store();
        for _ in 0..10 {
            versions
                .save_version(Uuid::new_v4(), "Once", "text", false)
                .await
                .unwrap();
        }
        assert!(versions.scene_locks().is_empty());

    }

    struct BrokenStore;

    #[async_trait::async_trait]
    impl SceneRepository for BrokenStore {
        async fn get(&self, scene_id: SceneId) -> std::result::Result<String, StoreError> {
            Err(StoreError::NotFound(scene_id))
        }
        async fn put(&self, _: SceneId, _: &str) -> std::result::Result<(), StoreError> {
            Err(StoreError::Backend("disk full".into()))
        }
        async fn append_version(&self, _: &SceneVersion) -> std::result::Result<VersionId, StoreError> {
            Err(StoreError::Backend("disk full".into()))
        }
        async fn list_versions(&self, _: SceneId) -> std::result::Result<Vec<SceneVersion>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_scene_lock_dropped_after_failed_save() {
        let versions = VersionStore::new(Arc::new(BrokenStore));
        let scene = Uuid::new_v4();
        assert!(versions.save_version(scene, "Lost", "text", false).await.is_err());
        assert!(versions.scene_locks().is_empty());
    }
}
