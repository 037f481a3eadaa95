//! Scene content and version history on RocksDB, across store reopen.

#![cfg(feature = "rocksdb")]

use std::sync::Arc;
use std::time::Duration;

use folio_collab::autosave::SaveEvent;
use folio_collab::presence::Identity;
use folio_collab::session::SessionManager;
use folio_collab::storage::{RocksStore, SceneRepository, StoreConfig, StoreError};
use folio_collab::transport::LocalTransport;
use folio_collab::versions::VersionStore;
use folio_collab::CollabError;
use tempfile::tempdir;
use uuid::Uuid;

fn open(path: &std::path::Path) -> Arc<RocksStore> {
    Arc::new(RocksStore::open(StoreConfig::for_testing(path)).unwrap())
}

#[tokio::test]
async fn test_session_history_survives_reopen() {
    let dir = tempdir().unwrap();
    let scene = Uuid::new_v4();
    let (first_id, restored_content) = {
        let store = open(dir.path());
        store.save_scene(scene, "The storm came in low.").unwrap();

        let manager = SessionManager::with_debounce(
            Arc::new(LocalTransport::new()),
            store.clone(),
            Duration::from_millis(50),
        );
        let session = manager
            .connect(Uuid::new_v4(), Identity::new(Uuid::new_v4(), "Ana"))
            .await;
        let mut saves = session.on_save_event();

        session.open_scene(scene).await.unwrap();
        let first = session.manual_save("Draft 1").await.unwrap();
        session
            .auto_save("The storm came in low over the harbour.")
            .unwrap();

        // Wait for the debounced write.
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), saves.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(event, SaveEvent::Saved { .. }) {
                break;
            }
        }

        let outcome = session.restore_version(scene, first.id).await.unwrap();
        assert_eq!(outcome.safety_snapshot.version_number, 2);
        assert_eq!(
            outcome.safety_snapshot.content,
            "The storm came in low over the harbour."
        );
        assert_eq!(session.document().unwrap().content, "The storm came in low.");

        let restored = session.manual_save("After restore").await.unwrap();
        manager.disconnect_all().await;
        store.flush().unwrap();
        (first.id, restored.content)
    };

    let store = open(dir.path());
    assert_eq!(store.load_scene(scene).unwrap(), restored_content);

    let versions = VersionStore::new(store.clone());
    let history = versions.list_versions(scene).await.unwrap();
    let numbers: Vec<u64> = history.iter().map(|v| v.version_number).collect();
    assert_eq!(numbers, vec![3, 2, 1]);
    assert_eq!(history[1].label, "Auto-save before restore");
    assert!(history[1].is_auto_save);
    assert!(!history[2].is_auto_save);
    assert_eq!(versions.get_version(scene, first_id).await.unwrap().label, "Draft 1");

    // Numbering continues from the persisted maximum.
    let next = versions
        .save_version(scene, "Draft 2", "Reopened.", false)
        .await
        .unwrap();
    assert_eq!(next.version_number, 4);
    assert_eq!(store.metadata(scene).unwrap().last_version_number, 4);
}

#[tokio::test]
async fn test_duplicate_version_number_rejected() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    let scene = Uuid::new_v4();
    let versions = VersionStore::new(store.clone());

    let v1 = versions.save_version(scene, "One", "one", false).await.unwrap();
    let err = store.append_version(&v1).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict { version_number: 1, .. }));
    assert_eq!(store.list_versions(scene).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_scene_and_version() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    let scene = Uuid::new_v4();

    let manager = SessionManager::new(Arc::new(LocalTransport::new()), store.clone());
    let session = manager
        .connect(Uuid::new_v4(), Identity::new(Uuid::new_v4(), "Ana"))
        .await;
    assert!(matches!(
        session.open_scene(scene).await,
        Err(CollabError::Persistence(StoreError::NotFound(id))) if id == scene
    ));

    store.save_scene(scene, "exists now").unwrap();
    session.open_scene(scene).await.unwrap();
    let missing = Uuid::new_v4();
    assert!(matches!(
        session.restore_version(scene, missing).await,
        Err(CollabError::VersionNotFound { version_id, .. }) if version_id == missing
    ));
    // Nothing was snapshotted for the failed restore.
    assert!(session.list_versions(scene).await.unwrap().is_empty());
}
