//! Debounced persistence of open scenes.
//!
//! ```text
//!            record_edit                  timer fires
//!   Idle ───────────────► PendingSave ───────────────► Saving ──ok──► Idle
//!    ▲                      │  ▲   record_edit           │
//!    │                      └──┘   (re-arm timer)        └─err─► SaveFailed
//!    └──────────────────────────────────────────────────────────────┘
//!                                   record_edit
//! ```
//!
//! One timer per scene; each edit cancels and re-arms it. Every timer
//! carries the generation it was armed with and does nothing if the scene's
//! generation moved on (re-armed, manually saved, or closed) by the time it
//! wakes. One save per scene is in flight at a time: a per-scene write lock
//! serializes debounce saves and manual saves. The lock outlives the open
//! scene, so a save still running after `close_scene` also holds off saves
//! from a later reopen. An edit that lands while a save is in flight arms a
//! fresh window once that save finishes.
//!
//! Every open gets a new epoch. Timers and saves carry the epoch they were
//! started under and leave a slot from a later open alone.
//!
//! The scene map lock is never held across a storage call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use folio_core::{SceneDocument, SceneId, SceneVersion, WordCountTotals};

use crate::broadcast::Listeners;
use crate::error::{CollabError, Result};
use crate::storage::SceneRepository;
use crate::versions::VersionStore;

/// Quiet period after the last edit before the buffer is persisted.
pub const AUTOSAVE_DEBOUNCE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveState {
    Idle,
    PendingSave,
    Saving,
    SaveFailed,
}

/// Save notifications, pushed as they happen.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveEvent {
    Saved {
        scene_id: SceneId,
        word_count: usize,
        saved_at: DateTime<Utc>,
    },
    VersionCreated(SceneVersion),
    Failed {
        scene_id: SceneId,
        error: String,
    },
}

struct SceneSlot {
    document: SceneDocument,
    /// Word count of the content last persisted; the delta base for totals.
    saved_word_count: usize,
    state: SaveState,
    timer: Option<JoinHandle<()>>,
    epoch: u64,
    generation: u64,
    unsaved: bool,
    edited_while_saving: bool,
    last_error: Option<String>,
    write_lock: Arc<AsyncMutex<()>>,
}

impl SceneSlot {
    fn cancel_timer(&mut self) {
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// What a save needs, captured under the map lock.
struct SaveJob {
    scene_id: SceneId,
    epoch: u64,
    content: String,
    word_count: usize,
    previous_saved: usize,
}

struct Inner {
    me: Weak<Inner>,
    repository: Arc<dyn SceneRepository>,
    versions: Arc<VersionStore>,
    debounce: Duration,
    scenes: Mutex<HashMap<SceneId, SceneSlot>>,
    /// Per-scene write locks. Entries survive `close_scene` while a save
    /// still holds them.
    write_locks: Mutex<HashMap<SceneId, Arc<AsyncMutex<()>>>>,
    epochs: AtomicU64,
    totals: Mutex<WordCountTotals>,
    listeners: Listeners<SaveEvent>,
}

pub struct AutoSaveScheduler {
    inner: Arc<Inner>,
}

impl AutoSaveScheduler {
    pub fn new(repository: Arc<dyn SceneRepository>, versions: Arc<VersionStore>) -> Self {
        Self::with_debounce(repository, versions, AUTOSAVE_DEBOUNCE)
    }

    pub fn with_debounce(
        repository: Arc<dyn SceneRepository>,
        versions: Arc<VersionStore>,
        debounce: Duration,
    ) -> Self {
        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            repository,
            versions,
            debounce,
            scenes: Mutex::new(HashMap::new()),
            write_locks: Mutex::new(HashMap::new()),
            epochs: AtomicU64::new(0),
            totals: Mutex::new(WordCountTotals::default()),
            listeners: Listeners::new(),
        });
        Self { inner }
    }

    /// Load a scene into an editable buffer. Opening an open scene returns
    /// its current buffer.
    pub async fn open_scene(&self, scene_id: SceneId) -> Result<SceneDocument> {
        if let Some(slot) = self.inner.scenes().get(&scene_id) {
            return Ok(slot.document.clone());
        }

        let content = self.inner.repository.get(scene_id).await?;
        let document = SceneDocument::new(scene_id, content);

        let write_lock = self.inner.write_lock(scene_id);
        let epoch = self.inner.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        let mut scenes = self.inner.scenes();
        let slot = scenes.entry(scene_id).or_insert_with(|| SceneSlot {
            saved_word_count: document.word_count,
            document,
            state: SaveState::Idle,
            timer: None,
            epoch,
            generation: 0,
            unsaved: false,
            edited_while_saving: false,
            last_error: None,
            write_lock,
        });
        log::debug!("Opened scene {scene_id} ({} words)", slot.document.word_count);
        Ok(slot.document.clone())
    }

    /// Replace the buffer and (re)start the debounce window.
    pub fn record_edit(&self, scene_id: SceneId, content: impl Into<String>) -> Result<usize> {
        let mut scenes = self.inner.scenes();
        let slot = scenes
            .get_mut(&scene_id)
            .ok_or(CollabError::SceneNotOpen(scene_id))?;

        slot.document.set_content(content);
        slot.unsaved = true;
        if slot.state == SaveState::Saving {
            slot.edited_while_saving = true;
        } else {
            self.inner.arm(scene_id, slot);
        }
        Ok(slot.document.word_count)
    }

    /// Save now and record a labelled version.
    ///
    /// The label is checked before anything is written. Waits for an
    /// in-flight save of the same scene rather than running beside it.
    pub async fn manual_save(&self, scene_id: SceneId, label: &str) -> Result<SceneVersion> {
        if label.trim().is_empty() {
            return Err(CollabError::validation("version label must not be empty"));
        }

        let (write_lock, epoch) = {
            let mut scenes = self.inner.scenes();
            let slot = scenes
                .get_mut(&scene_id)
                .ok_or(CollabError::SceneNotOpen(scene_id))?;
            slot.cancel_timer();
            (slot.write_lock.clone(), slot.epoch)
        };
        let guard = write_lock.lock_owned().await;

        let job = {
            let mut scenes = self.inner.scenes();
            let slot = scenes
                .get_mut(&scene_id)
                .filter(|slot| slot.epoch == epoch)
                .ok_or(CollabError::SceneNotOpen(scene_id))?;
            // A debounce save that finished while we waited may have re-armed.
            slot.cancel_timer();
            Inner::begin_save(scene_id, slot)
        };

        self.inner.persist(&job, guard).await?;
        let version = self
            .inner
            .versions
            .save_version(scene_id, label, &job.content, false)
            .await?;
        self.inner.listeners.emit(&SaveEvent::VersionCreated(version.clone()));
        Ok(version)
    }

    /// Stop tracking a scene. A pending debounce never fires; unsaved edits
    /// are dropped with the buffer, which is returned.
    pub fn close_scene(&self, scene_id: SceneId) -> Option<SceneDocument> {
        let mut slot = self.inner.scenes().remove(&scene_id)?;
        slot.cancel_timer();
        if slot.unsaved {
            log::debug!("Closed scene {scene_id} with unsaved edits");
        }
        let SceneSlot { document, write_lock, .. } = slot;
        drop(write_lock);
        self.inner.release_write_lock(scene_id);
        Some(document)
    }

    /// Close every open scene.
    pub fn close_all(&self) -> usize {
        let closed: Vec<SceneId> = {
            let mut scenes = self.inner.scenes();
            scenes
                .drain()
                .map(|(scene_id, mut slot)| {
                    slot.cancel_timer();
                    scene_id
                })
                .collect()
        };
        for scene_id in &closed {
            self.inner.release_write_lock(*scene_id);
        }
        closed.len()
    }

    pub fn state(&self, scene_id: SceneId) -> Option<SaveState> {
        self.inner.scenes().get(&scene_id).map(|s| s.state)
    }

    pub fn document(&self, scene_id: SceneId) -> Option<SceneDocument> {
        self.inner.scenes().get(&scene_id).map(|s| s.document.clone())
    }

    pub fn has_unsaved_changes(&self, scene_id: SceneId) -> bool {
        self.inner.scenes().get(&scene_id).is_some_and(|s| s.unsaved)
    }

    pub fn last_error(&self, scene_id: SceneId) -> Option<String> {
        self.inner
            .scenes()
            .get(&scene_id)
            .and_then(|s| s.last_error.clone())
    }

    pub fn is_open(&self, scene_id: SceneId) -> bool {
        self.inner.scenes().contains_key(&scene_id)
    }

    pub fn on_save_event(&self) -> mpsc::UnboundedReceiver<SaveEvent> {
        self.inner.listeners.subscribe()
    }

    // ─── Word-count aggregate ─────────────────────────────────────────

    pub fn word_count_total(&self) -> usize {
        self.inner.totals().total()
    }

    /// Start the running total from an authoritative figure.
    pub fn seed_word_count_total(&self, total: usize) {
        self.inner.totals().seed(total);
    }

    pub fn needs_reconcile(&self) -> bool {
        self.inner.totals().needs_reconcile()
    }

    /// Replace the running total with a full recount. Returns the drift.
    pub fn reconcile_word_count(&self, recount: usize) -> i64 {
        self.inner.totals().reconcile(recount)
    }

    pub fn debounce(&self) -> Duration {
        self.inner.debounce
    }
}

impl Drop for AutoSaveScheduler {
    fn drop(&mut self) {
        self.close_all();
    }
}

impl Inner {
    fn scenes(&self) -> MutexGuard<'_, HashMap<SceneId, SceneSlot>> {
        self.scenes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn totals(&self) -> MutexGuard<'_, WordCountTotals> {
        self.totals.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_lock(&self, scene_id: SceneId) -> Arc<AsyncMutex<()>> {
        self.write_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(scene_id)
            .or_default()
            .clone()
    }

    /// Forget a scene's write lock once no slot or save holds it.
    fn release_write_lock(&self, scene_id: SceneId) {
        if self.scenes().contains_key(&scene_id) {
            return;
        }
        let mut locks = self.write_locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(&scene_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&scene_id);
        }
    }

    fn arm(&self, scene_id: SceneId, slot: &mut SceneSlot) {
        slot.cancel_timer();
        let (epoch, generation) = (slot.epoch, slot.generation);
        let me = self.me.clone();
        let debounce = self.debounce;
        slot.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Some(inner) = me.upgrade() {
                inner.fire(scene_id, epoch, generation).await;
            }
        }));
        slot.state = SaveState::PendingSave;
    }

    async fn fire(&self, scene_id: SceneId, epoch: u64, generation: u64) {
        let (job, guard) = {
            let mut scenes = self.scenes();
            let Some(slot) = scenes.get_mut(&scene_id) else {
                return;
            };
            if slot.epoch != epoch || slot.generation != generation {
                return;
            }
            // This task is the timer; drop its handle without aborting.
            slot.timer = None;
            let Ok(guard) = slot.write_lock.clone().try_lock_owned() else {
                // Coalesce into whatever save is running.
                slot.edited_while_saving = true;
                return;
            };
            (Self::begin_save(scene_id, slot), guard)
        };

        if let Err(e) = self.persist(&job, guard).await {
            log::warn!("Autosave of scene {scene_id} failed: {e}");
        }
    }

    fn begin_save(scene_id: SceneId, slot: &mut SceneSlot) -> SaveJob {
        slot.state = SaveState::Saving;
        slot.edited_while_saving = false;
        SaveJob {
            scene_id,
            epoch: slot.epoch,
            content: slot.document.content.clone(),
            word_count: slot.document.word_count,
            previous_saved: slot.saved_word_count,
        }
    }

    /// Write the job's content and settle the slot. Holds the scene's write
    /// lock for the duration. A slot from a later open is not touched.
    async fn persist(&self, job: &SaveJob, guard: OwnedMutexGuard<()>) -> Result<()> {
        let scene_id = job.scene_id;
        let result = self.repository.put(scene_id, &job.content).await;
        let saved_at = Utc::now();

        if result.is_ok() {
            let mut totals = self.totals();
            totals.record_save(job.previous_saved, job.word_count);
            if totals.needs_reconcile() {
                log::debug!("Word-count total due for reconciliation");
            }
        }

        {
            let mut scenes = self.scenes();
            if let Some(slot) = scenes.get_mut(&scene_id).filter(|slot| slot.epoch == job.epoch) {
                match &result {
                    Ok(()) => {
                        slot.saved_word_count = job.word_count;
                        slot.document.mark_saved(saved_at);
                        slot.unsaved = slot.edited_while_saving;
                        slot.last_error = None;
                        slot.state = SaveState::Idle;
                    }
                    Err(e) => {
                        slot.last_error = Some(e.to_string());
                        slot.state = SaveState::SaveFailed;
                    }
                }
                if slot.edited_while_saving {
                    slot.edited_while_saving = false;
                    self.arm(scene_id, slot);
                }
            }
        }
        drop(guard);
        self.release_write_lock(scene_id);

        match result {
            Ok(()) => {
                log::debug!("Saved scene {scene_id} ({} words)", job.word_count);
                self.listeners.emit(&SaveEvent::Saved {
                    scene_id,
                    word_count: job.word_count,
                    saved_at,
                });
                Ok(())
            }
            Err(e) => {
                self.listeners.emit(&SaveEvent::Failed {
                    scene_id,
                    error: e.to_string(),
                });
                Err(e.into())
            }
        }
    }
}
