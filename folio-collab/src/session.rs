//! Composition root: one [`DocumentSession`] per open manuscript document.
//!
//! ```text
//! SessionManager ── arena: DocumentId → Arc<DocumentSession>
//!                                   │
//!       ┌───────────────────────────┼────────────────────────┐
//!       ▼                           ▼                        ▼
//! PresenceChannel ── EventBroadcaster        AutoSaveScheduler ── VersionStore
//!       │  (same channel link)                      │                 │
//!       ▼                                           ▼                 ▼
//!   Transport                                   SceneRepository (shared)
//! ```
//!
//! A session that cannot reach the channel keeps working as a single-user
//! editor; only presence and events are lost.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};

use folio_core::{DocumentId, SceneDocument, SceneId, SceneVersion, VersionId};

use crate::autosave::{AutoSaveScheduler, SaveEvent, SaveState, AUTOSAVE_DEBOUNCE};
use crate::error::{CollabError, Result};
use crate::events::{CollaborationEvent, EventBroadcaster, EventKind, EventStats};
use crate::presence::{CollaboratorPresence, Identity, PresenceChange, PresenceChannel};
use crate::storage::SceneRepository;
use crate::transport::Transport;
use crate::versions::{RestoreOutcome, VersionStore};

/// Owns every open document session.
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    repository: Arc<dyn SceneRepository>,
    versions: Arc<VersionStore>,
    debounce: Duration,
    sessions: RwLock<HashMap<DocumentId, Arc<DocumentSession>>>,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn Transport>, repository: Arc<dyn SceneRepository>) -> Self {
        Self::with_debounce(transport, repository, AUTOSAVE_DEBOUNCE)
    }

    pub fn with_debounce(
        transport: Arc<dyn Transport>,
        repository: Arc<dyn SceneRepository>,
        debounce: Duration,
    ) -> Self {
        let versions = Arc::new(VersionStore::new(repository.clone()));
        Self {
            transport,
            repository,
            versions,
            debounce,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Session for `document_id`, created and joined on first use.
    ///
    /// Never fails: a channel that cannot be joined leaves the session in
    /// solo mode (see [`DocumentSession::is_collaborative`]). The channel is
    /// joined without holding the arena lock, so a slow relay only delays
    /// this document. An existing session keeps the identity it was opened
    /// with.
    pub async fn connect(&self, document_id: DocumentId, identity: Identity) -> Arc<DocumentSession> {
        if let Some(session) = self.sessions.read().await.get(&document_id) {
            warn_identity_mismatch(session, &identity);
            return session.clone();
        }

        let session = Arc::new(DocumentSession::new(
            document_id,
            identity,
            self.transport.clone(),
            self.repository.clone(),
            self.versions.clone(),
            self.debounce,
        ));
        session.join_channel().await;

        let winner = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(&document_id).cloned() {
                Some(existing) => existing,
                None => {
                    sessions.insert(document_id, session.clone());
                    return session;
                }
            }
        };

        // Another connect for the same document finished first.
        log::debug!("Document {document_id}: concurrent connect, keeping the first session");
        warn_identity_mismatch(&winner, session.identity());
        session.disconnect().await;
        winner
    }

    /// Tear down a session: leave the channel, cancel pending autosaves.
    /// Returns false if there was no such session.
    pub async fn disconnect(&self, document_id: DocumentId) -> bool {
        let removed = self.sessions.write().await.remove(&document_id);
        match removed {
            Some(session) => {
                session.disconnect().await;
                true
            }
            None => false,
        }
    }

    pub async fn disconnect_all(&self) -> usize {
        let drained: Vec<_> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.disconnect().await;
        }
        drained.len()
    }

    pub async fn get(&self, document_id: DocumentId) -> Option<Arc<DocumentSession>> {
        self.sessions.read().await.get(&document_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub fn versions(&self) -> &Arc<VersionStore> {
        &self.versions
    }
}

fn warn_identity_mismatch(session: &DocumentSession, requested: &Identity) {
    let current = session.identity();
    if current.user_id != requested.user_id {
        log::warn!(
            "Document {} is open for {} ({}); ignoring connect as {} ({})",
            session.document_id(),
            current.display_name,
            current.user_id,
            requested.display_name,
            requested.user_id
        );
    }
}

/// Everything one open document needs: presence, events, autosave, versions.
pub struct DocumentSession {
    document_id: DocumentId,
    transport: Arc<dyn Transport>,
    events: Arc<EventBroadcaster>,
    presence: PresenceChannel,
    scheduler: AutoSaveScheduler,
    versions: Arc<VersionStore>,
    closed: AtomicBool,
    active_scene: Mutex<Option<SceneId>>,
}

impl DocumentSession {
    fn new(
        document_id: DocumentId,
        identity: Identity,
        transport: Arc<dyn Transport>,
        repository: Arc<dyn SceneRepository>,
        versions: Arc<VersionStore>,
        debounce: Duration,
    ) -> Self {
        let events = Arc::new(EventBroadcaster::new(identity.user_id));
        let presence = PresenceChannel::new(identity, events.clone());
        let scheduler = AutoSaveScheduler::with_debounce(repository, versions.clone(), debounce);
        Self {
            document_id,
            transport,
            events,
            presence,
            scheduler,
            versions,
            closed: AtomicBool::new(false),
            active_scene: Mutex::new(None),
        }
    }

    async fn join_channel(&self) {
        if let Err(e) = self.presence.connect(self.transport.as_ref(), self.document_id).await {
            log::warn!(
                "Document {}: collaboration unavailable, editing solo: {e}",
                self.document_id
            );
        }
    }

    /// Try joining the channel again after a transport failure or a lost
    /// connection.
    pub async fn reconnect(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CollabError::transport("session is disconnected"));
        }
        self.presence
            .connect(self.transport.as_ref(), self.document_id)
            .await
    }

    /// Leave the channel and drop every open scene. Pending autosaves are
    /// cancelled, not flushed. Idempotent.
    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.presence.disconnect().await {
            log::warn!("Document {}: leaving channel failed: {e}", self.document_id);
        }
        let dropped = self.scheduler.close_all();
        self.set_active(None);
        log::info!(
            "Document {} disconnected ({dropped} scenes closed)",
            self.document_id
        );
    }

    // ─── Presence & events ────────────────────────────────────────────

    pub async fn update_cursor(&self, position: u64) -> Result<()> {
        self.presence.update_cursor(position).await
    }

    pub async fn update_selection(&self, from: u64, to: u64) -> Result<()> {
        self.presence.update_selection(from, to).await
    }

    pub async fn broadcast_event(&self, kind: EventKind, payload: Vec<u8>) -> Result<()> {
        self.events.broadcast_event(kind, payload).await
    }

    pub fn on_presence_change(&self) -> mpsc::UnboundedReceiver<PresenceChange> {
        self.presence.on_presence_change()
    }

    pub fn on_event(&self) -> mpsc::UnboundedReceiver<CollaborationEvent> {
        self.events.on_event()
    }

    pub fn roster(&self) -> Vec<CollaboratorPresence> {
        self.presence.roster()
    }

    pub fn event_stats(&self) -> EventStats {
        self.events.stats()
    }

    // ─── Scenes ───────────────────────────────────────────────────────

    /// Make `scene_id` the scene being edited. The previously open scene is
    /// closed and its pending autosave cancelled.
    pub async fn open_scene(&self, scene_id: SceneId) -> Result<SceneDocument> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CollabError::transport("session is disconnected"));
        }
        if let Some(previous) = self.active_scene() {
            if previous != scene_id {
                self.scheduler.close_scene(previous);
                self.set_active(None);
            }
        }
        let document = self.scheduler.open_scene(scene_id).await?;
        self.set_active(Some(scene_id));
        Ok(document)
    }

    pub fn close_scene(&self) -> Option<SceneDocument> {
        let scene_id = self.active_scene()?;
        self.set_active(None);
        self.scheduler.close_scene(scene_id)
    }

    /// Record new content for the open scene. Returns its word count.
    pub fn auto_save(&self, content: impl Into<String>) -> Result<usize> {
        let scene_id = self.require_active()?;
        self.scheduler.record_edit(scene_id, content)
    }

    /// Save the open scene now and create a labelled version.
    pub async fn manual_save(&self, label: &str) -> Result<SceneVersion> {
        let scene_id = self.require_active()?;
        self.scheduler.manual_save(scene_id, label).await
    }

    pub async fn list_versions(&self, scene_id: SceneId) -> Result<Vec<SceneVersion>> {
        self.versions.list_versions(scene_id).await
    }

    pub async fn get_version(&self, scene_id: SceneId, version_id: VersionId) -> Result<SceneVersion> {
        self.versions.get_version(scene_id, version_id).await
    }

    /// Restore a version of the open scene.
    ///
    /// The current buffer is snapshotted first; the restored text then
    /// replaces the buffer as an ordinary edit and is autosaved.
    pub async fn restore_version(&self, scene_id: SceneId, version_id: VersionId) -> Result<RestoreOutcome> {
        if self.active_scene() != Some(scene_id) {
            return Err(CollabError::SceneNotOpen(scene_id));
        }
        let current = self
            .scheduler
            .document(scene_id)
            .ok_or(CollabError::SceneNotOpen(scene_id))?;

        let outcome = self
            .versions
            .restore_version(scene_id, version_id, &current.content)
            .await?;
        self.scheduler
            .record_edit(scene_id, outcome.target.content.clone())?;
        Ok(outcome)
    }

    pub fn on_save_event(&self) -> mpsc::UnboundedReceiver<SaveEvent> {
        self.scheduler.on_save_event()
    }

    pub fn document(&self) -> Option<SceneDocument> {
        self.scheduler.document(self.active_scene()?)
    }

    pub fn save_state(&self) -> Option<SaveState> {
        self.scheduler.state(self.active_scene()?)
    }

    // ─── Word counts ──────────────────────────────────────────────────

    pub fn word_count_total(&self) -> usize {
        self.scheduler.word_count_total()
    }

    pub fn seed_word_count_total(&self, total: usize) {
        self.scheduler.seed_word_count_total(total);
    }

    pub fn needs_reconcile(&self) -> bool {
        self.scheduler.needs_reconcile()
    }

    pub fn reconcile_word_count(&self, recount: usize) -> i64 {
        self.scheduler.reconcile_word_count(recount)
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn identity(&self) -> &Identity {
        self.presence.identity()
    }

    /// False while editing solo: the channel was never reached, or its
    /// connection has since been lost.
    pub fn is_collaborative(&self) -> bool {
        self.presence.is_live()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn active_scene(&self) -> Option<SceneId> {
        *self.active_scene.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_active(&self, scene_id: Option<SceneId>) {
        *self.active_scene.lock().unwrap_or_else(|e| e.into_inner()) = scene_id;
    }

    fn require_active(&self) -> Result<SceneId> {
        self.active_scene().ok_or(CollabError::NoActiveScene)
    }
}
