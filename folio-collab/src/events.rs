//! Ephemeral collaboration events (cursor moves, selection changes).
//!
//! Events ride the same channel subscription as presence. They are
//! fire-and-forget: at-most-once, unordered, never persisted, never used to
//! rebuild content. The relay echoes every event back to its sender, so the
//! receiving side drops anything stamped with the local user id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use folio_core::UserId;

use crate::broadcast::Listeners;
use crate::error::{CollabError, Result};
use crate::transport::ChannelLink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    CursorMove,
    SelectionChange,
    ContentUpdate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationEvent {
    pub kind: EventKind,
    pub origin_user_id: UserId,
    /// Opaque to this crate.
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl CollaborationEvent {
    pub fn new(kind: EventKind, origin_user_id: UserId, payload: Vec<u8>) -> Self {
        Self {
            kind,
            origin_user_id,
            payload,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventStats {
    pub sent: u64,
    pub delivered: u64,
    pub suppressed: u64,
}

/// Publishes local events and delivers remote ones.
pub struct EventBroadcaster {
    local_user_id: UserId,
    link: RwLock<Option<Arc<dyn ChannelLink>>>,
    listeners: Listeners<CollaborationEvent>,
    sent: AtomicU64,
    delivered: AtomicU64,
    suppressed: AtomicU64,
}

impl EventBroadcaster {
    pub fn new(local_user_id: UserId) -> Self {
        Self {
            local_user_id,
            link: RwLock::new(None),
            listeners: Listeners::new(),
            sent: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Route outbound events through `link` until [`detach`](Self::detach).
    pub fn attach(&self, link: Arc<dyn ChannelLink>) {
        *self.link.write().unwrap_or_else(|e| e.into_inner()) = Some(link);
    }

    pub fn detach(&self) {
        self.link.write().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub fn is_attached(&self) -> bool {
        self.link.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Stamp and publish an event. Not retried on failure.
    pub async fn broadcast_event(&self, kind: EventKind, payload: Vec<u8>) -> Result<()> {
        let link = self
            .link
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| CollabError::transport("not connected to a collaboration channel"))?;

        let event = CollaborationEvent::new(kind, self.local_user_id, payload);
        log::trace!("Broadcasting {:?} ({} bytes)", event.kind, event.payload.len());
        link.broadcast(event).await?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Handle an event that arrived on the channel. Returns true when it was
    /// delivered, false when it was our own echo.
    pub fn receive(&self, event: CollaborationEvent) -> bool {
        if event.origin_user_id == self.local_user_id {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.listeners.emit(&event);
        true
    }

    /// Stream of remote events. Each subscriber gets every event once.
    pub fn on_event(&self) -> mpsc::UnboundedReceiver<CollaborationEvent> {
        self.listeners.subscribe()
    }

    pub fn stats(&self) -> EventStats {
        EventStats {
            sent: self.sent.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
        }
    }

    pub fn local_user_id(&self) -> UserId {
        self.local_user_id
    }
}
