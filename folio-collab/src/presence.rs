//! Who else is in this document, and where their cursor is.
//!
//! ```text
//! update_cursor(42)
//!       │
//!       ▼
//! ChannelLink::track(presence) ──► channel "document:<id>"
//!                                        │ PresenceJoin / PresenceSync / PresenceLeave
//!                                        ▼
//!                              remote dispatch task
//!                                        │
//!                                        ▼
//!                         PresenceRoster::apply ──► PresenceChange stream
//! ```
//!
//! Presence is state, not a log: a late joiner learns everyone's current
//! cursor from the sync snapshot. The roster never holds the local user.
//!
//! If the inbound stream ends on its own (relay gone, socket reset) the
//! channel drops the connection, empties the roster and goes solo until the
//! next `connect`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use folio_core::{DocumentId, UserId};

use crate::broadcast::Listeners;
use crate::error::Result;
use crate::events::EventBroadcaster;
use crate::protocol::{document_channel, ChannelMessage};
use crate::transport::{ChannelLink, Transport};

/// Who the local user is, as handed over by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl Identity {
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            avatar_url: None,
        }
    }

    pub fn with_avatar(mut self, avatar_url: impl Into<String>) -> Self {
        self.avatar_url = Some(avatar_url.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub from: u64,
    pub to: u64,
}

impl SelectionRange {
    /// Orders the endpoints so that `from <= to`.
    pub fn new(a: u64, b: u64) -> Self {
        Self { from: a.min(b), to: a.max(b) }
    }

    pub fn is_collapsed(&self) -> bool {
        self.from == self.to
    }
}

/// Cursor colors, indexed by a hash of the user id.
pub const PRESENCE_PALETTE: [&str; 12] = [
    "#E57373", "#F06292", "#BA68C8", "#9575CD", "#7986CB", "#64B5F6",
    "#4DD0E1", "#4DB6AC", "#81C784", "#DCE775", "#FFB74D", "#A1887F",
];

/// Stable color for a user: FNV-1a over the id bytes, mod palette size.
pub fn presence_color(user_id: UserId) -> &'static str {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    let hash = user_id
        .as_bytes()
        .iter()
        .fold(FNV_OFFSET, |h, b| (h ^ *b as u32).wrapping_mul(FNV_PRIME));
    PRESENCE_PALETTE[hash as usize % PRESENCE_PALETTE.len()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaboratorPresence {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub cursor_position: Option<u64>,
    pub selection: Option<SelectionRange>,
    pub color: String,
    pub online_at: DateTime<Utc>,
}

impl CollaboratorPresence {
    pub fn from_identity(identity: &Identity) -> Self {
        Self {
            user_id: identity.user_id,
            display_name: identity.display_name.clone(),
            avatar_url: identity.avatar_url.clone(),
            cursor_position: None,
            selection: None,
            color: presence_color(identity.user_id).to_string(),
            online_at: Utc::now(),
        }
    }
}

/// A change to the roster, as seen by the local user.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceChange {
    /// The roster was replaced wholesale.
    Synced(Vec<CollaboratorPresence>),
    Joined(CollaboratorPresence),
    Updated(CollaboratorPresence),
    Left(UserId),
}

/// Remote collaborators currently in the channel.
#[derive(Debug, Clone)]
pub struct PresenceRoster {
    local_user_id: UserId,
    members: HashMap<UserId, CollaboratorPresence>,
}

impl PresenceRoster {
    pub fn new(local_user_id: UserId) -> Self {
        Self {
            local_user_id,
            members: HashMap::new(),
        }
    }

    /// Apply a presence message. Returns the visible change, if any.
    ///
    /// Anything about the local user is ignored; events are not presence and
    /// also yield `None`.
    pub fn apply(&mut self, message: ChannelMessage) -> Option<PresenceChange> {
        match message {
            ChannelMessage::PresenceSync { members } => {
                self.members = members
                    .into_iter()
                    .filter(|p| p.user_id != self.local_user_id)
                    .map(|p| (p.user_id, p))
                    .collect();
                Some(PresenceChange::Synced(self.members()))
            }
            ChannelMessage::PresenceJoin { presence } => {
                if presence.user_id == self.local_user_id {
                    return None;
                }
                match self.members.insert(presence.user_id, presence.clone()) {
                    Some(_) => Some(PresenceChange::Updated(presence)),
                    None => Some(PresenceChange::Joined(presence)),
                }
            }
            ChannelMessage::PresenceLeave { user_id } => {
                if user_id == self.local_user_id {
                    return None;
                }
                self.members
                    .remove(&user_id)
                    .map(|_| PresenceChange::Left(user_id))
            }
            ChannelMessage::Broadcast { .. } => None,
        }
    }

    /// Snapshot ordered by display name, then id.
    pub fn members(&self) -> Vec<CollaboratorPresence> {
        let mut members: Vec<_> = self.members.values().cloned().collect();
        members.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        members
    }

    pub fn get(&self, user_id: &UserId) -> Option<&CollaboratorPresence> {
        self.members.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }
}

struct Connection {
    id: u64,
    document_id: DocumentId,
    link: Arc<dyn ChannelLink>,
    dispatch: JoinHandle<()>,
}

/// Presence for one document on behalf of one local identity.
pub struct PresenceChannel {
    identity: Identity,
    events: Arc<EventBroadcaster>,
    local: Mutex<CollaboratorPresence>,
    roster: Arc<Mutex<PresenceRoster>>,
    listeners: Arc<Listeners<PresenceChange>>,
    connection: Arc<tokio::sync::Mutex<Option<Connection>>>,
    live: Arc<AtomicBool>,
    connections: AtomicU64,
}

impl PresenceChannel {
    /// `events` receives the channel's broadcast traffic once connected.
    pub fn new(identity: Identity, events: Arc<EventBroadcaster>) -> Self {
        let local = CollaboratorPresence::from_identity(&identity);
        let roster = PresenceRoster::new(identity.user_id);
        Self {
            identity,
            events,
            local: Mutex::new(local),
            roster: Arc::new(Mutex::new(roster)),
            listeners: Arc::new(Listeners::new()),
            connection: Arc::new(tokio::sync::Mutex::new(None)),
            live: Arc::new(AtomicBool::new(false)),
            connections: AtomicU64::new(0),
        }
    }

    /// Subscribe to `document:<document_id>` and announce local presence.
    ///
    /// Connecting while already connected is a no-op. Failures are returned
    /// as transport errors and not retried.
    pub async fn connect(&self, transport: &dyn Transport, document_id: DocumentId) -> Result<()> {
        let mut connection = self.connection.lock().await;
        if let Some(existing) = connection.as_ref() {
            log::debug!("Presence already connected to document {}", existing.document_id);
            return Ok(());
        }

        let channel = document_channel(document_id);
        let subscription = transport.subscribe(&channel, self.identity.user_id).await?;
        let link = subscription.link;

        let presence = {
            let mut local = lock(&self.local);
            local.online_at = Utc::now();
            local.clone()
        };
        if let Err(e) = link.track(presence).await {
            let _ = link.unsubscribe().await;
            return Err(e);
        }

        self.events.attach(link.clone());
        let id = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
        let dispatch = tokio::spawn(dispatch_inbound(
            subscription.inbound,
            Dispatch {
                connection_id: id,
                channel: channel.clone(),
                connection: self.connection.clone(),
                live: self.live.clone(),
                roster: self.roster.clone(),
                listeners: self.listeners.clone(),
                events: self.events.clone(),
            },
        ));

        log::info!("{} joined {channel}", self.identity.display_name);
        *connection = Some(Connection { id, document_id, link, dispatch });
        self.live.store(true, Ordering::Release);
        Ok(())
    }

    /// Leave the channel and clear the roster. Safe to call repeatedly.
    pub async fn disconnect(&self) -> Result<()> {
        let Some(conn) = self.connection.lock().await.take() else {
            return Ok(());
        };

        self.live.store(false, Ordering::Release);
        conn.dispatch.abort();
        self.events.detach();
        let result = conn.link.unsubscribe().await;
        if let Err(e) = &result {
            log::warn!("Unsubscribe from document {} failed: {e}", conn.document_id);
        }

        lock(&self.roster).clear();
        self.listeners.emit(&PresenceChange::Synced(Vec::new()));
        log::info!(
            "{} left document {}",
            self.identity.display_name,
            conn.document_id
        );
        result
    }

    /// Move the local cursor. Re-announced immediately when connected,
    /// otherwise carried into the next connect.
    pub async fn update_cursor(&self, position: u64) -> Result<()> {
        let presence = {
            let mut local = lock(&self.local);
            local.cursor_position = Some(position);
            local.clone()
        };
        log::trace!("Cursor → {position}");
        self.announce(presence).await
    }

    pub async fn update_selection(&self, from: u64, to: u64) -> Result<()> {
        let presence = {
            let mut local = lock(&self.local);
            local.selection = Some(SelectionRange::new(from, to));
            local.clone()
        };
        self.announce(presence).await
    }

    async fn announce(&self, presence: CollaboratorPresence) -> Result<()> {
        let link = match self.connection.lock().await.as_ref() {
            Some(conn) => conn.link.clone(),
            None => return Ok(()),
        };
        link.track(presence).await.inspect_err(|e| {
            log::warn!("Presence update for {} failed: {e}", self.identity.display_name);
        })
    }

    /// Stream of roster changes. Never fires for the local user.
    pub fn on_presence_change(&self) -> mpsc::UnboundedReceiver<PresenceChange> {
        self.listeners.subscribe()
    }

    pub fn roster(&self) -> Vec<CollaboratorPresence> {
        lock(&self.roster).members()
    }

    pub fn local_presence(&self) -> CollaboratorPresence {
        lock(&self.local).clone()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    /// Same as [`PresenceChannel::is_connected`] without waiting on a
    /// connect in progress.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

/// Shared state the dispatch task needs.
struct Dispatch {
    connection_id: u64,
    channel: String,
    connection: Arc<tokio::sync::Mutex<Option<Connection>>>,
    live: Arc<AtomicBool>,
    roster: Arc<Mutex<PresenceRoster>>,
    listeners: Arc<Listeners<PresenceChange>>,
    events: Arc<EventBroadcaster>,
}

impl Dispatch {
    /// The stream ended without a local disconnect.
    async fn connection_lost(&self) {
        let lost = {
            let mut connection = self.connection.lock().await;
            if !connection.as_ref().is_some_and(|c| c.id == self.connection_id) {
                return;
            }
            self.live.store(false, Ordering::Release);
            self.events.detach();
            connection.take()
        };

        log::warn!("Lost channel {}, editing solo", self.channel);
        if let Some(lost) = lost {
            if let Err(e) = lost.link.unsubscribe().await {
                log::debug!("Cleanup of {} after loss: {e}", self.channel);
            }
        }
        lock(&self.roster).clear();
        self.listeners.emit(&PresenceChange::Synced(Vec::new()));
    }
}

async fn dispatch_inbound(mut inbound: mpsc::UnboundedReceiver<ChannelMessage>, dispatch: Dispatch) {
    while let Some(message) = inbound.recv().await {
        log::trace!("{}: message from {:?}", dispatch.channel, message.origin());
        if message.is_presence() {
            let change = lock(&dispatch.roster).apply(message);
            if let Some(change) = change {
                dispatch.listeners.emit(&change);
            }
        } else if let ChannelMessage::Broadcast { event } = message {
            dispatch.events.receive(event);
        }
    }
    dispatch.connection_lost().await;
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LocalTransport, Subscription};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use uuid::Uuid;

    /// First subscription delivers `members` and then its stream ends, as if
    /// the relay went away. Later subscriptions are plain local ones.
    struct DroppingTransport {
        members: Vec<CollaboratorPresence>,
        subscribes: AtomicUsize,
        local: LocalTransport,
    }

    #[async_trait]
    impl Transport for DroppingTransport {
        async fn subscribe(&self, channel: &str, member: UserId) -> Result<Subscription> {
            let subscription = self.local.subscribe(channel, member).await?;
            if self.subscribes.fetch_add(1, Ordering::SeqCst) > 0 {
                return Ok(subscription);
            }
            let (tx, inbound) = mpsc::unbounded_channel();
            tx.send(ChannelMessage::PresenceSync { members: self.members.clone() })
                .unwrap();
            Ok(Subscription { link: subscription.link, inbound })
        }
    }

    fn presence(name: &str) -> CollaboratorPresence {
        CollaboratorPresence::from_identity(&Identity::new(Uuid::new_v4(), name))
    }

    async fn next_change(rx: &mut mpsc::UnboundedReceiver<PresenceChange>) -> PresenceChange {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out")
            .expect("stream closed")
    }

    #[test]
    fn test_color_is_stable_and_in_palette() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let color = presence_color(id);
        assert_eq!(color, presence_color(id));
        assert!(PRESENCE_PALETTE.contains(&color));
    }

    #[test]
    fn test_colors_spread_over_palette() {
        let distinct: std::collections::HashSet<&str> =
            (0..200).map(|_| presence_color(Uuid::new_v4())).collect();
        assert!(distinct.len() >= 8, "only {} colors used", distinct.len());
    }

    #[test]
    fn test_selection_range_ordered() {
        let range = SelectionRange::new(20, 5);
        assert_eq!(range, SelectionRange { from: 5, to: 20 });
        assert!(!range.is_collapsed());
        assert!(SelectionRange::new(3, 3).is_collapsed());
    }

    #[test]
    fn test_roster_sync_excludes_self() {
        let me = presence("Me");
        let mut roster = PresenceRoster::new(me.user_id);
        let alice = presence("Alice");
        let bob = presence("Bob");

        let change = roster.apply(ChannelMessage::PresenceSync {
            members: vec![bob.clone(), me.clone(), alice.clone()],
        });
        assert_eq!(change, Some(PresenceChange::Synced(vec![alice.clone(), bob.clone()])));
        assert_eq!(roster.len(), 2);
        assert!(roster.get(&me.user_id).is_none());
    }

    #[test]
    fn test_roster_sync_replaces_previous() {
        let mut roster = PresenceRoster::new(Uuid::new_v4());
        roster.apply(ChannelMessage::PresenceJoin { presence: presence("Old") });
        let fresh = presence("Fresh");
        roster.apply(ChannelMessage::PresenceSync { members: vec![fresh.clone()] });
        assert_eq!(roster.members(), vec![fresh]);
    }

    #[test]
    fn test_roster_join_then_update() {
        let mut roster = PresenceRoster::new(Uuid::new_v4());
        let mut alice = presence("Alice");

        assert_eq!(
            roster.apply(ChannelMessage::PresenceJoin { presence: alice.clone() }),
            Some(PresenceChange::Joined(alice.clone()))
        );
        alice.cursor_position = Some(42);
        assert_eq!(
            roster.apply(ChannelMessage::PresenceJoin { presence: alice.clone() }),
            Some(PresenceChange::Updated(alice.clone()))
        );
        assert_eq!(roster.get(&alice.user_id).unwrap().cursor_position, Some(42));
    }

    #[test]
    fn test_roster_ignores_self_and_unknown_leave() {
        let me = presence("Me");
        let mut roster = PresenceRoster::new(me.user_id);
        assert_eq!(roster.apply(ChannelMessage::PresenceJoin { presence: me.clone() }), None);
        assert_eq!(roster.apply(ChannelMessage::PresenceLeave { user_id: me.user_id }), None);
        assert_eq!(
            roster.apply(ChannelMessage::PresenceLeave { user_id: Uuid::new_v4() }),
            None
        );
        assert!(roster.is_empty());
    }

    #[test]
    fn test_roster_leave() {
        let mut roster = PresenceRoster::new(Uuid::new_v4());
        let alice = presence("Alice");
        roster.apply(ChannelMessage::PresenceJoin { presence: alice.clone() });
        assert_eq!(
            roster.apply(ChannelMessage::PresenceLeave { user_id: alice.user_id }),
            Some(PresenceChange::Left(alice.user_id))
        );
        assert!(roster.is_empty());
    }

    #[tokio::test]
    async fn test_channel_connect_and_disconnect() {
        let transport = LocalTransport::new();
        let identity = Identity::new(Uuid::new_v4(), "Alice");
        let events = Arc::new(EventBroadcaster::new(identity.user_id));
        let channel = PresenceChannel::new(identity, events.clone());
        let mut changes = channel.on_presence_change();

        channel.connect(&transport, Uuid::new_v4()).await.unwrap();
        assert!(channel.is_connected().await);
        assert!(events.is_attached());
        assert_eq!(next_change(&mut changes).await, PresenceChange::Synced(vec![]));

        channel.disconnect().await.unwrap();
        assert!(!channel.is_connected().await);
        assert!(!events.is_attached());
        assert_eq!(next_change(&mut changes).await, PresenceChange::Synced(vec![]));

        // Second disconnect does nothing.
        channel.disconnect().await.unwrap();
        assert!(changes.try_recv().is_err());
        assert_eq!(transport.rooms().room_count().await, 0);
    }

    #[tokio::test]
    async fn test_lost_stream_goes_solo_and_reconnects() {
        let ben = presence("Ben");
        let transport = DroppingTransport {
            members: vec![ben.clone()],
            subscribes: AtomicUsize::new(0),
            local: LocalTransport::new(),
        };
        let identity = Identity::new(Uuid::new_v4(), "Alice");
        let events = Arc::new(EventBroadcaster::new(identity.user_id));
        let channel = PresenceChannel::new(identity, events.clone());
        let mut changes = channel.on_presence_change();
        let doc = Uuid::new_v4();

        channel.connect(&transport, doc).await.unwrap();
        assert_eq!(next_change(&mut changes).await, PresenceChange::Synced(vec![ben]));
        assert_eq!(next_change(&mut changes).await, PresenceChange::Synced(vec![]));

        assert!(channel.roster().is_empty());
        assert!(!channel.is_live());
        assert!(!channel.is_connected().await);
        assert!(!events.is_attached());
        // The dead membership was cleaned up.
        assert_eq!(transport.local.rooms().room_count().await, 0);

        channel.connect(&transport, doc).await.unwrap();
        assert!(channel.is_live());
        assert!(events.is_attached());
        assert_eq!(next_change(&mut changes).await, PresenceChange::Synced(vec![]));

        channel.disconnect().await.unwrap();
        assert!(!channel.is_live());
    }

    #[tokio::test]
    async fn test_cursor_state_carried_into_connect() {
        let transport = LocalTransport::new();
        let doc = Uuid::new_v4();

        let alice = PresenceChannel::new(
            Identity::new(Uuid::new_v4(), "Alice"),
            Arc::new(EventBroadcaster::new(Uuid::new_v4())),
        );
        alice.update_cursor(7).await.unwrap();
        alice.update_selection(9, 3).await.unwrap();
        alice.connect(&transport, doc).await.unwrap();

        let bob_identity = Identity::new(Uuid::new_v4(), "Bob");
        let bob = PresenceChannel::new(
            bob_identity.clone(),
            Arc::new(EventBroadcaster::new(bob_identity.user_id)),
        );
        let mut changes = bob.on_presence_change();
        bob.connect(&transport, doc).await.unwrap();

        match next_change(&mut changes).await {
            PresenceChange::Synced(members) => {
                assert_eq!(members.len(), 1);
                assert_eq!(members[0].display_name, "Alice");
                assert_eq!(members[0].cursor_position, Some(7));
                assert_eq!(members[0].selection, Some(SelectionRange { from: 3, to: 9 }));
            }
            other => panic!("Expected Synced, got {other:?}"),
        }
        assert_eq!(bob.roster().len(), 1);
    }
}
