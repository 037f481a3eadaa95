//! Channel hub: per-channel fan-out with tracked presence.
//!
//! One [`ChannelRoom`] per channel name. Every member holds a receiver on the
//! room's tokio broadcast channel; frames are encoded once and shared as
//! `Arc<Vec<u8>>`. A frame may carry a target so that per-member replies
//! (the presence sync on subscribe) travel the same ordered stream as
//! everything else.
//!
//! Members are keyed by user id. A user connected twice to the same channel
//! counts once and leaves when its last connection does.
//!
//! Used in-process by [`crate::transport::LocalTransport`] and over the
//! network by [`crate::server::RelayServer`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, RwLock};

use folio_core::UserId;

use crate::error::{CollabError, Result};
use crate::events::CollaborationEvent;
use crate::presence::CollaboratorPresence;
use crate::protocol::{self, ChannelMessage, ProtocolError};

/// Unit of fan-out on a room's broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomFrame {
    /// `None` delivers to every member.
    pub target: Option<UserId>,
    pub message: ChannelMessage,
}

impl RoomFrame {
    pub fn to_all(message: ChannelMessage) -> Self {
        Self { target: None, message }
    }

    pub fn to_member(member: UserId, message: ChannelMessage) -> Self {
        Self { target: Some(member), message }
    }

    pub fn is_for(&self, member: UserId) -> bool {
        self.target.is_none_or(|target| target == member)
    }

    pub fn encode(&self) -> std::result::Result<Vec<u8>, ProtocolError> {
        protocol::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, ProtocolError> {
        protocol::decode(bytes)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoomStats {
    pub messages_sent: u64,
    pub members: usize,
    pub tracked: usize,
}

#[derive(Debug)]
struct Member {
    connections: usize,
    presence: Option<CollaboratorPresence>,
}

/// A single pub/sub channel.
pub struct ChannelRoom {
    name: String,
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    members: RwLock<HashMap<UserId, Member>>,
    capacity: usize,
    max_members: usize,
    messages_sent: AtomicU64,
}

impl ChannelRoom {
    /// `capacity` is the per-receiver buffer; a receiver further behind than
    /// that loses the oldest frames.
    pub fn new(name: impl Into<String>, capacity: usize, max_members: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            name: name.into(),
            sender,
            members: RwLock::new(HashMap::new()),
            capacity,
            max_members,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Add a connection for `member`.
    ///
    /// The returned receiver sees a targeted `PresenceSync` of everyone
    /// tracked so far, followed by all later traffic.
    pub async fn join(&self, member: UserId) -> Result<broadcast::Receiver<Arc<Vec<u8>>>> {
        let mut members = self.members.write().await;
        if !members.contains_key(&member) && members.len() >= self.max_members {
            return Err(CollabError::transport(format!(
                "channel {} is full ({} members)",
                self.name, self.max_members
            )));
        }

        let rx = self.sender.subscribe();
        members
            .entry(member)
            .or_insert(Member { connections: 0, presence: None })
            .connections += 1;

        let tracked: Vec<CollaboratorPresence> =
            members.values().filter_map(|m| m.presence.clone()).collect();
        self.send(&RoomFrame::to_member(
            member,
            ChannelMessage::PresenceSync { members: tracked },
        ))?;

        log::debug!("{member} joined {} ({} members)", self.name, members.len());
        Ok(rx)
    }

    /// Store `presence` for its user and announce it to everyone.
    pub async fn track(&self, presence: CollaboratorPresence) -> Result<usize> {
        let mut members = self.members.write().await;
        let Some(entry) = members.get_mut(&presence.user_id) else {
            return Err(CollabError::transport(format!(
                "{} is not subscribed to {}",
                presence.user_id, self.name
            )));
        };
        entry.presence = Some(presence.clone());
        Ok(self.send(&RoomFrame::to_all(ChannelMessage::PresenceJoin { presence }))?)
    }

    /// Drop one connection of `member`. Returns true when the member is gone.
    pub async fn leave(&self, member: UserId) -> bool {
        let mut members = self.members.write().await;
        let Some(entry) = members.get_mut(&member) else {
            return false;
        };
        entry.connections = entry.connections.saturating_sub(1);
        if entry.connections > 0 {
            return false;
        }

        let was_tracked = members.remove(&member).is_some_and(|m| m.presence.is_some());
        if was_tracked {
            let frame = RoomFrame::to_all(ChannelMessage::PresenceLeave { user_id: member });
            if let Err(e) = self.send(&frame) {
                log::warn!("Failed to announce leave of {member} on {}: {e}", self.name);
            }
        }
        log::debug!("{member} left {} ({} members)", self.name, members.len());
        true
    }

    /// Fan an event out to every member, sender included.
    pub fn broadcast_event(&self, event: CollaborationEvent) -> std::result::Result<usize, ProtocolError> {
        self.send(&RoomFrame::to_all(ChannelMessage::Broadcast { event }))
    }

    fn send(&self, frame: &RoomFrame) -> std::result::Result<usize, ProtocolError> {
        let encoded = Arc::new(frame.encode()?);
        let receivers = self.sender.send(encoded).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(receivers)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn has_member(&self, member: &UserId) -> bool {
        self.members.read().await.contains_key(member)
    }

    /// Presence of every member that has tracked.
    pub async fn tracked(&self) -> Vec<CollaboratorPresence> {
        self.members
            .read()
            .await
            .values()
            .filter_map(|m| m.presence.clone())
            .collect()
    }

    pub async fn stats(&self) -> RoomStats {
        let members = self.members.read().await;
        RoomStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            members: members.len(),
            tracked: members.values().filter(|m| m.presence.is_some()).count(),
        }
    }
}

/// Maps channel names to rooms.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<ChannelRoom>>>,
    capacity: usize,
    max_members: usize,
}

impl RoomManager {
    pub fn new(capacity: usize, max_members: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
            max_members,
        }
    }

    /// Join `channel`, opening it if needed.
    ///
    /// The room map stays locked until the member is in, so a concurrent
    /// [`RoomManager::leave`] can never drop the room between lookup and
    /// join.
    pub async fn join(
        &self,
        channel: &str,
        member: UserId,
    ) -> Result<(Arc<ChannelRoom>, broadcast::Receiver<Arc<Vec<u8>>>)> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(channel.to_string())
            .or_insert_with(|| {
                log::info!("Opening channel {channel}");
                Arc::new(ChannelRoom::new(channel, self.capacity, self.max_members))
            })
            .clone();
        match room.join(member).await {
            Ok(rx) => Ok((room, rx)),
            Err(e) => {
                if room.member_count().await == 0 {
                    rooms.remove(channel);
                }
                Err(e)
            }
        }
    }

    /// Drop one connection of `member` from `room` and close the room once
    /// it is empty. Returns true when the member is gone.
    pub async fn leave(&self, room: &Arc<ChannelRoom>, member: UserId) -> bool {
        let mut rooms = self.rooms.write().await;
        let gone = room.leave(member).await;
        let current = rooms.get(room.name()).is_some_and(|r| Arc::ptr_eq(r, room));
        if current && room.member_count().await == 0 {
            rooms.remove(room.name());
            log::info!("Closed empty channel {}", room.name());
        }
        gone
    }

    pub async fn get(&self, channel: &str) -> Option<Arc<ChannelRoom>> {
        self.rooms.read().await.get(channel).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_channels(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

/// Fan-out of values to any number of unbounded mpsc subscribers.
///
/// Closed subscribers are pruned on the next emit.
pub struct Listeners<T> {
    senders: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> Listeners<T> {
    pub fn new() -> Self {
        Self { senders: Mutex::new(Vec::new()) }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Deliver `value` once to each live subscriber. Returns how many got it.
    pub fn emit(&self, value: &T) -> usize {
        let mut senders = self.lock();
        senders.retain(|tx| tx.send(value.clone()).is_ok());
        senders.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<T>>> {
        self.senders.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: Clone> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::presence::{CollaboratorPresence, Identity};
    use chrono::Utc;
    use uuid::Uuid;

    fn presence_of(name: &str) -> CollaboratorPresence {
        CollaboratorPresence::from_identity(&Identity::new(Uuid::new_v4(), name))
    }

    async fn next_frame(rx: &mut broadcast::Receiver<Arc<Vec<u8>>>) -> RoomFrame {
        let bytes = rx.recv().await.unwrap();
        RoomFrame::decode(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_join_receives_targeted_sync() {
        let room = ChannelRoom::new("document:test", 16, 8);
        let alice = presence_of("Alice");

        let mut rx_alice = room.join(alice.user_id).await.unwrap();
        let frame = next_frame(&mut rx_alice).await;
        assert_eq!(frame.target, Some(alice.user_id));
        assert_eq!(frame.message, ChannelMessage::PresenceSync { members: vec![] });

        room.track(alice.clone()).await.unwrap();
        let frame = next_frame(&mut rx_alice).await;
        assert!(frame.is_for(Uuid::new_v4()));

        let bob = Uuid::new_v4();
        let mut rx_bob = room.join(bob).await.unwrap();
        let frame = next_frame(&mut rx_bob).await;
        assert!(frame.is_for(bob));
        match frame.message {
            ChannelMessage::PresenceSync { members } => {
                assert_eq!(members.len(), 1);
                assert_eq!(members[0].user_id, alice.user_id);
            }
            other => panic!("Expected PresenceSync, got {other:?}"),
        }

        // Alice sees Bob's sync frame but it is not addressed to her.
        let frame = next_frame(&mut rx_alice).await;
        assert!(!frame.is_for(alice.user_id));
    }

    #[tokio::test]
    async fn test_track_requires_membership() {
        let room = ChannelRoom::new("document:test", 16, 8);
        let stranger = presence_of("Stranger");
        assert!(room.track(stranger).await.unwrap_err().is_transport());
    }

    #[tokio::test]
    async fn test_event_fans_out_to_all_members() {
        let room = ChannelRoom::new("document:test", 16, 8);
        let mut receivers = Vec::new();
        for _ in 0..3 {
            receivers.push(room.join(Uuid::new_v4()).await.unwrap());
        }

        let event = CollaborationEvent {
            kind: EventKind::CursorMove,
            origin_user_id: Uuid::new_v4(),
            payload: vec![1, 2, 3],
            timestamp: Utc::now(),
        };
        // Three members, each also holds the three sync frames sent so far.
        assert_eq!(room.broadcast_event(event.clone()).unwrap(), 3);

        for rx in receivers.iter_mut() {
            let mut last = None;
            while let Ok(bytes) = rx.try_recv() {
                last = Some(RoomFrame::decode(&bytes).unwrap());
            }
            assert_eq!(last.unwrap().message, ChannelMessage::Broadcast { event: event.clone() });
        }
    }

    #[tokio::test]
    async fn test_leave_announces_only_tracked_members() {
        let room = ChannelRoom::new("document:test", 16, 8);
        let observer = Uuid::new_v4();
        let mut rx = room.join(observer).await.unwrap();
        let _ = next_frame(&mut rx).await;

        let lurker = Uuid::new_v4();
        let _rx_lurker = room.join(lurker).await.unwrap();
        let _ = next_frame(&mut rx).await;
        assert!(room.leave(lurker).await);
        assert!(rx.try_recv().is_err());

        let alice = presence_of("Alice");
        let _rx_alice = room.join(alice.user_id).await.unwrap();
        room.track(alice.clone()).await.unwrap();
        assert!(room.leave(alice.user_id).await);

        let mut saw_leave = false;
        while let Ok(bytes) = rx.try_recv() {
            if RoomFrame::decode(&bytes).unwrap().message
                == (ChannelMessage::PresenceLeave { user_id: alice.user_id })
            {
                saw_leave = true;
            }
        }
        assert!(saw_leave);
    }

    #[tokio::test]
    async fn test_same_user_twice_counts_once() {
        let room = ChannelRoom::new("document:test", 16, 8);
        let user = Uuid::new_v4();
        let _a = room.join(user).await.unwrap();
        let _b = room.join(user).await.unwrap();
        assert_eq!(room.member_count().await, 1);

        assert!(!room.leave(user).await);
        assert!(room.has_member(&user).await);
        assert!(room.leave(user).await);
        assert!(!room.has_member(&user).await);
        assert!(!room.leave(user).await);
    }

    #[tokio::test]
    async fn test_room_full() {
        let room = ChannelRoom::new("document:test", 16, 2);
        let _a = room.join(Uuid::new_v4()).await.unwrap();
        let _b = room.join(Uuid::new_v4()).await.unwrap();
        let err = room.join(Uuid::new_v4()).await.unwrap_err();
        assert!(err.to_string().contains("full"));
    }

    #[tokio::test]
    async fn test_room_stats() {
        let room = ChannelRoom::new("document:test", 32, 8);
        assert_eq!(room.capacity(), 32);
        let alice = presence_of("Alice");
        let _rx = room.join(alice.user_id).await.unwrap();
        let _rx2 = room.join(Uuid::new_v4()).await.unwrap();
        room.track(alice).await.unwrap();

        let stats = room.stats().await;
        assert_eq!(stats.members, 2);
        assert_eq!(stats.tracked, 1);
        assert_eq!(stats.messages_sent, 3);
    }

    #[tokio::test]
    async fn test_room_manager_rooms_by_channel() {
        let manager = RoomManager::new(16, 8);
        let (room1, _rx1) = manager.join("document:a", Uuid::new_v4()).await.unwrap();
        let (room2, _rx2) = manager.join("document:a", Uuid::new_v4()).await.unwrap();
        let (_room3, _rx3) = manager.join("document:b", Uuid::new_v4()).await.unwrap();

        assert!(Arc::ptr_eq(&room1, &room2));
        assert_eq!(manager.room_count().await, 2);
        assert!(manager.active_channels().await.contains(&"document:b".to_string()));
        assert!(manager.get("document:c").await.is_none());
    }

    #[tokio::test]
    async fn test_room_kept_while_members_remain() {
        let manager = RoomManager::new(16, 8);
        let user = Uuid::new_v4();
        let (room, _rx) = manager.join("document:a", user).await.unwrap();
        let (_, _rx2) = manager.join("document:a", user).await.unwrap();

        assert!(!manager.leave(&room, user).await);
        assert_eq!(manager.room_count().await, 1);
        assert!(manager.leave(&room, user).await);
        assert_eq!(manager.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_manager_join_and_leave() {
        let manager = RoomManager::new(16, 8);
        let user = Uuid::new_v4();
        let (room, _rx) = manager.join("document:a", user).await.unwrap();
        assert!(Arc::ptr_eq(&room, &manager.get("document:a").await.unwrap()));

        assert!(manager.leave(&room, user).await);
        assert_eq!(manager.room_count().await, 0);

        // A rejected join leaves no empty room behind.
        let full = RoomManager::new(16, 0);
        assert!(full.join("document:b", user).await.is_err());
        assert_eq!(full.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_join_after_last_leave_shares_new_room() {
        let manager = RoomManager::new(16, 8);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let (old_room, _rx_a) = manager.join("document:a", a).await.unwrap();
        manager.leave(&old_room, a).await;
        let (room_b, _rx_b) = manager.join("document:a", b).await.unwrap();
        let (room_c, _rx_c) = manager.join("document:a", c).await.unwrap();

        assert!(!Arc::ptr_eq(&old_room, &room_b));
        assert!(Arc::ptr_eq(&room_b, &room_c));
        assert_eq!(room_b.member_count().await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_join_racing_last_leave_never_orphans() {
        let manager = Arc::new(RoomManager::new(16, 8));
        for _ in 0..200 {
            let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
            let (room_a, _rx_a) = manager.join("document:race", a).await.unwrap();

            let leaving = tokio::spawn({
                let manager = manager.clone();
                async move { manager.leave(&room_a, a).await }
            });
            let joining = tokio::spawn({
                let manager = manager.clone();
                async move { manager.join("document:race", b).await.unwrap() }
            });
            assert!(leaving.await.unwrap());
            let (room_b, _rx_b) = joining.await.unwrap();

            let (room_c, _rx_c) = manager.join("document:race", c).await.unwrap();
            assert!(Arc::ptr_eq(&room_b, &room_c));
            assert!(Arc::ptr_eq(&room_b, &manager.get("document:race").await.unwrap()));

            manager.leave(&room_b, b).await;
            manager.leave(&room_c, c).await;
            assert_eq!(manager.room_count().await, 0);
        }
    }

    #[tokio::test]
    async fn test_listeners_prune_closed() {
        let listeners: Listeners<u32> = Listeners::new();
        let mut rx1 = listeners.subscribe();
        let rx2 = listeners.subscribe();
        assert_eq!(listeners.len(), 2);

        drop(rx2);
        assert_eq!(listeners.emit(&7), 1);
        assert_eq!(rx1.recv().await, Some(7));
        assert_eq!(listeners.len(), 1);
    }
}
