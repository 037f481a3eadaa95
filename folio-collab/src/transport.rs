//! Pub/sub transport seam.
//!
//! A [`Transport`] turns a channel name and a member id into a
//! [`Subscription`]: a [`ChannelLink`] for outbound traffic plus a stream of
//! inbound [`ChannelMessage`]s. Frames addressed to other members are
//! filtered out before they reach the stream; frames the member itself
//! caused are not.
//!
//! Two implementations:
//! - [`LocalTransport`]: in-process, backed by a shared [`RoomManager`].
//! - [`WsTransport`]: WebSocket client for [`crate::server::RelayServer`].
//!
//! Nothing here retries. A failed subscribe or send is reported once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use folio_core::UserId;

use crate::broadcast::{ChannelRoom, RoomFrame, RoomManager};
use crate::error::{CollabError, Result};
use crate::events::CollaborationEvent;
use crate::presence::CollaboratorPresence;
use crate::protocol::{ChannelMessage, ClientFrame, ProtocolError, ServerFrame};

/// Outbound half of a channel subscription.
#[async_trait]
pub trait ChannelLink: Send + Sync {
    /// Publish (or republish) this member's presence state.
    async fn track(&self, presence: CollaboratorPresence) -> Result<()>;

    /// Publish an ephemeral event to every member.
    async fn broadcast(&self, event: CollaborationEvent) -> Result<()>;

    /// Leave the channel. Calling it again is a no-op.
    async fn unsubscribe(&self) -> Result<()>;
}

/// A live channel membership.
pub struct Subscription {
    pub link: Arc<dyn ChannelLink>,
    pub inbound: mpsc::UnboundedReceiver<ChannelMessage>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn subscribe(&self, channel: &str, member: UserId) -> Result<Subscription>;
}

fn closed_error() -> CollabError {
    ProtocolError::ConnectionClosed.into()
}

// ─── In-process ──────────────────────────────────────────────────────

/// Transport over an in-process channel hub.
///
/// Every clone shares the same rooms, so sessions created from clones of
/// one `LocalTransport` see each other.
#[derive(Clone)]
pub struct LocalTransport {
    rooms: Arc<RoomManager>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::with_rooms(Arc::new(RoomManager::new(256, 1_000)))
    }

    pub fn with_rooms(rooms: Arc<RoomManager>) -> Self {
        Self { rooms }
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn subscribe(&self, channel: &str, member: UserId) -> Result<Subscription> {
        let (room, rx) = self.rooms.join(channel, member).await?;

        let (tx, inbound) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward_room(rx, tx, member, channel.to_string()));

        let link = LocalLink {
            room,
            rooms: self.rooms.clone(),
            member,
            closed: AtomicBool::new(false),
            forwarder: Mutex::new(Some(forwarder)),
        };
        Ok(Subscription { link: Arc::new(link), inbound })
    }
}

async fn forward_room(
    mut rx: broadcast::Receiver<Arc<Vec<u8>>>,
    tx: mpsc::UnboundedSender<ChannelMessage>,
    member: UserId,
    channel: String,
) {
    loop {
        match rx.recv().await {
            Ok(bytes) => match RoomFrame::decode(&bytes) {
                Ok(frame) if frame.is_for(member) => {
                    if tx.send(frame.message).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => log::warn!("Dropping undecodable frame on {channel}: {e}"),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("{member} lagged on {channel}, {n} frames dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

struct LocalLink {
    room: Arc<ChannelRoom>,
    rooms: Arc<RoomManager>,
    member: UserId,
    closed: AtomicBool,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl LocalLink {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        Ok(())
    }

    fn stop_forwarder(&self) {
        if let Some(handle) = self.forwarder.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl ChannelLink for LocalLink {
    async fn track(&self, presence: CollaboratorPresence) -> Result<()> {
        self.ensure_open()?;
        self.room.track(presence).await.map(|_| ())
    }

    async fn broadcast(&self, event: CollaborationEvent) -> Result<()> {
        self.ensure_open()?;
        self.room.broadcast_event(event)?;
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_forwarder();
        self.rooms.leave(&self.room, self.member).await;
        Ok(())
    }
}

impl Drop for LocalLink {
    fn drop(&mut self) {
        self.stop_forwarder();
    }
}

// ─── WebSocket ───────────────────────────────────────────────────────

/// Transport that talks to a relay server over WebSocket.
///
/// One connection per subscription.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    /// `url` is the relay's WebSocket endpoint, e.g. `ws://127.0.0.1:9100`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn subscribe(&self, channel: &str, member: UserId) -> Result<Subscription> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| CollabError::transport(format!("connect {}: {e}", self.url)))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let subscribe = ClientFrame::Subscribe {
            channel: channel.to_string(),
            member,
        };
        ws_writer
            .send(Message::Binary(subscribe.encode()?.into()))
            .await
            .map_err(|e| CollabError::transport(e.to_string()))?;

        // The relay answers Subscribed or Error before anything else.
        match next_server_frame(&mut ws_reader).await? {
            ServerFrame::Subscribed { .. } => {}
            ServerFrame::Error(reason) => return Err(CollabError::transport(reason)),
            other => {
                return Err(ProtocolError::UnexpectedFrame(format!("{other:?}")).into());
            }
        }
        log::info!("Subscribed to {channel} via {}", self.url);

        // Writer task: outbound frames → WebSocket. Unsubscribe is the last
        // frame; the socket is closed right after it.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<(ClientFrame, oneshot::Sender<Result<()>>)>();
        let writer = tokio::spawn(async move {
            while let Some((frame, ack)) = out_rx.recv().await {
                let last = matches!(frame, ClientFrame::Unsubscribe);
                let sent = match frame.encode() {
                    Ok(bytes) => ws_writer
                        .send(Message::Binary(bytes.into()))
                        .await
                        .map_err(|e| CollabError::transport(e.to_string())),
                    Err(e) => Err(e.into()),
                };
                let failed = sent.is_err();
                let _ = ack.send(sent);
                if last || failed {
                    let _ = ws_writer.close().await;
                    break;
                }
            }
        });

        // Reader task: WebSocket → inbound messages.
        let (in_tx, inbound) = mpsc::unbounded_channel();
        let channel_name = channel.to_string();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match ServerFrame::decode(&bytes) {
                            Ok(ServerFrame::Message(message)) => {
                                if in_tx.send(message).is_err() {
                                    break;
                                }
                            }
                            Ok(ServerFrame::Error(reason)) => {
                                log::warn!("Relay error on {channel_name}: {reason}");
                            }
                            Ok(_) => {}
                            Err(e) => log::warn!("Dropping undecodable frame on {channel_name}: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            log::debug!("Relay connection for {channel_name} ended");
        });

        let link = WsLink {
            outbound: out_tx,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(vec![writer, reader]),
        };
        Ok(Subscription { link: Arc::new(link), inbound })
    }
}

async fn next_server_frame<S>(reader: &mut S) -> Result<ServerFrame>
where
    S: futures_util::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    while let Some(msg) = reader.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                let bytes: Vec<u8> = data.into();
                return Ok(ServerFrame::decode(&bytes)?);
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => return Err(CollabError::transport(e.to_string())),
        }
    }
    Err(closed_error())
}

type Outbound = mpsc::UnboundedSender<(ClientFrame, oneshot::Sender<Result<()>>)>;

struct WsLink {
    outbound: Outbound,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsLink {
    async fn send(&self, frame: ClientFrame) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.outbound
            .send((frame, ack_tx))
            .map_err(|_| closed_error())?;
        ack_rx.await.map_err(|_| closed_error())?
    }

    fn abort_tasks(&self) {
        for handle in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            handle.abort();
        }
    }
}

#[async_trait]
impl ChannelLink for WsLink {
    async fn track(&self, presence: CollaboratorPresence) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        self.send(ClientFrame::Track { presence }).await
    }

    async fn broadcast(&self, event: CollaborationEvent) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        self.send(ClientFrame::Broadcast { event }).await
    }

    async fn unsubscribe(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // A dead connection has already left the channel server-side.
        if let Err(e) = self.send(ClientFrame::Unsubscribe).await {
            log::debug!("Unsubscribe on closed connection: {e}");
        }
        self.abort_tasks();
        Ok(())
    }
}

impl Drop for WsLink {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
