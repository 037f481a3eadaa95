//! WebSocket pub/sub relay.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!            ├── ChannelRoom ("document:<id>") ── tracked presence
//! Client B ──┘          │
//!                       │ broadcast (Arc<Vec<u8>>)
//!            ┌──────────┼───────────┐
//!            ▼          ▼           ▼
//!         Client A   Client B    Client C
//! ```
//!
//! The relay keeps no document content. It knows channel membership and the
//! last presence each member tracked, which is what a newcomer's
//! `PresenceSync` is built from. Everything is fanned out to every member;
//! clients drop their own echoes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;

use folio_core::UserId;

use crate::broadcast::{ChannelRoom, RoomFrame, RoomManager};
use crate::protocol::{ClientFrame, ServerFrame};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per member before it starts losing the oldest
    pub broadcast_capacity: usize,
    /// Maximum members per channel
    pub max_members_per_channel: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9100".to_string(),
            broadcast_capacity: 256,
            max_members_per_channel: 100,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `FOLIO_RELAY_ADDR`, `FOLIO_RELAY_CAPACITY` and
    /// `FOLIO_RELAY_MAX_MEMBERS`. Unparseable numbers are ignored with a
    /// warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("FOLIO_RELAY_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(n) = parse_setting(&lookup, "FOLIO_RELAY_CAPACITY") {
            config.broadcast_capacity = n;
        }
        if let Some(n) = parse_setting(&lookup, "FOLIO_RELAY_MAX_MEMBERS") {
            config.max_members_per_channel = n;
        }
        config
    }
}

fn parse_setting(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    let raw = lookup(key)?;
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            log::warn!("Ignoring {key}={raw:?}: expected a positive integer");
            None
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_channels: usize,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    counters: Arc<Counters>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(
            config.broadcast_capacity,
            config.max_members_per_channel,
        ));
        Self {
            config,
            rooms,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let counters = self.counters.clone();
            tokio::spawn(async move {
                counters.total_connections.fetch_add(1, Ordering::Relaxed);
                counters.active_connections.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = handle_connection(stream, addr, &rooms, &counters).await {
                    log::error!("Connection error from {addr}: {e}");
                }
                counters.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            total_messages: self.counters.total_messages.load(Ordering::Relaxed),
            total_bytes: self.counters.total_bytes.load(Ordering::Relaxed),
            active_channels: self.rooms.room_count().await,
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

struct Membership {
    member: UserId,
    room: Arc<ChannelRoom>,
    rx: broadcast::Receiver<Arc<Vec<u8>>>,
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    rooms: &RoomManager,
    counters: &Counters,
) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    let mut membership: Option<Membership> = None;

    let result: Result<(), BoxError> = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            counters.total_messages.fetch_add(1, Ordering::Relaxed);
                            counters.total_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);

                            let frame = match ClientFrame::decode(&bytes) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                    continue;
                                }
                            };

                            let reply = match frame {
                                ClientFrame::Subscribe { channel, member } => {
                                    if membership.is_some() {
                                        Some(ServerFrame::Error("already subscribed".into()))
                                    } else {
                                        match rooms.join(&channel, member).await {
                                            Ok((room, rx)) => {
                                                log::info!("{member} subscribed to {channel} from {addr}");
                                                membership = Some(Membership { member, room, rx });
                                                Some(ServerFrame::Subscribed { channel })
                                            }
                                            Err(e) => Some(ServerFrame::Error(e.to_string())),
                                        }
                                    }
                                }
                                ClientFrame::Track { presence } => match &membership {
                                    Some(m) if m.member == presence.user_id => {
                                        log::trace!("{} tracked on {}", m.member, m.room.name());
                                        m.room.track(presence).await.err().map(|e| ServerFrame::Error(e.to_string()))
                                    }
                                    Some(_) => Some(ServerFrame::Error("presence does not match subscriber".into())),
                                    None => Some(ServerFrame::Error("not subscribed".into())),
                                },
                                ClientFrame::Broadcast { event } => match &membership {
                                    Some(m) if m.member == event.origin_user_id => {
                                        m.room.broadcast_event(event).err().map(|e| ServerFrame::Error(e.to_string()))
                                    }
                                    Some(_) => Some(ServerFrame::Error("event origin does not match subscriber".into())),
                                    None => Some(ServerFrame::Error("not subscribed".into())),
                                },
                                ClientFrame::Unsubscribe => {
                                    log::debug!("Unsubscribe from {addr}");
                                    break;
                                }
                                ClientFrame::Ping => Some(ServerFrame::Pong),
                            };

                            if let Some(reply) = reply {
                                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                msg = async {
                    match membership.as_mut() {
                        Some(m) => m.rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    let Some(member) = membership.as_ref().map(|m| m.member) else {
                        continue;
                    };
                    match msg {
                        Ok(data) => {
                            let frame = RoomFrame::decode(&data)?;
                            if frame.is_for(member) {
                                let out = ServerFrame::Message(frame.message).encode()?;
                                ws_sender.send(Message::Binary(out.into())).await?;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("{member} lagged by {n} frames");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        Ok(())
    }
    .await;

    if let Some(m) = membership {
        rooms.leave(&m.room, m.member).await;
        log::info!("{} left {}", m.member, m.room.name());
    }
    let _ = ws_sender.close().await;

    result
}
