//! # folio-collab: collaborative sessions and scene history for Folio
//!
//! Live presence between editors of the same manuscript, debounced
//! autosave, and an append-only version log per scene.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   Transport    ┌─────────────┐
//! │ DocumentSession  │ ◄────────────► │ RelayServer │   (or LocalTransport
//! │ presence, events │  binary frames │ pub/sub     │    in-process)
//! └────────┬─────────┘                └─────────────┘
//!          │
//!          ▼
//! ┌──────────────────┐                ┌─────────────────┐
//! │ AutoSaveScheduler│ ─────────────► │ SceneRepository │
//! │ VersionStore     │                │ Memory / RocksDB│
//! └──────────────────┘                └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`session`]: `SessionManager` and per-document `DocumentSession`
//! - [`presence`]: roster of remote collaborators, cursor/selection state
//! - [`events`]: fire-and-forget cursor/selection events with echo suppression
//! - [`autosave`]: debounced, single-flight scene saves
//! - [`versions`]: gapless version numbering and safe restore
//! - [`transport`]: pub/sub seam with in-process and WebSocket implementations
//! - [`broadcast`]: channel rooms and fan-out
//! - [`protocol`]: bincode wire frames
//! - [`server`]: WebSocket relay
//! - [`storage`]: persistence seam, memory and RocksDB stores

pub mod autosave;
pub mod broadcast;
pub mod error;
pub mod events;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod transport;
pub mod versions;

pub use autosave::{AutoSaveScheduler, SaveEvent, SaveState, AUTOSAVE_DEBOUNCE};
pub use broadcast::{ChannelRoom, Listeners, RoomManager, RoomStats};
pub use error::{CollabError, Result};
pub use events::{CollaborationEvent, EventBroadcaster, EventKind, EventStats};
pub use presence::{
    presence_color, CollaboratorPresence, Identity, PresenceChange, PresenceChannel,
    PresenceRoster, SelectionRange,
};
pub use protocol::{document_channel, ChannelMessage, ClientFrame, ProtocolError, ServerFrame};
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use session::{DocumentSession, SessionManager};
pub use storage::{CompressedSnapshot, MemoryStore, SceneRepository, StoreError};
#[cfg(feature = "rocksdb")]
pub use storage::{RocksStore, StoreConfig};
pub use transport::{ChannelLink, LocalTransport, Subscription, Transport, WsTransport};
pub use versions::{diff_word_count, RestoreOutcome, VersionStore};
