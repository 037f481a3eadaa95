//! Error taxonomy for the collaboration core.
//!
//! Nothing in this crate retries on its own; every failure is handed back to
//! the caller, who decides whether to try again.

use folio_core::{SceneId, VersionId};
use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::storage::StoreError;

#[derive(Debug, Error)]
pub enum CollabError {
    /// Channel subscribe/track/broadcast failure. Non-fatal: the session
    /// keeps working as a single-user editor.
    #[error("transport error: {0}")]
    Transport(String),

    /// Save or version write failed. The in-memory buffer is kept.
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// Input rejected before anything was written.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("scene {0} is not open")]
    SceneNotOpen(SceneId),

    #[error("no scene is open")]
    NoActiveScene,

    #[error("version {version_id} not found for scene {scene_id}")]
    VersionNotFound {
        scene_id: SceneId,
        version_id: VersionId,
    },
}

impl CollabError {
    pub fn transport(msg: impl Into<String>) -> Self {
        CollabError::Transport(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        CollabError::Validation(msg.into())
    }

    /// Whether this failure only affects collaboration (presence/events)
    /// and editing can continue.
    pub fn is_transport(&self) -> bool {
        matches!(self, CollabError::Transport(_))
    }
}

impl From<ProtocolError> for CollabError {
    fn from(e: ProtocolError) -> Self {
        CollabError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CollabError>;
