//! # folio-core: manuscript scene model
//!
//! Plain data types shared by the collaboration layer plus the canonical
//! word-count rules. Nothing in this crate performs I/O.
//!
//! - [`scene`]: `SceneDocument` (the live buffer) and `SceneVersion`
//!   (an immutable snapshot in a scene's history)
//! - [`wordcount`]: word counting, delta application and the running
//!   aggregate that is periodically reconciled against a full recount

use uuid::Uuid;

pub mod scene;
pub mod wordcount;

pub use scene::{SceneDocument, SceneVersion, AUTOSAVE_LABEL, RESTORE_SAFETY_LABEL};
pub use wordcount::{apply_delta, compute_word_count, WordCountTotals, RECONCILE_EVERY_SAVES};

/// Identifier of a manuscript document (one collaboration channel each).
pub type DocumentId = Uuid;

/// Identifier of a scene, the smallest addressable unit of manuscript text.
pub type SceneId = Uuid;

/// Identifier of a stored scene version.
pub type VersionId = Uuid;

/// Identifier of a user, as issued by the identity provider.
pub type UserId = Uuid;
