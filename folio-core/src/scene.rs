use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::wordcount::compute_word_count;
use crate::{SceneId, VersionId};

/// Label given to the snapshot taken right before a restore.
pub const RESTORE_SAFETY_LABEL: &str = "Auto-save before restore";

/// Label used for automatic versions created without an explicit label.
pub const AUTOSAVE_LABEL: &str = "Auto-save";

/// The live, editable copy of a scene held by the editing client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneDocument {
    pub id: SceneId,
    pub content: String,
    pub word_count: usize,
    /// `None` until the first successful save in this session.
    pub last_saved_at: Option<DateTime<Utc>>,
}

impl SceneDocument {
    pub fn new(id: SceneId, content: impl Into<String>) -> Self {
        let content = content.into();
        let word_count = compute_word_count(&content);
        Self {
            id,
            content,
            word_count,
            last_saved_at: None,
        }
    }

    /// Replace the buffer content and recompute the word count.
    ///
    /// Returns the previous word count.
    pub fn set_content(&mut self, content: impl Into<String>) -> usize {
        let previous = self.word_count;
        self.content = content.into();
        self.word_count = compute_word_count(&self.content);
        previous
    }

    pub fn mark_saved(&mut self, at: DateTime<Utc>) {
        self.last_saved_at = Some(at);
    }
}

/// An immutable snapshot of a scene's content.
///
/// `version_number` starts at 1 and is gapless per scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneVersion {
    pub id: VersionId,
    pub scene_id: SceneId,
    pub version_number: u64,
    pub label: String,
    pub content: String,
    pub word_count: usize,
    pub is_auto_save: bool,
    pub created_at: DateTime<Utc>,
}

impl SceneVersion {
    /// Build the next snapshot for a scene. The word count is derived from
    /// `content` with the canonical counter.
    pub fn new(
        scene_id: SceneId,
        version_number: u64,
        label: impl Into<String>,
        content: impl Into<String>,
        is_auto_save: bool,
    ) -> Self {
        let content = content.into();
        let word_count = compute_word_count(&content);
        Self {
            id: Uuid::new_v4(),
            scene_id,
            version_number,
            label: label.into(),
            content,
            word_count,
            is_auto_save,
            created_at: Utc::now(),
        }
    }

    /// Signed difference between this version and the current buffer.
    ///
    /// Positive when the version is longer. Informational only.
    pub fn word_count_diff(&self, current_word_count: usize) -> i64 {
        self.word_count as i64 - current_word_count as i64
    }
}
