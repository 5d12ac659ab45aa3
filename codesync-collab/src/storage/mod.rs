//! Draft persistence.
//!
//! ```text
//! ┌───────────────┐  save / load   ┌──────────────────┐
//! │ SessionClient │ ─────────────► │ dyn DraftStore   │
//! └───────────────┘                └────────┬─────────┘
//!                                           │
//!                        ┌──────────────────┴──────────────────┐
//!                        ▼                                     ▼
//!               MemoryDraftStore                      RocksDraftStore
//!               (tests, embedding)             CF "drafts"     id  → record
//!                                              CF "draft_keys" key → id
//! ```
//!
//! A draft is addressed two ways: by its session key (user + question), which
//! is how the editor finds it when a question is opened, and by the id handed
//! out on first save. Saving the same key again updates that record in place.
//! Drafts are independent of the relay; a failed save never touches a live
//! session.

pub mod memory;
pub mod rocks;

pub use memory::MemoryDraftStore;
pub use rocks::{RocksDraftStore, StoreConfig};

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::language::Language;

/// Identifies one user's work on one question.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DraftKey {
    pub user_id: String,
    pub question_id: String,
}

impl DraftKey {
    pub fn new(user_id: impl Into<String>, question_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            question_id: question_id.into(),
        }
    }
}

impl fmt::Display for DraftKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.question_id)
    }
}

/// Grading state of a saved solution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// Saved without running
    Draft,
    /// Submitted, not graded yet
    #[default]
    Pending,
    Passed,
    Failed,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verdict::Draft => "draft",
            Verdict::Pending => "pending",
            Verdict::Passed => "passed",
            Verdict::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What a caller hands to [`DraftStore::save`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    pub key: DraftKey,
    pub code: String,
    pub language: Language,
    pub verdict: Verdict,
}

/// A stored draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftRecord {
    pub id: Uuid,
    pub key: DraftKey,
    pub code: String,
    pub language: Language,
    pub verdict: Verdict,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl DraftRecord {
    pub(crate) fn new(id: Uuid, draft: &Draft) -> Self {
        let now = now_secs();
        Self {
            id,
            key: draft.key.clone(),
            code: draft.code.clone(),
            language: draft.language,
            verdict: draft.verdict,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrite the payload, keeping id and creation time.
    pub(crate) fn apply(&mut self, draft: &Draft) {
        self.key = draft.key.clone();
        self.code = draft.code.clone();
        self.language = draft.language;
        self.verdict = draft.verdict;
        self.updated_at = now_secs().max(self.created_at);
    }
}

/// Backing store for drafts.
pub trait DraftStore: Send + Sync {
    /// Upsert by session key. Returns the record id, which is stable across
    /// saves of the same key.
    fn save(&self, draft: &Draft) -> Result<Uuid, StoreError>;

    /// Upsert by id. An unknown id creates a record under that id; if the
    /// key was stored under a different id, the key now points at `id`.
    fn update(&self, id: Uuid, draft: &Draft) -> Result<Uuid, StoreError>;

    /// The saved draft for a session, if any.
    fn load(&self, key: &DraftKey) -> Result<Option<DraftRecord>, StoreError>;

    fn get(&self, id: Uuid) -> Result<Option<DraftRecord>, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Store lock poisoned")]
    LockPoisoned,
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
