pub mod dbnotes;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use dbnotes::DbNotes;

/// Errors surfaced by a note backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Other(String),
}

/// A note as stored by the backing application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteRecord {
    pub id: i64,
    pub owner_id: i64,
    /// JSON-encoded array of content blocks, if the note has ever been
    /// saved with content.
    pub content: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Display profile of a participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub user_name: String,
    pub avatar: Option<String>,
}

/// Storage interface the relay talks to for access checks, profile
/// lookups and note persistence. The relay owns no data of its own, so
/// everything durable goes through this trait.
#[async_trait]
pub trait NoteBackend: Send + Sync {
    /// Whether `user_id` may open `note_id`. True for the note owner
    /// and for anyone holding a note permission grant.
    async fn has_note_access(&self, user_id: i64, note_id: i64) -> Result<bool, BackendError>;

    /// Fetch the display profile for a user, if one exists.
    async fn get_profile(&self, user_id: i64) -> Result<Option<UserProfile>, BackendError>;

    /// Load a note row, or None if the note does not exist.
    async fn load_note(&self, note_id: i64) -> Result<Option<NoteRecord>, BackendError>;

    /// Overwrite the stored content of a note with a fresh JSON block
    /// array and bump its update timestamp.
    async fn save_note_content(&self, note_id: i64, content: &str) -> Result<(), BackendError>;
}
