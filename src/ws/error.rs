use thiserror::Error;

use crate::db::BackendError;
use crate::protocol::ProtocolError;

/// Close code sent when the upgrade carries no usable credential.
pub const CLOSE_UNAUTHORIZED: u16 = 4401;
/// Close code sent when an authenticated user may not open a note.
pub const CLOSE_ACCESS_DENIED: u16 = 4403;

/// Everything that can go wrong on the relay path. Protocol errors are
/// recoverable (the offending frame is dropped), the rest end or block
/// the session depending on where they surface.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("user {user_id} has no access to note {note_id}")]
    AccessDenied { user_id: i64, note_id: i64 },
    #[error("note {0} not found")]
    NoteNotFound(i64),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("failed to persist note {note_id}: {reason}")]
    Persistence { note_id: i64, reason: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
}
