//! Error types for the session layer.

use nepenthe_protocol::ProtocolError;

use crate::SessionId;

/// Errors that can occur during session management.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A packet could not be encoded for the wire.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session with this id is already live in the registry.
    #[error("session {0} is already registered")]
    AlreadyRegistered(SessionId),

    /// No live session has this id.
    #[error("session {0} not found")]
    NotFound(SessionId),
}

/// Errors reported by a [`PlayerStore`](crate::PlayerStore).
///
/// "No record for this code" is not an error; stores return `Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// The backing store failed (I/O, unreachable service, ...).
    #[error("store backend failed: {0}")]
    Backend(String),

    /// A stored document no longer decodes as a player record.
    #[error("stored record is corrupt: {0}")]
    Corrupt(#[from] ProtocolError),

    /// The background save task was cancelled or panicked.
    #[error("save task did not complete: {0}")]
    TaskFailed(String),
}
