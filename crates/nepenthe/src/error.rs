//! Unified error type for Nepenthe.

use nepenthe_protocol::ProtocolError;
use nepenthe_session::{PersistenceError, SessionError};
use nepenthe_transport::TransportError;

use crate::ExtensionError;

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `nepenthe` crate you deal with this single error type
/// instead of importing errors from each layer. The `#[from]` attribute on
/// each variant auto-generates `From` impls, so `?` converts layer errors
/// automatically.
#[derive(Debug, thiserror::Error)]
pub enum NepentheError {
    /// A transport-level error (send, recv, accept).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The listening socket could not be opened.
    #[error("failed to launch server: {0}")]
    Start(#[source] TransportError),

    /// A protocol-level error (encode, decode, invalid message).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session-level error (registry collision, unknown session).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The persistence port failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// An extension-registry error.
    #[error(transparent)]
    Extension(#[from] ExtensionError),

    /// The configuration file could not be read or parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
}
