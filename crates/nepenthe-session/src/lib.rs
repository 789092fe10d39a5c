//! Session layer for Nepenthe.
//!
//! This crate owns everything that happens to one peer between accept and
//! close:
//!
//! 1. **State machine**: negotiation, identification, joining
//!    ([`Session`])
//! 2. **Tracking**: which sessions are live ([`SessionRegistry`])
//! 3. **Persistence**: loading and saving player records through the
//!    [`PlayerStore`] port, ordered per player ([`Persistence`])
//!
//! # How it fits in the stack
//!
//! ```text
//! Server (above)  ← drives connections, publishes signals to extensions
//!     ↕
//! Session Layer (this crate)  ← lifecycle, wire mode, player record
//!     ↕
//! Protocol Layer (below)  ← Packet, PlayerRecord, frame codecs
//! ```

mod error;
mod persistence;
mod registry;
mod session;
mod store;

pub use error::{PersistenceError, SessionError};
pub use persistence::Persistence;
pub use registry::SessionRegistry;
pub use session::{
    AuthCode, LifecycleSignal, LifecycleState, ModDescriptor, Outbound, Session, SessionConfig,
    SessionEvent, SessionId, SessionIo, DEFAULT_KICK_REASON, INVALID_CODE_REASON,
    MALFORMED_COMPANY_REASON, MALFORMED_PACKET_REASON, OUTDATED_CLIENT_REASON,
};
pub use store::{MemoryStore, PlayerStore};
