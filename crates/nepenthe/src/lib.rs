//! # Nepenthe
//!
//! A multiplayer server for GDTMP-compatible game clients.
//!
//! Nepenthe accepts WebSocket connections, runs each through the session
//! protocol (version negotiation, identification, joining), keeps player
//! records in a pluggable store, and tells registered [`Extension`]s about
//! every session's lifecycle. Game-specific behaviour (chat relay, operator
//! commands, ...) lives in extensions.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nepenthe::prelude::*;
//!
//! # async fn run() -> Result<(), NepentheError> {
//! let server = NepentheServer::builder()
//!     .bind("127.0.0.1", 1080)
//!     .build();
//! server.start().await?;
//! tokio::signal::ctrl_c().await.ok();
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod error;
mod extension;
mod handler;
pub mod logging;
mod server;

pub use error::NepentheError;
pub use extension::{Extension, ExtensionError, ServerContext};
pub use server::{NepentheServer, NepentheServerBuilder};

pub use nepenthe_protocol as protocol;
pub use nepenthe_session as session;
pub use nepenthe_transport as transport;

/// Re-exports of the types most servers and extensions need.
pub mod prelude {
    pub use crate::config::{GameplayConfig, OriginConfig, ServerConfig, UsersConfig};
    pub use crate::{
        Extension, ExtensionError, NepentheError, NepentheServer, NepentheServerBuilder,
        ServerContext,
    };
    pub use nepenthe_protocol::{ids, LegacyValue, Packet, PacketData, PlayerRecord, SendOptions, WireMode};
    pub use nepenthe_session::{
        AuthCode, LifecycleState, MemoryStore, ModDescriptor, PersistenceError, PlayerStore,
        Session, SessionConfig, SessionError, SessionId,
    };
}
