//! Extensions and the lifecycle signal bus.
//!
//! An [`Extension`] is server-side behaviour layered on top of the core
//! protocol: chat relay, operator handling, mod list broadcasts, and so on.
//! The core knows nothing about what an extension does. It only tells
//! every registered extension about three lifecycle signals per session:
//!
//! ```text
//! on_session_added   ← socket accepted, XNM advertised
//! on_session_joined  ← first COMPANY update carrying the join marker
//! on_session_removed ← transport closed (by either side or by a kick)
//! ```
//!
//! plus every application packet the core doesn't consume itself
//! ([`on_packet`](Extension::on_packet)).
//!
//! # Dispatch rules
//!
//! - Extensions are called in registration order.
//! - Each signal fires at most once per session.
//! - A dispatch iterates over a snapshot of the registry, so registering or
//!   unregistering from inside a hook takes effect from the next dispatch.
//! - Hooks are synchronous. Anything slow belongs in a spawned task.

use std::any::{type_name, TypeId};
use std::sync::{Arc, PoisonError, RwLock};

use nepenthe_protocol::Packet;
use nepenthe_session::{LifecycleSignal, Session, SessionId, SessionRegistry};
use serde_json::{Map, Value};

use crate::config::ServerConfig;

/// Errors from the extension registry.
#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    /// `unregister` was called for a type with no live instance.
    #[error("extension {0} is not registered")]
    NotRegistered(&'static str),

    /// No live extension reports this id.
    #[error("no extension with id {0:?}")]
    UnknownId(String),

    /// The extension reported an empty id.
    #[error("extension id must not be empty")]
    InvalidId,

    /// The extension rejected a state document.
    #[error("extension {id} rejected its state: {reason}")]
    InvalidState { id: String, reason: String },
}

/// Server-side behaviour attached to session lifecycle events.
///
/// All hooks have empty defaults; implement the ones you need. Hooks take
/// `&self` because the server shares one instance across every connection
/// task. Use interior mutability (`Mutex`, atomics) for extension state.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// use nepenthe::prelude::*;
///
/// /// Greets every player that joins.
/// #[derive(Default)]
/// struct Greeter {
///     greeted: AtomicUsize,
/// }
///
/// impl Extension for Greeter {
///     fn id(&self) -> &str {
///         "greeter"
///     }
///
///     fn on_session_joined(&self, _ctx: &ServerContext, session: &Arc<Session>) {
///         self.greeted.fetch_add(1, Ordering::Relaxed);
///         let _ = session.send_chat(Some("server"), "Welcome!");
///     }
/// }
/// ```
pub trait Extension: Send + Sync + 'static {
    /// Stable identifier, used as the key for exported state. Must not be
    /// empty.
    fn id(&self) -> &str;

    /// A session was accepted.
    fn on_session_added(&self, _ctx: &ServerContext, _session: &Arc<Session>) {}

    /// A session joined the game.
    fn on_session_joined(&self, _ctx: &ServerContext, _session: &Arc<Session>) {}

    /// A session closed. It is already gone from the live registry.
    fn on_session_removed(&self, _ctx: &ServerContext, _session: &Arc<Session>) {}

    /// An identified session sent a packet the core doesn't handle.
    fn on_packet(&self, _ctx: &ServerContext, _session: &Arc<Session>, _packet: &Packet) {}

    /// The extension is being unregistered or superseded.
    fn on_destroy(&self, _ctx: &ServerContext) {}

    /// Exports persistent extension state. `None` means stateless.
    fn to_json(&self) -> Option<Value> {
        None
    }

    /// Restores state previously produced by [`to_json`](Self::to_json).
    fn from_json(&self, _state: Value) -> Result<(), ExtensionError> {
        Ok(())
    }
}

/// What an extension can see of the server.
///
/// Cheap to clone. Reads go to the live registry, so results reflect the
/// moment of the call.
#[derive(Clone)]
pub struct ServerContext {
    sessions: Arc<SessionRegistry>,
    config: Arc<ServerConfig>,
}

impl ServerContext {
    pub(crate) fn new(sessions: Arc<SessionRegistry>, config: Arc<ServerConfig>) -> Self {
        Self { sessions, config }
    }

    pub(crate) fn registry(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Snapshot of every live session.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.snapshot()
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Sends `packet` to every live session except `except`.
    pub fn broadcast(&self, packet: &Packet, except: Option<SessionId>) {
        for session in self.sessions() {
            if Some(session.id()) == except {
                continue;
            }
            if let Err(e) = session.send(packet, Default::default()) {
                tracing::warn!(session = %session.id(), error = %e, "broadcast failed");
            }
        }
    }
}

/// One registered extension.
#[derive(Clone)]
struct Subscriber {
    type_id: TypeId,
    type_name: &'static str,
    extension: Arc<dyn Extension>,
}

/// Registry of extensions, in registration order.
#[derive(Default)]
pub(crate) struct ExtensionBus {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl ExtensionBus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Vec<Subscriber> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Adds `extension` at the end of the dispatch order, superseding any
    /// live instance of the same type.
    pub(crate) fn register<E: Extension>(
        &self,
        extension: E,
        ctx: &ServerContext,
    ) -> Result<(), ExtensionError> {
        if extension.id().is_empty() {
            return Err(ExtensionError::InvalidId);
        }
        let type_id = TypeId::of::<E>();
        let subscriber = Subscriber {
            type_id,
            type_name: type_name::<E>(),
            extension: Arc::new(extension),
        };

        let superseded = {
            let mut subscribers = self
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let old = subscribers
                .iter()
                .position(|s| s.type_id == type_id)
                .map(|i| subscribers.remove(i));
            subscribers.push(subscriber);
            old
        };

        if let Some(old) = superseded {
            tracing::info!(extension = old.type_name, "extension superseded");
            old.extension.on_destroy(ctx);
        }
        tracing::info!(extension = type_name::<E>(), "extension registered");
        Ok(())
    }

    /// Removes the live instance of `E`, calling its teardown hook.
    pub(crate) fn unregister<E: Extension>(&self, ctx: &ServerContext) -> Result<(), ExtensionError> {
        let type_id = TypeId::of::<E>();
        let removed = {
            let mut subscribers = self
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            subscribers
                .iter()
                .position(|s| s.type_id == type_id)
                .map(|i| subscribers.remove(i))
        };
        let removed = removed.ok_or(ExtensionError::NotRegistered(type_name::<E>()))?;
        removed.extension.on_destroy(ctx);
        tracing::info!(extension = removed.type_name, "extension unregistered");
        Ok(())
    }

    /// Runs the teardown hook of every extension and empties the registry.
    pub(crate) fn clear(&self, ctx: &ServerContext) {
        let drained = std::mem::take(
            &mut *self
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for subscriber in drained {
            subscriber.extension.on_destroy(ctx);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Ids of the live extensions, in dispatch order.
    pub(crate) fn ids(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|s| s.extension.id().to_owned())
            .collect()
    }

    pub(crate) fn publish(&self, signal: LifecycleSignal, ctx: &ServerContext, session: &Arc<Session>) {
        tracing::debug!(session = %session.id(), ?signal, "publishing lifecycle signal");
        for subscriber in self.snapshot() {
            let extension = &subscriber.extension;
            match signal {
                LifecycleSignal::Added => extension.on_session_added(ctx, session),
                LifecycleSignal::Joined => extension.on_session_joined(ctx, session),
                LifecycleSignal::Removed => extension.on_session_removed(ctx, session),
            }
        }
    }

    pub(crate) fn dispatch_packet(&self, ctx: &ServerContext, session: &Arc<Session>, packet: &Packet) {
        for subscriber in self.snapshot() {
            subscriber.extension.on_packet(ctx, session, packet);
        }
    }

    /// State of every stateful extension, keyed by extension id.
    pub(crate) fn export(&self) -> Map<String, Value> {
        self.snapshot()
            .iter()
            .filter_map(|s| {
                let state = s.extension.to_json()?;
                Some((s.extension.id().to_owned(), state))
            })
            .collect()
    }

    /// Hands `state` to the extension reporting `id`.
    pub(crate) fn import(&self, id: &str, state: Value) -> Result<(), ExtensionError> {
        let subscriber = self
            .snapshot()
            .into_iter()
            .find(|s| s.extension.id() == id)
            .ok_or_else(|| ExtensionError::UnknownId(id.to_owned()))?;
        subscriber.extension.from_json(state)
    }
}
