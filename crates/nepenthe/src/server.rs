//! `NepentheServer` builder, start/stop, and the accept loop.
//!
//! This is the entry point for running a Nepenthe server. It ties together
//! all the layers: transport → protocol → session → extensions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use nepenthe_protocol::{ProtocolError, StatusDocument};
use nepenthe_session::{
    MemoryStore, Persistence, PlayerStore, Session, SessionConfig, SessionError, SessionId,
    SessionRegistry,
};
use nepenthe_transport::{Transport, TransportError, WebSocketTransport};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::extension::{Extension, ExtensionBus, ServerContext};
use crate::handler::{handle_connection, save_record};
use crate::NepentheError;

/// How long `stop` waits for live sessions to finish closing.
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared server state passed to each connection handler task.
///
/// Wrapped in `Arc` so it can be cheaply cloned across tasks. Every field
/// synchronises internally.
pub(crate) struct ServerState<S> {
    pub(crate) ctx: ServerContext,
    pub(crate) extensions: ExtensionBus,
    pub(crate) persistence: Arc<Persistence<S>>,
    pub(crate) session_config: SessionConfig,
}

/// Builder for configuring a Nepenthe server.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use nepenthe::prelude::*;
///
/// # async fn run() -> Result<(), NepentheError> {
/// let server = NepentheServer::builder()
///     .config(ServerConfig::from_path("config.json")?)
///     .store(Arc::new(MemoryStore::new()))
///     .build();
/// let addr = server.start().await?;
/// println!("listening on {addr}");
/// # Ok(())
/// # }
/// ```
pub struct NepentheServerBuilder<S = MemoryStore> {
    config: ServerConfig,
    session_config: SessionConfig,
    store: Arc<S>,
}

impl NepentheServerBuilder<MemoryStore> {
    /// Creates a builder with default settings and an in-memory store.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            session_config: SessionConfig::default(),
            store: Arc::new(MemoryStore::new()),
        }
    }
}

impl Default for NepentheServerBuilder<MemoryStore> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: PlayerStore> NepentheServerBuilder<S> {
    /// Replaces the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the address to bind to.
    pub fn bind(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.origin.host = host.into();
        self.config.origin.port = port;
        self
    }

    /// Sets the per-session protocol settings.
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Uses `store` as the persistence port.
    pub fn store<T: PlayerStore>(self, store: Arc<T>) -> NepentheServerBuilder<T> {
        NepentheServerBuilder {
            config: self.config,
            session_config: self.session_config,
            store,
        }
    }

    /// Builds the server. Nothing is bound until [`start`](NepentheServer::start).
    pub fn build(self) -> NepentheServer<S> {
        let ctx = ServerContext::new(Arc::new(SessionRegistry::new()), Arc::new(self.config));
        let state = Arc::new(ServerState {
            ctx,
            extensions: ExtensionBus::new(),
            persistence: Arc::new(Persistence::new(self.store)),
            session_config: self.session_config,
        });
        NepentheServer {
            state,
            running: Mutex::new(None),
        }
    }
}

struct Running {
    addr: SocketAddr,
    accept: JoinHandle<()>,
}

/// A Nepenthe server.
///
/// [`start`](Self::start) binds the listener and begins accepting;
/// [`stop`](Self::stop) closes it and every live session. Both are
/// idempotent, and a stopped server can be started again.
pub struct NepentheServer<S: PlayerStore = MemoryStore> {
    state: Arc<ServerState<S>>,
    running: Mutex<Option<Running>>,
}

impl NepentheServer<MemoryStore> {
    /// Creates a new builder.
    pub fn builder() -> NepentheServerBuilder<MemoryStore> {
        NepentheServerBuilder::new()
    }
}

impl<S: PlayerStore> NepentheServer<S> {
    /// Binds the listener and spawns the accept loop. Returns the bound
    /// address.
    ///
    /// Calling `start` on a running server returns its address and does
    /// nothing else.
    ///
    /// # Errors
    /// [`NepentheError::Start`] if the address can't be bound.
    pub async fn start(&self) -> Result<SocketAddr, NepentheError> {
        let mut running = self.running.lock().await;
        if let Some(running) = running.as_ref() {
            return Ok(running.addr);
        }

        let config = self.state.ctx.config();
        let status = StatusDocument::running(&config.gameplay.motd, &config.gameplay.description);
        let body = serde_json::to_string(&status).map_err(ProtocolError::Encode)?;

        let bind_addr = config.bind_addr();
        let transport = WebSocketTransport::bind(&bind_addr)
            .await
            .map_err(NepentheError::Start)?
            .with_status(body);
        let addr = transport.local_addr().map_err(|source| {
            NepentheError::Start(TransportError::BindFailed {
                addr: bind_addr,
                source,
            })
        })?;

        let accept = tokio::spawn(accept_loop(transport, Arc::clone(&self.state)));
        *running = Some(Running { addr, accept });
        tracing::info!(%addr, "Nepenthe server running");
        Ok(addr)
    }

    /// Stops accepting, closes every live session, and waits briefly for
    /// them to finish closing. Stopping a stopped server does nothing.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.accept.abort();
        // Awaiting the aborted task drops the listener.
        let _ = running.accept.await;

        let sessions = self.state.ctx.sessions();
        tracing::info!(live = sessions.len(), "stopping server");
        for session in &sessions {
            session.close();
        }

        let registry = self.state.ctx.registry();
        let drained = tokio::time::timeout(STOP_DRAIN_TIMEOUT, async {
            while !registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(live = registry.len(), "sessions still closing after stop");
        }
        tracing::info!("Nepenthe server stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Address the listener is bound to, while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.addr)
    }

    /// The view of the server that extensions get.
    pub fn context(&self) -> &ServerContext {
        &self.state.ctx
    }

    pub fn config(&self) -> &ServerConfig {
        self.state.ctx.config()
    }

    /// Snapshot of every live session.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.state.ctx.sessions()
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.state.ctx.session(id)
    }

    /// The persistence port.
    pub fn store(&self) -> &Arc<S> {
        self.state.persistence.store()
    }

    // -- Extensions -------------------------------------------------------

    /// Registers `extension`, superseding a live instance of the same type.
    ///
    /// # Errors
    /// [`ExtensionError::InvalidId`](crate::ExtensionError::InvalidId) if
    /// the extension reports an empty id; nothing is registered then.
    pub fn register<E: Extension>(&self, extension: E) -> Result<(), NepentheError> {
        Ok(self.state.extensions.register(extension, &self.state.ctx)?)
    }

    /// Unregisters the live instance of `E`.
    ///
    /// # Errors
    /// [`ExtensionError::NotRegistered`](crate::ExtensionError::NotRegistered)
    /// if there is none; the registry is left untouched.
    pub fn unregister<E: Extension>(&self) -> Result<(), NepentheError> {
        Ok(self.state.extensions.unregister::<E>(&self.state.ctx)?)
    }

    /// Unregisters every extension.
    pub fn clear_extensions(&self) {
        self.state.extensions.clear(&self.state.ctx);
    }

    /// Ids of the registered extensions, in dispatch order.
    pub fn extension_ids(&self) -> Vec<String> {
        self.state.extensions.ids()
    }

    pub fn extension_count(&self) -> usize {
        self.state.extensions.len()
    }

    /// State of every stateful extension, keyed by extension id.
    pub fn export_extensions(&self) -> Map<String, Value> {
        self.state.extensions.export()
    }

    /// Restores the state of the extension with the given id.
    pub fn import_extension(&self, id: &str, state: Value) -> Result<(), NepentheError> {
        Ok(self.state.extensions.import(id, state)?)
    }

    // -- Persistence ------------------------------------------------------

    /// Saves a live session's record now and tells the peer the outcome
    /// (`SAVEDATA` or `SAVEFAIL`). Returns `false` when the session hasn't
    /// identified yet.
    ///
    /// # Errors
    /// [`SessionError::NotFound`] for an unknown id, or the store's error.
    pub async fn save_session(&self, id: SessionId) -> Result<bool, NepentheError> {
        let session = self
            .state
            .ctx
            .session(id)
            .ok_or(SessionError::NotFound(id))?;
        Ok(save_record(&self.state, &session).await?)
    }
}

/// Accepts connections until aborted, spawning a handler task for each.
async fn accept_loop<S: PlayerStore>(mut transport: WebSocketTransport, state: Arc<ServerState<S>>) {
    loop {
        match transport.accept().await {
            Ok(conn) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(conn, state).await {
                        tracing::debug!(error = %e, "connection ended with error");
                    }
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "accept failed");
            }
        }
    }
}
