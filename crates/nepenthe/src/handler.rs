//! Per-connection handler: session setup, packet loop, teardown.
//!
//! Each accepted connection gets its own Tokio task running
//! [`handle_connection`], plus a writer task that owns the outbound half.
//! The flow is:
//!   1. Register a fresh session, advertise `XNM`, publish `added`
//!   2. Loop: receive frames → session state machine → act on its events
//!   3. On close (either side, or a kick): start the final save in the
//!      background, unregister, publish `removed`, then flush and close the
//!      socket
//!
//! Packets for one session are handled strictly in arrival order: the loop
//! awaits each packet's side effects (record load, server-side save) before
//! reading the next frame.

use std::sync::Arc;
use std::time::Duration;

use nepenthe_protocol::{ids, LegacyValue};
use nepenthe_session::{
    LifecycleSignal, Outbound, PersistenceError, PlayerStore, Session, SessionError,
    SessionEvent, SessionId, SessionIo,
};
use nepenthe_transport::{Connection, WebSocketConnection};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::server::ServerState;
use crate::NepentheError;

/// How often the writer pings the peer when keepalive is on.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// How long teardown waits for queued frames to flush.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

const LOAD_FAILED_NOTICE: &str = "Failed to load your saved data, starting fresh.";
const SAVE_FAILED_NOTICE: &str = "Failed to save player data";

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<S: PlayerStore>(
    conn: WebSocketConnection,
    state: Arc<ServerState<S>>,
) -> Result<(), NepentheError> {
    let conn = Arc::new(conn);
    let (session, io) = register_session(&conn, &state)?;
    let SessionIo { outbound, mut closing } = io;
    tracing::info!(
        session = %session.id(),
        conn = %conn.id(),
        addr = ?conn.remote_addr(),
        "client connected"
    );

    let keepalive = state.ctx.config().origin.keepalive;
    let mut writer = tokio::spawn(write_loop(Arc::clone(&conn), outbound, keepalive));

    let result = async {
        session.open()?;
        publish(&state, &session, LifecycleSignal::Added);

        loop {
            tokio::select! {
                // A pending close wins over frames that are already readable.
                biased;
                changed = closing.changed() => {
                    if changed.is_err() || *closing.borrow() {
                        break;
                    }
                }
                frame = conn.recv() => match frame {
                    Ok(Some(frame)) => {
                        for event in session.handle_frame(&frame) {
                            handle_event(&state, &session, event).await;
                        }
                    }
                    Ok(None) => {
                        tracing::debug!(session = %session.id(), "peer closed the connection");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(session = %session.id(), error = %e, "recv error");
                        break;
                    }
                },
            }
        }
        Ok::<(), NepentheError>(())
    }
    .await;

    close_session(&state, &session);

    // Let the writer flush whatever was queued before the close.
    session.close();
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
        tracing::debug!(session = %session.id(), "writer did not finish, aborting");
        writer.abort();
    }
    tracing::info!(session = %session.id(), "client disconnected");
    result
}

/// Creates the session and inserts it under a fresh, unused id.
fn register_session<S: PlayerStore>(
    conn: &WebSocketConnection,
    state: &ServerState<S>,
) -> Result<(Arc<Session>, SessionIo), NepentheError> {
    loop {
        let (session, io) = Session::new(
            SessionId::random(),
            conn.remote_addr(),
            state.session_config.clone(),
        );
        match state.ctx.registry().insert(Arc::clone(&session)) {
            Ok(()) => return Ok((session, io)),
            Err(SessionError::AlreadyRegistered(id)) => {
                tracing::debug!(session = %id, "session id collision, drawing again");
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Runs the close side effects exactly once.
fn close_session<S: PlayerStore>(state: &ServerState<S>, session: &Arc<Session>) {
    if !session.mark_closed() {
        return;
    }
    if let Some(code) = session.code() {
        // Not awaited: the next load for this code queues behind it.
        let _ = state.persistence.save_detached(code, session.record());
    }
    state.ctx.registry().remove(session.id());
    publish(state, session, LifecycleSignal::Removed);
}

fn publish<S: PlayerStore>(state: &ServerState<S>, session: &Arc<Session>, signal: LifecycleSignal) {
    if session.claim_signal(signal) {
        state.extensions.publish(signal, &state.ctx, session);
    }
}

async fn handle_event<S: PlayerStore>(
    state: &ServerState<S>,
    session: &Arc<Session>,
    event: SessionEvent,
) {
    let gameplay = &state.ctx.config().gameplay;
    match event {
        SessionEvent::Identified { code } => {
            send_or_log(session, ids::SETTINGS, gameplay.settings_fields());
            match state.persistence.load(code).await {
                Ok(Some(record)) => {
                    tracing::debug!(session = %session.id(), %code, "player record loaded");
                    session.replace_record(record);
                }
                Ok(None) => {
                    tracing::debug!(session = %session.id(), %code, "no stored record");
                }
                Err(e) => {
                    tracing::warn!(session = %session.id(), %code, error = %e, "failed to load player record");
                    if let Err(e) = session.send_chat(None, LOAD_FAILED_NOTICE) {
                        tracing::warn!(session = %session.id(), error = %e, "failed to send notice");
                    }
                }
            }
        }
        SessionEvent::Joined => publish(state, session, LifecycleSignal::Joined),
        SessionEvent::RecordUpdated if gameplay.serversidesave => {
            // The peer has already been told through SAVEFAIL.
            let _ = save_record(state, session).await;
        }
        SessionEvent::Poll => {
            let fields = gameplay.poll_fields(
                state.ctx.session_count(),
                &state.session_config.min_client_version,
            );
            send_or_log(session, ids::POLLRES, fields);
        }
        SessionEvent::Application(packet) => {
            state.extensions.dispatch_packet(&state.ctx, session, &packet);
        }
        SessionEvent::RecordUpdated | SessionEvent::Upgraded | SessionEvent::Kicked { .. } => {}
    }
}

/// Saves the session's record now and tells the peer how it went.
///
/// Returns `Ok(false)` for a session that hasn't identified yet (there is
/// no key to save under).
pub(crate) async fn save_record<S: PlayerStore>(
    state: &ServerState<S>,
    session: &Session,
) -> Result<bool, PersistenceError> {
    let Some(code) = session.code() else {
        return Ok(false);
    };
    match state.persistence.save(code, &session.record()).await {
        Ok(()) => {
            send_or_log(session, ids::SAVEDATA, [code.0]);
            Ok(true)
        }
        Err(e) => {
            send_or_log(session, ids::SAVEFAIL, [SAVE_FAILED_NOTICE]);
            Err(e)
        }
    }
}

fn send_or_log<I, V>(session: &Session, id: &str, fields: I)
where
    I: IntoIterator<Item = V>,
    V: Into<LegacyValue>,
{
    if let Err(e) = session.send_legacy(id, fields) {
        tracing::warn!(session = %session.id(), packet = id, error = %e, "failed to send packet");
    }
}

/// Drains the session's outbound queue into the socket, pinging the peer
/// while idle when `keepalive` is on.
async fn write_loop(
    conn: Arc<WebSocketConnection>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    keepalive: bool,
) {
    let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            item = outbound.recv() => match item {
                Some(Outbound::Frame(frame)) => {
                    if let Err(e) = conn.send(frame).await {
                        tracing::debug!(conn = %conn.id(), error = %e, "send failed");
                        break;
                    }
                }
                Some(Outbound::Close) | None => break,
            },
            _ = ticker.tick(), if keepalive => {
                if let Err(e) = conn.ping().await {
                    tracing::debug!(conn = %conn.id(), error = %e, "keepalive ping failed");
                    break;
                }
            }
        }
    }

    if let Err(e) = conn.close().await {
        tracing::trace!(conn = %conn.id(), error = %e, "close after shutdown");
    }
}
