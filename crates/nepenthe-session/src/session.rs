//! The per-connection session: identity, wire mode, lifecycle state, and
//! the protocol state machine that drives them.
//!
//! ```text
//!   Connected ──open()──→ Authenticating ──REQID──→ Identified ──COMPANY+join──→ Joined
//!       │                       │                        │                         │
//!       └───────────────────────┴────── close / kick ────┴─────────────────────────┴──→ Closed
//! ```
//!
//! Wire mode is tracked separately: an `XNM` acknowledgement flips it from
//! legacy to upgraded at any point before `Closed`, and it never flips back.
//!
//! A [`Session`] never touches the socket. Outbound frames go into an
//! unbounded queue drained by the connection's writer task, and close
//! requests are signalled through a watch channel; both halves are handed
//! to the connection handler as [`SessionIo`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use nepenthe_protocol::legacy::SEPARATORS;
use nepenthe_protocol::{
    decode_frame, encode_frame, ids, ClientVersion, LegacyValue, Packet, PacketData,
    PlayerRecord, SendOptions, WireMode, MIN_CLIENT_VERSION, POSITIONAL_FIELDS, PROTOCOL_VERSION,
};
use nepenthe_transport::Frame;
use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::SessionError;

/// Kick reason for a missing or too-old client version.
pub const OUTDATED_CLIENT_REASON: &str = "You're running an old version of GDTMP. Please update.";

/// Kick reason for a non-numeric authentication code.
pub const INVALID_CODE_REASON: &str = "Your client code is invalid.";

/// Kick reason for a frame that doesn't decode.
pub const MALFORMED_PACKET_REASON: &str = "Malformed packet.";

/// Kick reason for a `COMPANY` packet whose fields don't coerce.
pub const MALFORMED_COMPANY_REASON: &str = "Malformed company data.";

/// Default kick reason.
pub const DEFAULT_KICK_REASON: &str = "You've been kicked from the server.";

/// Lowest and highest session id handed out. Ids stay below 2^53 so
/// clients that store them as doubles keep them exact.
const SESSION_ID_RANGE: std::ops::Range<u64> = 100_000_000_000_000..(1 << 53);

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Server-assigned session id.
///
/// Random, not guaranteed unique; the registry rejects a colliding id and
/// the caller draws again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Draws a fresh random id.
    pub fn random() -> Self {
        Self(rand::rng().random_range(SESSION_ID_RANGE))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Authentication code supplied by the peer in `REQID`; also the
/// persistence key for its player record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AuthCode(pub i64);

impl fmt::Display for AuthCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A client extension ("mod") declared by the peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModDescriptor {
    pub id: String,
    pub name: String,
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Where a session is in its lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    /// Socket accepted, nothing sent yet.
    Connected,
    /// `XNM` advertised; waiting for `REQID`.
    Authenticating,
    /// `REQID` accepted; application packets are processed.
    Identified,
    /// A join-marked `COMPANY` update has been seen.
    Joined,
    /// Terminal.
    Closed,
}

impl LifecycleState {
    /// Returns `true` once the peer has identified itself (and until close).
    pub fn is_identified(self) -> bool {
        matches!(self, Self::Identified | Self::Joined)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connected => "Connected",
            Self::Authenticating => "Authenticating",
            Self::Identified => "Identified",
            Self::Joined => "Joined",
            Self::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// The three signals published to extensions, each at most once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleSignal {
    Added,
    Joined,
    Removed,
}

impl LifecycleSignal {
    fn index(self) -> usize {
        match self {
            Self::Added => 0,
            Self::Joined => 1,
            Self::Removed => 2,
        }
    }
}

/// What the connection handler must act on after a packet was applied.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// `REQID` accepted and `YOURID` sent; the record should be loaded.
    Identified { code: AuthCode },
    /// Wire mode flipped to upgraded.
    Upgraded,
    /// The session entered `Joined`.
    Joined,
    /// A `COMPANY` update replaced the player record.
    RecordUpdated,
    /// The peer asked for `POLLRES`.
    Poll,
    /// A packet the core doesn't consume, for extensions.
    Application(Packet),
    /// The session kicked its peer.
    Kicked { reason: String },
}

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Per-session protocol settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Oldest client version accepted in `REQID`.
    pub min_client_version: ClientVersion,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_client_version: MIN_CLIENT_VERSION
                .parse()
                .unwrap_or_else(|_| ClientVersion::from_components(vec![0])),
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Items queued for the connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    Frame(Frame),
    /// Flush what's queued so far, then close the transport.
    Close,
}

/// The I/O halves of a session, owned by its connection handler.
pub struct SessionIo {
    /// Frames to write, in order.
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    /// Flips to `true` when the session asks for its transport to close.
    pub closing: watch::Receiver<bool>,
}

#[derive(Debug)]
struct SessionData {
    state: LifecycleState,
    wire_mode: WireMode,
    code: Option<AuthCode>,
    client_version: Option<ClientVersion>,
    mods: Vec<ModDescriptor>,
    record: PlayerRecord,
    signals: [bool; 3],
}

/// One connected peer.
///
/// Shared as `Arc<Session>` between its connection handler, the session
/// registry, and extensions. Everything but the handler only reads state
/// or queues packets through the public send operations; the lifecycle is
/// advanced exclusively by [`handle_frame`](Self::handle_frame),
/// [`handle_packet`](Self::handle_packet), and
/// [`mark_closed`](Self::mark_closed).
pub struct Session {
    id: SessionId,
    remote_addr: Option<SocketAddr>,
    config: SessionConfig,
    data: RwLock<SessionData>,
    outbound: mpsc::UnboundedSender<Outbound>,
    closing: watch::Sender<bool>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.read();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &data.state)
            .field("wire_mode", &data.wire_mode)
            .field("code", &data.code)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates a session in `Connected` state, plus the I/O halves its
    /// handler drives.
    pub fn new(
        id: SessionId,
        remote_addr: Option<SocketAddr>,
        config: SessionConfig,
    ) -> (Arc<Self>, SessionIo) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (closing_tx, closing_rx) = watch::channel(false);
        let session = Arc::new(Self {
            id,
            remote_addr,
            config,
            data: RwLock::new(SessionData {
                state: LifecycleState::Connected,
                wire_mode: WireMode::Legacy,
                code: None,
                client_version: None,
                mods: Vec::new(),
                record: PlayerRecord::default(),
                signals: [false; 3],
            }),
            outbound: outbound_tx,
            closing: closing_tx,
        });
        let io = SessionIo {
            outbound: outbound_rx,
            closing: closing_rx,
        };
        (session, io)
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionData> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    // -- Accessors --------------------------------------------------------

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn state(&self) -> LifecycleState {
        self.read().state
    }

    pub fn wire_mode(&self) -> WireMode {
        self.read().wire_mode
    }

    /// `true` until the session reaches `Closed`.
    pub fn is_online(&self) -> bool {
        self.state() != LifecycleState::Closed
    }

    pub fn code(&self) -> Option<AuthCode> {
        self.read().code
    }

    /// Client version reported in `REQID`.
    pub fn client_version(&self) -> Option<ClientVersion> {
        self.read().client_version.clone()
    }

    /// Declared client mods, in declaration order, without duplicates.
    pub fn mods(&self) -> Vec<ModDescriptor> {
        self.read().mods.clone()
    }

    /// Snapshot of the player record.
    pub fn record(&self) -> PlayerRecord {
        self.read().record.clone()
    }

    /// Replaces the player record, e.g. with one loaded from persistence.
    pub fn replace_record(&self, record: PlayerRecord) {
        self.write().record = record;
    }

    // -- Outbound ---------------------------------------------------------

    /// Encodes `packet` for the current wire mode and queues it.
    ///
    /// Packets sent to a closed session are dropped silently.
    ///
    /// # Errors
    /// [`SessionError::Protocol`] if the packet can't be encoded.
    pub fn send(&self, packet: &Packet, options: SendOptions) -> Result<(), SessionError> {
        let (state, mode) = {
            let data = self.read();
            (data.state, data.wire_mode)
        };
        if state == LifecycleState::Closed {
            tracing::trace!(session = %self.id, packet = %packet.id, "dropping packet for closed session");
            return Ok(());
        }
        let frame = encode_frame(packet, mode, options)?;
        tracing::debug!(
            session = %self.id,
            packet = %packet.id,
            %mode,
            len = frame.len(),
            "queued packet"
        );
        // The receiver is gone only once the handler has finished; that is
        // the same "after close" case.
        let _ = self.outbound.send(Outbound::Frame(frame));
        Ok(())
    }

    /// Sends a positional packet with default framing.
    pub fn send_legacy<I, V>(&self, id: &str, fields: I) -> Result<(), SessionError>
    where
        I: IntoIterator<Item = V>,
        V: Into<LegacyValue>,
    {
        self.send(&Packet::legacy(id, fields), SendOptions::default())
    }

    /// Sends a structured document. Legacy sessions receive it inside an
    /// `XDAT` carrier.
    pub fn send_document(&self, id: &str, data: Value) -> Result<(), SessionError> {
        self.send(&Packet::document(id, data), SendOptions::default())
    }

    /// Sends a chat line, formatted `<sender> msg` when there is a sender.
    pub fn send_chat(&self, sender: Option<&str>, msg: &str) -> Result<(), SessionError> {
        let line = match sender {
            Some(sender) if !sender.is_empty() => format!("<{sender}> {msg}"),
            _ => msg.to_owned(),
        };
        self.send_legacy(ids::MSG, [line.trim()])
    }

    /// Sends `KICK` with `reason`, then asks for the transport to close.
    ///
    /// The close goes through the normal close path, so every close side
    /// effect (removed signal, save) still happens. Kicking a closed
    /// session does nothing.
    pub fn kick(&self, reason: &str) {
        if !self.is_online() {
            return;
        }
        tracing::info!(session = %self.id, addr = ?self.remote_addr, reason, "kicking client");
        let packet = Packet::legacy(ids::KICK, [reason]);
        if let Err(e) = self.send(&packet, SendOptions::legacy_compatible()) {
            tracing::warn!(session = %self.id, error = %e, "failed to encode kick");
        }
        self.close();
    }

    /// Asks the handler to close the transport after flushing queued
    /// frames. Idempotent.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
        self.closing.send_replace(true);
    }

    // -- Lifecycle --------------------------------------------------------

    /// Advertises the protocol version and starts waiting for `REQID`.
    pub fn open(&self) -> Result<(), SessionError> {
        self.send_legacy(ids::XNM, [PROTOCOL_VERSION])?;
        let mut data = self.write();
        if data.state == LifecycleState::Connected {
            data.state = LifecycleState::Authenticating;
        }
        Ok(())
    }

    /// `true` once a close or kick has been requested, even while the
    /// handler hasn't run the close yet.
    pub fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Moves the session to `Closed`. Returns `true` only for the call that
    /// performed the transition.
    pub fn mark_closed(&self) -> bool {
        let mut data = self.write();
        if data.state == LifecycleState::Closed {
            return false;
        }
        data.state = LifecycleState::Closed;
        true
    }

    /// Claims `signal` for publication. Returns `true` the first time only.
    pub fn claim_signal(&self, signal: LifecycleSignal) -> bool {
        let mut data = self.write();
        let fired = &mut data.signals[signal.index()];
        !std::mem::replace(fired, true)
    }

    // -- Inbound ----------------------------------------------------------

    /// Decodes an inbound frame and applies it.
    ///
    /// A frame that doesn't decode is a protocol error: the peer is kicked.
    /// Frames arriving after a close was requested are dropped.
    pub fn handle_frame(&self, frame: &Frame) -> Vec<SessionEvent> {
        if self.is_closing() {
            tracing::trace!(session = %self.id, "dropping frame for closing session");
            return Vec::new();
        }
        match decode_frame(frame) {
            Ok(packet) => self.handle_packet(packet),
            Err(e) => {
                tracing::debug!(session = %self.id, error = %e, "undecodable frame");
                self.kick_with(MALFORMED_PACKET_REASON)
            }
        }
    }

    /// Applies one decoded packet to the session state machine. Nothing is
    /// accepted once a close was requested.
    pub fn handle_packet(&self, packet: Packet) -> Vec<SessionEvent> {
        let state = self.state();
        tracing::trace!(session = %self.id, packet = %packet.id, %state, "received packet");
        if self.is_closing() {
            return Vec::new();
        }

        let id = packet.id.clone();
        match (id.as_str(), state) {
            (_, LifecycleState::Closed) => Vec::new(),
            (ids::XNM, _) => self.negotiate(&packet),
            (ids::POLL, _) => vec![SessionEvent::Poll],
            (ids::REQID, LifecycleState::Connected | LifecycleState::Authenticating) => {
                self.identify(&packet)
            }
            (ids::COMPANY, s) if s.is_identified() => self.update_company(&packet),
            (_, s) if s.is_identified() => vec![SessionEvent::Application(packet)],
            (id, state) => {
                tracing::debug!(session = %self.id, packet = id, %state, "ignoring packet in this state");
                Vec::new()
            }
        }
    }

    fn kick_with(&self, reason: &str) -> Vec<SessionEvent> {
        self.kick(reason);
        vec![SessionEvent::Kicked {
            reason: reason.to_owned(),
        }]
    }

    /// `XNM` from the peer: compare protocol versions and upgrade on match.
    fn negotiate(&self, packet: &Packet) -> Vec<SessionEvent> {
        let proto = packet
            .text(0)
            .and_then(|p| p.trim().parse::<f64>().ok())
            .filter(|p| p.is_finite());
        let notice = match proto {
            Some(p) if p < f64::from(PROTOCOL_VERSION) => format!(
                "Outdated GDTNM protocol version, server running on {PROTOCOL_VERSION}."
            ),
            Some(p) if p.trunc() > f64::from(PROTOCOL_VERSION) => format!(
                "Incompatible GDTNM protocol version, server still on {PROTOCOL_VERSION}."
            ),
            Some(_) => {
                let mut data = self.write();
                if data.wire_mode == WireMode::Upgraded {
                    return Vec::new();
                }
                data.wire_mode = WireMode::Upgraded;
                drop(data);
                tracing::info!(session = %self.id, "session upgraded to binary protocol");
                return vec![SessionEvent::Upgraded];
            }
            None => format!(
                "Incompatible GDTNM protocol version, server still on {PROTOCOL_VERSION}."
            ),
        };
        if let Err(e) = self.send_chat(None, &notice) {
            tracing::warn!(session = %self.id, error = %e, "failed to send protocol notice");
        }
        Vec::new()
    }

    /// `REQID`: validate version and code, record identity, confirm.
    fn identify(&self, packet: &Packet) -> Vec<SessionEvent> {
        let fields = packet.fields();
        if fields.len() < 3 {
            return self.kick_with(OUTDATED_CLIENT_REASON);
        }

        let version = fields[1]
            .as_text()
            .and_then(|v| v.parse::<ClientVersion>().ok());
        let version = match version {
            Some(v) if v >= self.config.min_client_version => v,
            _ => return self.kick_with(OUTDATED_CLIENT_REASON),
        };

        let Some(code) = fields[0]
            .as_text()
            .and_then(|c| c.trim().parse::<i64>().ok())
            .map(AuthCode)
        else {
            return self.kick_with(INVALID_CODE_REASON);
        };

        let declared = parse_mods(&fields[2]);
        {
            let mut data = self.write();
            data.code = Some(code);
            data.client_version = Some(version);
            for m in declared {
                if !data.mods.contains(&m) {
                    data.mods.push(m);
                }
            }
            data.state = LifecycleState::Identified;
        }
        tracing::info!(session = %self.id, %code, "client identified");

        if let Err(e) = self.send_legacy(ids::YOURID, [code.0.to_string(), self.id.0.to_string()]) {
            tracing::warn!(session = %self.id, error = %e, "failed to send YOURID");
        }
        vec![SessionEvent::Identified { code }]
    }

    /// `COMPANY`: replace the record, then move an identified session to
    /// `Joined` once if the update carries the join marker.
    ///
    /// Legacy peers send the 14 positional fields with an optional trailing
    /// `join` token. Upgraded peers may send the structured record document
    /// instead, with `"join": true` as the marker.
    fn update_company(&self, packet: &Packet) -> Vec<SessionEvent> {
        let mut data = self.write();
        let (applied, wants_join) = match &packet.data {
            PacketData::Document(Value::Object(document)) => {
                let wants_join = document.get(ids::JOIN_MARKER).and_then(Value::as_bool) == Some(true);
                let applied = data.record.apply_document(Value::Object(document.clone()));
                (applied, wants_join)
            }
            _ => {
                let fields = packet.fields();
                // Free text may contain nested separator characters; those
                // fields still mean their raw text.
                let tokens: Vec<String> = fields
                    .iter()
                    .take(POSITIONAL_FIELDS.len())
                    .map(|field| field.to_raw_text(1))
                    .collect();
                let wants_join = fields
                    .get(POSITIONAL_FIELDS.len())
                    .and_then(LegacyValue::as_text)
                    == Some(ids::JOIN_MARKER);
                (data.record.apply_positional(&tokens), wants_join)
            }
        };
        if let Err(e) = applied {
            drop(data);
            tracing::debug!(session = %self.id, error = %e, "bad company update");
            return self.kick_with(MALFORMED_COMPANY_REASON);
        }

        let mut events = vec![SessionEvent::RecordUpdated];
        if wants_join && data.state == LifecycleState::Identified {
            data.state = LifecycleState::Joined;
            events.push(SessionEvent::Joined);
        }
        drop(data);

        if events.contains(&SessionEvent::Joined) {
            tracing::info!(session = %self.id, "client joined");
        }
        events
    }
}

/// Reads the declared mod list from `REQID`.
///
/// Entries are `id`/`name` pairs. A single entry arrives as one leaf (the
/// entry separator never occurred), so leaves are split by hand.
fn parse_mods(value: &LegacyValue) -> Vec<ModDescriptor> {
    let entries: Vec<&LegacyValue> = match value {
        LegacyValue::List(items) => items.iter().collect(),
        LegacyValue::Text(_) => vec![value],
    };
    entries
        .into_iter()
        .filter_map(|entry| {
            let (id, name) = match entry {
                LegacyValue::List(parts) => (parts.first()?.as_text()?, parts.get(1)?.as_text()?),
                LegacyValue::Text(text) => text.split_once(SEPARATORS[2])?,
            };
            (!id.is_empty() && !name.is_empty()).then(|| ModDescriptor {
                id: id.to_owned(),
                name: name.to_owned(),
            })
        })
        .collect()
}

// =========================================================================
// Tests
// =========================================================================
