//! Integration tests for the Nepenthe server, handler, and full connection flow.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use nepenthe::prelude::*;
use nepenthe::protocol::binary::FLAG_COMPRESSED;
use nepenthe::protocol::{decode_frame, ClientVersion};
use nepenthe::transport::Frame;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_tungstenite::tungstenite::Message;

// =========================================================================
// Mock extensions and stores
// =========================================================================

type Log = Arc<Mutex<Vec<String>>>;

/// Records every lifecycle signal and application packet it sees.
struct Recorder {
    name: &'static str,
    log: Log,
}

impl Recorder {
    fn new(name: &'static str, log: &Log) -> Self {
        Self {
            name,
            log: Arc::clone(log),
        }
    }

    fn push(&self, event: String) {
        self.log.lock().unwrap().push(event);
    }
}

impl Extension for Recorder {
    fn id(&self) -> &str {
        self.name
    }

    fn on_session_added(&self, _ctx: &ServerContext, _session: &Arc<Session>) {
        self.push(format!("{}:added", self.name));
    }

    fn on_session_joined(&self, _ctx: &ServerContext, _session: &Arc<Session>) {
        self.push(format!("{}:joined", self.name));
    }

    fn on_session_removed(&self, ctx: &ServerContext, session: &Arc<Session>) {
        assert!(ctx.session(session.id()).is_none());
        self.push(format!("{}:removed", self.name));
    }

    fn on_packet(&self, _ctx: &ServerContext, session: &Arc<Session>, packet: &Packet) {
        self.push(format!("{}:packet:{}", self.name, packet.id));
        if packet.is(ids::MSG) {
            let text = packet.text(0).unwrap_or_default();
            session.send_chat(Some("echo"), &text).unwrap();
        }
    }
}

/// A store whose saves always fail.
#[derive(Default)]
struct BrokenStore;

impl PlayerStore for BrokenStore {
    async fn load(&self, _code: AuthCode) -> Result<Option<PlayerRecord>, PersistenceError> {
        Err(PersistenceError::Backend("offline".into()))
    }

    async fn save(&self, _code: AuthCode, _record: &PlayerRecord) -> Result<(), PersistenceError> {
        Err(PersistenceError::Backend("offline".into()))
    }
}

// =========================================================================
// Helpers
// =========================================================================

type ClientWs = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

const TIMEOUT: Duration = Duration::from_secs(2);

fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.origin.host = "127.0.0.1".into();
    config.origin.port = 0;
    config.origin.keepalive = false;
    config.gameplay.motd = "Test MOTD".into();
    config
}

/// Starts a server with an in-memory store on a random port.
async fn start_server(config: ServerConfig) -> (NepentheServer, String) {
    let server = NepentheServer::builder().config(config).build();
    let addr = server.start().await.expect("server should start").to_string();
    (server, addr)
}

async fn connect(addr: &str) -> ClientWs {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .expect("should connect");
    ws
}

async fn send_text(ws: &mut ClientWs, parts: &[&str]) {
    ws.send(Message::Text(parts.join("\u{FA}").into()))
        .await
        .expect("send");
}

/// Next data frame from the server, skipping pings.
async fn recv_frame(ws: &mut ClientWs) -> Frame {
    loop {
        let msg = tokio::time::timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("ws error");
        match msg {
            Message::Text(text) => return Frame::Text(text.as_str().to_owned()),
            Message::Binary(bytes) => return Frame::Binary(bytes.to_vec()),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected a data frame, got {other:?}"),
        }
    }
}

async fn recv_packet(ws: &mut ClientWs) -> Packet {
    let frame = recv_frame(ws).await;
    decode_frame(&frame).expect("server frames decode")
}

/// Waits until the server closes the connection.
async fn expect_closed(ws: &mut ClientWs) {
    loop {
        match tokio::time::timeout(TIMEOUT, ws.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => return,
            Ok(Some(Ok(_))) => continue,
            Err(_) => panic!("connection was not closed"),
        }
    }
}

/// Polls `condition` until it holds or the timeout expires.
async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

/// Connects, consumes the XNM advertisement, and identifies with `code`.
/// Returns after YOURID and SETTINGS arrived.
async fn identify(addr: &str, code: &str) -> ClientWs {
    let mut ws = connect(addr).await;
    let xnm = recv_packet(&mut ws).await;
    assert_eq!(xnm.id, "XNM");

    send_text(&mut ws, &["REQID", code, "1.5.5.0", "", "0"]).await;
    let yourid = recv_packet(&mut ws).await;
    assert_eq!(yourid.id, "YOURID");
    let settings = recv_packet(&mut ws).await;
    assert_eq!(settings.id, "SETTINGS");
    ws
}

fn company_fields(name: &str, cash: i64) -> Vec<String> {
    let record = PlayerRecord {
        name: name.into(),
        cash,
        ..PlayerRecord::default()
    };
    let mut fields = vec!["COMPANY".to_string()];
    fields.extend(record.to_positional());
    fields
}

async fn send_company(ws: &mut ClientWs, name: &str, cash: i64, join: bool) {
    let mut fields = company_fields(name, cash);
    if join {
        fields.push("join".into());
    }
    let parts: Vec<&str> = fields.iter().map(String::as_str).collect();
    send_text(ws, &parts).await;
}

/// Round-trips a POLL so every earlier packet has been fully handled.
async fn sync(ws: &mut ClientWs) -> Packet {
    send_text(ws, &["POLL"]).await;
    loop {
        let packet = recv_packet(ws).await;
        if packet.is(ids::POLLRES) {
            return packet;
        }
    }
}

// =========================================================================
// Handshake
// =========================================================================

#[tokio::test]
async fn test_connect_receives_legacy_xnm_advertisement() {
    let (_server, addr) = start_server(test_config()).await;
    let mut ws = connect(&addr).await;

    let frame = recv_frame(&mut ws).await;

    assert_eq!(frame, Frame::Text("XNM\u{FA}1\u{FA}133333337".into()));
}

#[tokio::test]
async fn test_reqid_responds_yourid_then_loads_record() {
    let (server, addr) = start_server(test_config()).await;
    let stored = PlayerRecord {
        name: "Pixel Forge".into(),
        cash: 123_456,
        ..PlayerRecord::default()
    };
    server.store().save(AuthCode(42), &stored).await.unwrap();

    let mut ws = connect(&addr).await;
    recv_packet(&mut ws).await;
    send_text(&mut ws, &["REQID", "42", "1.5.5.0", "m1\u{FB}Mod One", "0"]).await;

    let yourid = recv_packet(&mut ws).await;
    assert_eq!(yourid.id, "YOURID");
    assert_eq!(yourid.text(0).as_deref(), Some("42"));
    let session_id: u64 = yourid.text(1).unwrap().parse().unwrap();

    let settings = recv_packet(&mut ws).await;
    assert_eq!(settings.id, "SETTINGS");
    assert_eq!(settings.text(0).as_deref(), Some("1.5.5.0"));

    sync(&mut ws).await;
    let session = server.session(SessionId(session_id)).expect("session is live");
    assert_eq!(session.state(), LifecycleState::Identified);
    assert_eq!(session.record(), stored);
    assert_eq!(session.mods()[0].name, "Mod One");
}

#[tokio::test]
async fn test_reqid_with_two_fields_kicks_for_version() {
    let (server, addr) = start_server(test_config()).await;
    let mut ws = connect(&addr).await;
    recv_packet(&mut ws).await;
    wait_for(|| server.sessions().len() == 1).await;

    send_text(&mut ws, &["REQID", "42", "1.5.5.0"]).await;

    let kick = recv_packet(&mut ws).await;
    assert_eq!(kick.id, "KICK");
    assert!(kick.text(0).unwrap().contains("old version"));
    expect_closed(&mut ws).await;
    wait_for(|| server.sessions().is_empty()).await;
}

#[tokio::test]
async fn test_reqid_with_non_numeric_code_kicks() {
    let (server, addr) = start_server(test_config()).await;
    let mut ws = connect(&addr).await;
    recv_packet(&mut ws).await;

    send_text(&mut ws, &["REQID", "abc", "1.5.5.0", "", "0"]).await;

    let kick = recv_packet(&mut ws).await;
    assert_eq!(kick.id, "KICK");
    assert_eq!(kick.text(0).as_deref(), Some("Your client code is invalid."));
    expect_closed(&mut ws).await;
    wait_for(|| server.sessions().is_empty()).await;
}

#[tokio::test]
async fn test_malformed_frame_kicks() {
    let (_server, addr) = start_server(test_config()).await;
    let mut ws = connect(&addr).await;
    recv_packet(&mut ws).await;

    ws.send(Message::Binary(b"\x00not json".to_vec().into()))
        .await
        .unwrap();

    let kick = recv_packet(&mut ws).await;
    assert_eq!(kick.text(0).as_deref(), Some("Malformed packet."));
    expect_closed(&mut ws).await;
}

// =========================================================================
// Negotiation
// =========================================================================

#[tokio::test]
async fn test_session_without_xnm_stays_legacy() {
    let mut config = test_config();
    config.origin.keepalive = true;
    let (_server, addr) = start_server(config).await;
    let mut ws = identify(&addr, "7").await;

    send_company(&mut ws, "Legacy Co", 10, true).await;
    send_text(&mut ws, &["POLL"]).await;

    let saved = recv_frame(&mut ws).await;
    let pollres = recv_frame(&mut ws).await;
    assert!(!saved.is_binary());
    assert!(!pollres.is_binary());
    assert_eq!(decode_frame(&saved).unwrap().id, "SAVEDATA");
    assert_eq!(decode_frame(&pollres).unwrap().id, "POLLRES");
}

#[tokio::test]
async fn test_xnm_ack_switches_to_binary_framing() {
    let (server, addr) = start_server(test_config()).await;
    let mut ws = identify(&addr, "7").await;

    send_text(&mut ws, &["XNM", "1", "0"]).await;
    send_text(&mut ws, &["POLL"]).await;

    let frame = recv_frame(&mut ws).await;
    let Frame::Binary(bytes) = &frame else {
        panic!("expected a binary frame, got {frame:?}");
    };
    assert_eq!(bytes[0], FLAG_COMPRESSED);
    let pollres = decode_frame(&frame).unwrap();
    assert_eq!(pollres.id, "POLLRES");
    assert_eq!(server.sessions()[0].wire_mode(), WireMode::Upgraded);
}

#[tokio::test]
async fn test_outdated_xnm_gets_notice_and_stays_legacy() {
    let (_server, addr) = start_server(test_config()).await;
    let mut ws = identify(&addr, "7").await;

    send_text(&mut ws, &["XNM", "0", "0"]).await;

    let frame = recv_frame(&mut ws).await;
    assert!(!frame.is_binary());
    let notice = decode_frame(&frame).unwrap();
    assert_eq!(notice.id, "MSG");
    assert!(notice.text(0).unwrap().starts_with("Outdated GDTNM protocol version"));
}

// =========================================================================
// Lifecycle signals
// =========================================================================

#[tokio::test]
async fn test_lifecycle_signals_fire_exactly_once_in_order() {
    let (server, addr) = start_server(test_config()).await;
    let log = Log::default();
    server.register(Recorder::new("rec", &log)).unwrap();

    let mut ws = identify(&addr, "9").await;
    send_company(&mut ws, "Twice Inc", 1, true).await;
    send_company(&mut ws, "Twice Inc", 2, true).await;
    sync(&mut ws).await;
    ws.close(None).await.unwrap();

    wait_for(|| log.lock().unwrap().len() == 3).await;
    assert_eq!(*log.lock().unwrap(), vec!["rec:added", "rec:joined", "rec:removed"]);
}

#[tokio::test]
async fn test_company_without_join_marker_does_not_join() {
    let (server, addr) = start_server(test_config()).await;
    let log = Log::default();
    server.register(Recorder::new("rec", &log)).unwrap();

    let mut ws = identify(&addr, "9").await;
    send_company(&mut ws, "Quiet Co", 1, false).await;
    sync(&mut ws).await;

    assert_eq!(*log.lock().unwrap(), vec!["rec:added"]);
    assert_eq!(server.sessions()[0].state(), LifecycleState::Identified);
    assert_eq!(server.sessions()[0].record().name, "Quiet Co");

    send_company(&mut ws, "Quiet Co", 1, true).await;
    sync(&mut ws).await;
    assert_eq!(*log.lock().unwrap(), vec!["rec:added", "rec:joined"]);
}

#[tokio::test]
async fn test_reregistration_leaves_no_duplicate_callbacks() {
    let (server, addr) = start_server(test_config()).await;
    let log = Log::default();
    server.register(Recorder::new("old", &log)).unwrap();
    server.register(Recorder::new("new", &log)).unwrap();
    assert_eq!(server.extension_ids(), vec!["new"]);

    let mut ws = connect(&addr).await;
    recv_packet(&mut ws).await;

    assert_eq!(*log.lock().unwrap(), vec!["new:added"]);
}

#[tokio::test]
async fn test_unregister_unknown_extension_is_an_error() {
    let (server, _addr) = start_server(test_config()).await;
    let log = Log::default();
    server.register(Recorder::new("rec", &log)).unwrap();

    struct NeverRegistered;
    impl Extension for NeverRegistered {
        fn id(&self) -> &str {
            "never"
        }
    }

    let result = server.unregister::<NeverRegistered>();

    assert!(matches!(
        result,
        Err(NepentheError::Extension(ExtensionError::NotRegistered(_)))
    ));
    assert_eq!(server.extension_count(), 1);
}

#[tokio::test]
async fn test_application_packets_reach_extensions_after_identification() {
    let (server, addr) = start_server(test_config()).await;
    let log = Log::default();
    server.register(Recorder::new("rec", &log)).unwrap();

    let mut ws = connect(&addr).await;
    recv_packet(&mut ws).await;
    send_text(&mut ws, &["MSG", "too early", "0"]).await;
    send_text(&mut ws, &["REQID", "5", "1.5.5.0", "", "0"]).await;
    recv_packet(&mut ws).await;
    recv_packet(&mut ws).await;

    send_text(&mut ws, &["MSG", "hello", "0"]).await;
    let echo = recv_packet(&mut ws).await;

    assert_eq!(echo.text(0).as_deref(), Some("<echo> hello"));
    assert_eq!(*log.lock().unwrap(), vec!["rec:added", "rec:packet:MSG"]);
}

// =========================================================================
// Persistence
// =========================================================================

#[tokio::test]
async fn test_server_side_save_on_company_update() {
    let (server, addr) = start_server(test_config()).await;
    let mut ws = identify(&addr, "77").await;

    send_company(&mut ws, "Saved Corp", 9_000, false).await;

    let saved = recv_packet(&mut ws).await;
    assert_eq!(saved.id, "SAVEDATA");
    let stored = server.store().load(AuthCode(77)).await.unwrap().unwrap();
    assert_eq!(stored.name, "Saved Corp");
    assert_eq!(stored.cash, 9_000);
}

#[tokio::test]
async fn test_company_name_with_umlaut_is_saved_verbatim() {
    let (server, addr) = start_server(test_config()).await;
    let mut ws = identify(&addr, "78").await;

    send_company(&mut ws, "M\u{FC}ller Games", 100, true).await;

    let saved = recv_packet(&mut ws).await;
    assert_eq!(saved.id, "SAVEDATA");
    let stored = server.store().load(AuthCode(78)).await.unwrap().unwrap();
    assert_eq!(stored.name, "M\u{FC}ller Games");
    assert_eq!(server.sessions()[0].state(), LifecycleState::Joined);
}

#[tokio::test]
async fn test_failed_save_notifies_peer_and_keeps_session() {
    let server = NepentheServer::builder()
        .config(test_config())
        .store(Arc::new(BrokenStore))
        .build();
    let addr = server.start().await.unwrap().to_string();
    let mut ws = connect(&addr).await;
    recv_packet(&mut ws).await;
    send_text(&mut ws, &["REQID", "3", "1.5.5.0", "", "0"]).await;
    recv_packet(&mut ws).await; // YOURID
    recv_packet(&mut ws).await; // SETTINGS

    let notice = recv_packet(&mut ws).await;
    assert_eq!(notice.id, "MSG");
    assert!(notice.text(0).unwrap().contains("Failed to load"));

    send_company(&mut ws, "Doomed", 1, false).await;
    let failed = recv_packet(&mut ws).await;
    assert_eq!(failed.id, "SAVEFAIL");

    sync(&mut ws).await;
    assert_eq!(server.sessions().len(), 1);
}

#[tokio::test]
async fn test_close_saves_and_reconnect_sees_latest_record() {
    let mut config = test_config();
    config.gameplay.serversidesave = false;
    let (server, addr) = start_server(config).await;

    let mut ws = identify(&addr, "1001").await;
    send_company(&mut ws, "Comeback Ltd", 31_337, true).await;
    sync(&mut ws).await;
    assert!(server.store().load(AuthCode(1001)).await.unwrap().is_none());
    ws.close(None).await.unwrap();
    wait_for(|| server.sessions().is_empty()).await;

    let mut ws = identify(&addr, "1001").await;
    sync(&mut ws).await;

    let sessions = server.sessions();
    let session = &sessions[0];
    assert_eq!(session.record().name, "Comeback Ltd");
    assert_eq!(session.record().cash, 31_337);
}

#[tokio::test]
async fn test_explicit_save_session() {
    let mut config = test_config();
    config.gameplay.serversidesave = false;
    let (server, addr) = start_server(config).await;

    let mut ws = identify(&addr, "55").await;
    send_company(&mut ws, "Manual Save", 5, false).await;
    sync(&mut ws).await;

    let id = server.sessions()[0].id();
    assert!(server.save_session(id).await.unwrap());
    let saved = recv_packet(&mut ws).await;
    assert_eq!(saved.id, "SAVEDATA");
    assert!(matches!(
        server.save_session(SessionId(1)).await,
        Err(NepentheError::Session(SessionError::NotFound(_)))
    ));
}

// =========================================================================
// Poll and status
// =========================================================================

#[tokio::test]
async fn test_poll_reports_session_count_and_rules() {
    let (_server, addr) = start_server(test_config()).await;
    let _other = identify(&addr, "1").await;
    let mut ws = connect(&addr).await;
    recv_packet(&mut ws).await;

    // POLL works before identification.
    let pollres = sync(&mut ws).await;

    assert_eq!(pollres.text(0).as_deref(), Some("2"));
    assert_eq!(pollres.text(5).as_deref(), Some("true")); // serversidesave
    assert_eq!(pollres.text(7).as_deref(), Some("1.5.5.0"));
}

#[tokio::test]
async fn test_poll_advertises_configured_min_version() {
    let server = NepentheServer::builder()
        .config(test_config())
        .session_config(SessionConfig {
            min_client_version: "1.6.1".parse::<ClientVersion>().unwrap(),
        })
        .build();
    let addr = server.start().await.unwrap().to_string();
    let mut ws = connect(&addr).await;
    recv_packet(&mut ws).await;

    let pollres = sync(&mut ws).await;
    assert_eq!(pollres.text(7).as_deref(), Some("1.6.1"));
}

#[tokio::test]
async fn test_silent_tcp_peer_does_not_block_new_sessions() {
    let (_server, addr) = start_server(test_config()).await;
    let _silent = tokio::net::TcpStream::connect(&addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut ws = tokio::time::timeout(Duration::from_secs(1), connect(&addr))
        .await
        .expect("handshake must not wait behind the silent peer");
    assert_eq!(recv_packet(&mut ws).await.id, "XNM");
}

#[tokio::test]
async fn test_plain_http_gets_status_document() {
    let (_server, addr) = start_server(test_config()).await;
    let mut stream = tokio::net::TcpStream::connect(&addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    tokio::time::timeout(TIMEOUT, stream.read_to_string(&mut response))
        .await
        .expect("status response timed out")
        .unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let status: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(status["status"], "running");
    assert_eq!(status["motd"], "Test MOTD");
    assert!(status["agent"].as_str().unwrap().starts_with("GDTMP/"));
}

// =========================================================================
// Start / stop
// =========================================================================

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let (server, addr) = start_server(test_config()).await;
    let again = server.start().await.unwrap().to_string();
    assert_eq!(again, addr);

    let mut ws = identify(&addr, "8").await;
    server.stop().await;
    server.stop().await;

    expect_closed(&mut ws).await;
    assert!(!server.is_running().await);
    assert!(server.sessions().is_empty());
    assert!(tokio_tungstenite::connect_async(format!("ws://{addr}")).await.is_err());
}

#[tokio::test]
async fn test_stop_without_start_is_a_no_op() {
    let server = NepentheServer::builder().config(test_config()).build();
    server.stop().await;
    assert!(server.local_addr().await.is_none());
}

#[tokio::test]
async fn test_bind_conflict_is_a_start_error() {
    let (_server, addr) = start_server(test_config()).await;
    let port: u16 = addr.rsplit(':').next().unwrap().parse().unwrap();

    let second = NepentheServer::builder()
        .config(test_config())
        .bind("127.0.0.1", port)
        .build();
    let result = second.start().await;

    assert!(matches!(result, Err(NepentheError::Start(_))));
    assert!(!second.is_running().await);
}
