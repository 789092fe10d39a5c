//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! The listening socket is shared with a tiny status responder: a request
//! that does not ask for a WebSocket upgrade gets a one-shot HTTP JSON
//! response and is closed, everything else goes through the regular
//! WebSocket handshake.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;

use crate::{Connection, ConnectionId, Frame, Transport, TransportError};

/// Counter for generating unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// How much of the request head we inspect to detect an upgrade.
const PEEK_LIMIT: usize = 4096;

/// How long a peer may take to finish the opening handshake, from the
/// TCP accept to a completed WebSocket upgrade (or status response).
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

/// A WebSocket-based [`Transport`] that listens for incoming connections.
///
/// Each TCP peer is handshaken on its own task, so a slow or silent peer
/// never holds up the others. Finished connections are queued until
/// [`accept`](Transport::accept) picks them up.
pub struct WebSocketTransport {
    listener: TcpListener,
    status: Option<Arc<str>>,
    ready_tx: mpsc::UnboundedSender<WebSocketConnection>,
    ready_rx: mpsc::UnboundedReceiver<WebSocketConnection>,
}

impl WebSocketTransport {
    /// Binds a new WebSocket transport to the given address.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| {
            TransportError::BindFailed {
                addr: addr.to_string(),
                source,
            }
        })?;
        tracing::info!(addr, "WebSocket transport listening");
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        Ok(Self {
            listener,
            status: None,
            ready_tx,
            ready_rx,
        })
    }

    /// Serves `body` (a JSON document) to every plain HTTP request that
    /// arrives on the listening port.
    pub fn with_status(mut self, body: impl Into<String>) -> Self {
        self.status = Some(Arc::from(body.into()));
        self
    }
}

impl Transport for WebSocketTransport {
    type Connection = WebSocketConnection;
    type Error = TransportError;

    async fn accept(&mut self) -> Result<Self::Connection, Self::Error> {
        loop {
            tokio::select! {
                // The transport holds a sender, so the queue never closes.
                Some(conn) = self.ready_rx.recv() => return Ok(conn),
                accepted = self.listener.accept() => {
                    let (stream, addr) = accepted.map_err(TransportError::AcceptFailed)?;
                    let status = self.status.clone();
                    let ready = self.ready_tx.clone();
                    tokio::spawn(async move {
                        match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(stream, addr, status))
                            .await
                        {
                            Ok(Ok(Some(conn))) => {
                                // A closed queue means the transport is gone.
                                let _ = ready.send(conn);
                            }
                            Ok(Ok(None)) => {}
                            Ok(Err(e)) => {
                                tracing::debug!(%addr, error = %e, "handshake failed");
                            }
                            Err(_) => tracing::debug!(%addr, "handshake timed out"),
                        }
                    });
                }
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// Takes one accepted socket through the opening handshake.
///
/// Returns `None` when the peer was served the status document instead of
/// being upgraded.
async fn handshake(
    stream: TcpStream,
    addr: SocketAddr,
    status: Option<Arc<str>>,
) -> Result<Option<WebSocketConnection>, TransportError> {
    if let Some(body) = status {
        if !wants_upgrade(&stream)
            .await
            .map_err(TransportError::AcceptFailed)?
        {
            respond_status(stream, &body)
                .await
                .map_err(TransportError::SendFailed)?;
            return Ok(None);
        }
    }

    let ws = tokio_tungstenite::accept_async(stream).await.map_err(|e| {
        TransportError::AcceptFailed(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, e))
    })?;

    let id = ConnectionId::new(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed));
    tracing::debug!(%id, %addr, "accepted WebSocket connection");

    let (sink, stream) = ws.split();
    Ok(Some(WebSocketConnection {
        id,
        remote_addr: addr,
        sink: Mutex::new(sink),
        stream: Mutex::new(stream),
    }))
}

/// Peeks at the request head and reports whether it asks for a WebSocket
/// upgrade. Nothing is consumed from the socket.
async fn wants_upgrade(stream: &TcpStream) -> std::io::Result<bool> {
    let mut buf = vec![0u8; PEEK_LIMIT];
    let mut len = 0;
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        if n == len {
            // Nothing new arrived yet; peek returns immediately while data
            // is buffered, so back off briefly instead of spinning.
            tokio::time::sleep(Duration::from_millis(5)).await;
            continue;
        }
        len = n;
        if len == buf.len() || buf[..len].windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }

    let head = String::from_utf8_lossy(&buf[..len]).to_ascii_lowercase();
    Ok(head.lines().any(|line| {
        line.trim_start().starts_with("upgrade:") && line.contains("websocket")
    }))
}

/// Writes the status document as an HTTP/1.1 response and closes the socket.
async fn respond_status(mut stream: TcpStream, body: &str) -> std::io::Result<()> {
    // Drain the request head first so closing doesn't reset the connection.
    let mut head = vec![0u8; PEEK_LIMIT];
    let _ = stream.read(&mut head).await?;

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

/// A single WebSocket connection.
///
/// The socket is split so that a task blocked in [`recv`](Connection::recv)
/// never holds up a concurrent [`send`](Connection::send).
pub struct WebSocketConnection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
}

fn broken_pipe(e: tokio_tungstenite::tungstenite::Error) -> TransportError {
    TransportError::SendFailed(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e))
}

impl Connection for WebSocketConnection {
    type Error = TransportError;

    async fn send(&self, frame: Frame) -> Result<(), Self::Error> {
        let msg = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data.into()),
        };
        self.sink.lock().await.send(msg).await.map_err(broken_pipe)
    }

    async fn recv(&self) -> Result<Option<Frame>, Self::Error> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(Frame::Binary(data.into())));
                }
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(Frame::Text(text.as_str().to_owned())));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue, // skip ping/pong/frame
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        e,
                    )));
                }
            }
        }
    }

    async fn ping(&self) -> Result<(), Self::Error> {
        self.sink
            .lock()
            .await
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(broken_pipe)
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.sink.lock().await.close().await.map_err(broken_pipe)
    }

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote_addr)
    }
}
