//! End-to-end tests: a live event loop on `127.0.0.1:0` driven by real
//! clients.
//!
//! The loop runs on a plain thread.  The async tests talk to it through
//! `ws-client`; the byte-level tests use a blocking `std::net::TcpStream` so
//! they can send frames no conforming client would.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ws_client::{ClientConfig, ClientError, ClientMessage, WebSocketClient};
use ws_core::protocol::frame::{decode_frame, encode_frame, Frame, Opcode};
use ws_core::protocol::handshake::{ClientHandshake, HandshakeError};
use ws_core::protocol::message::Message;
use ws_core::protocol::{CloseCode, CloseFrame};
use ws_server::application::{MessageRouter, Recipients, ServerHooks};
use ws_server::domain::{ConnectionId, ServerConfig, Session};
use ws_server::{EventLoop, ServerError, ShutdownHandle};

const WAIT: Duration = Duration::from_secs(5);

// ── Test application ──────────────────────────────────────────────────────────

/// Text commands understood by the test server:
///
/// - `all:<body>` broadcasts `<body>` to every open session.
/// - `except:<ids>:<body>` broadcasts to everyone but `<ids>`.
/// - `only:<ids>:<body>` broadcasts to `<ids>` only.
/// - anything else is echoed back.
///
/// `<ids>` is a comma-separated list of connection ids.
#[derive(Debug, Default, Clone)]
struct CommandHooks {
    closed: Arc<Mutex<Vec<ConnectionId>>>,
}

fn parse_ids(list: &str) -> Vec<ConnectionId> {
    list.split(',')
        .filter_map(|raw| raw.trim().parse().ok())
        .map(ConnectionId::new)
        .collect()
}

impl ServerHooks for CommandHooks {
    fn on_message(&mut self, router: &mut MessageRouter<'_>, id: ConnectionId, message: &Message) {
        let text = message.as_text().unwrap_or_default();
        if let Some(body) = text.strip_prefix("all:") {
            router.broadcast(body.as_bytes(), &Recipients::All, Some(id));
        } else if let Some((ids, body)) = text.strip_prefix("except:").and_then(|r| r.split_once(':')) {
            router.broadcast(body.as_bytes(), &Recipients::except(parse_ids(ids)), Some(id));
        } else if let Some((ids, body)) = text.strip_prefix("only:").and_then(|r| r.split_once(':')) {
            router.broadcast(body.as_bytes(), &Recipients::only(parse_ids(ids)), Some(id));
        } else {
            let _ = router.send_to(id, message.payload());
        }
    }

    fn on_close(&mut self, _router: &mut MessageRouter<'_>, session: &Session) {
        self.closed.lock().unwrap().push(session.id());
    }
}

// ── Server harness ────────────────────────────────────────────────────────────

struct TestServer {
    addr: SocketAddr,
    handle: ShutdownHandle,
    closed: Arc<Mutex<Vec<ConnectionId>>>,
    thread: Option<JoinHandle<Result<(), ServerError>>>,
}

impl TestServer {
    fn start() -> Self {
        Self::start_with(|_| {})
    }

    fn start_with(tweak: impl FnOnce(&mut ServerConfig)) -> Self {
        let mut config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            tick_interval: Duration::from_millis(10),
            ..ServerConfig::default()
        };
        tweak(&mut config);

        let hooks = CommandHooks::default();
        let closed = Arc::clone(&hooks.closed);
        let mut event_loop = EventLoop::bind(config, hooks).unwrap();
        let addr = event_loop.local_addr().unwrap();
        let handle = event_loop.shutdown_handle();
        let thread = std::thread::spawn(move || event_loop.run());

        Self {
            addr,
            handle,
            closed,
            thread: Some(thread),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    async fn client(&self, path: &str) -> WebSocketClient {
        let mut client = WebSocketClient::new(&self.url(path), ClientConfig::default()).unwrap();
        client.connect().await.unwrap();
        client
    }

    /// Connects `n` clients one after another, so client `i` gets id `i + 1`.
    async fn clients(&self, n: usize) -> Vec<WebSocketClient> {
        let mut clients = Vec::with_capacity(n);
        for _ in 0..n {
            clients.push(self.client("/").await);
        }
        clients
    }

    fn wait_closed(&self, id: ConnectionId) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if self.closed.lock().unwrap().contains(&id) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

async fn next_text(client: &mut WebSocketClient) -> String {
    match tokio::time::timeout(WAIT, client.receive()).await {
        Ok(Ok(ClientMessage::Text(text))) => text,
        other => panic!("expected a text message, got {other:?}"),
    }
}

// ── Raw socket helpers ────────────────────────────────────────────────────────

/// Performs the handshake on a blocking socket and returns it with any bytes
/// that followed the response.
fn raw_upgrade(addr: SocketAddr) -> (TcpStream, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    let handshake = ClientHandshake::new(&addr.to_string(), "/");
    stream.write_all(&handshake.request_bytes()).unwrap();

    let mut buffer = Vec::new();
    loop {
        read_more(&mut stream, &mut buffer);
        match handshake.verify(&buffer) {
            Ok((_, consumed)) => {
                buffer.drain(..consumed);
                return (stream, buffer);
            }
            Err(HandshakeError::Incomplete) => continue,
            Err(e) => panic!("handshake failed: {e}"),
        }
    }
}

fn read_more(stream: &mut TcpStream, buffer: &mut Vec<u8>) {
    let mut chunk = [0u8; 1024];
    let n = stream.read(&mut chunk).unwrap();
    assert!(n > 0, "server closed the stream");
    buffer.extend_from_slice(&chunk[..n]);
}

fn read_frame(stream: &mut TcpStream, buffer: &mut Vec<u8>) -> Frame {
    loop {
        match decode_frame(buffer) {
            Ok((frame, consumed)) => {
                buffer.drain(..consumed);
                return frame;
            }
            Err(e) if e.is_need_more_data() => read_more(stream, buffer),
            Err(e) => panic!("bad frame from server: {e}"),
        }
    }
}

fn assert_close_code(frame: &Frame, code: CloseCode) {
    assert_eq!(frame.opcode(), Opcode::Close);
    assert_eq!(frame.payload()[..2], code.as_u16().to_be_bytes());
}

// ── Messaging ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_echo_round_trip() {
    // Arrange
    let server = TestServer::start();
    let mut client = server.client("/echo").await;

    // Act
    client.send_text("hello").await.unwrap();

    // Assert
    assert_eq!(next_text(&mut client).await, "hello");
}

#[tokio::test]
async fn test_binary_echo_round_trip() {
    let server = TestServer::start();
    let mut client = server.client("/").await;

    client.send_binary(&[0, 159, 146, 150]).await.unwrap();

    match tokio::time::timeout(WAIT, client.receive()).await {
        Ok(Ok(ClientMessage::Binary(data))) => assert_eq!(data, [0, 159, 146, 150]),
        other => panic!("expected binary echo, got {other:?}"),
    }
}

#[tokio::test]
async fn test_large_message_crosses_read_chunks() {
    // Arrange: the server reads 1024 bytes at a time
    let server = TestServer::start();
    let mut client = server.client("/").await;
    let big = "x".repeat(70_000);

    // Act
    client.send_text(&big).await.unwrap();

    // Assert
    assert_eq!(next_text(&mut client).await, big);
}

#[tokio::test]
async fn test_broadcast_reaches_every_open_session() {
    // Arrange
    let server = TestServer::start();
    let mut clients = server.clients(10).await;

    // Act
    clients[0].send_text("all:hi").await.unwrap();

    // Assert: the sender is included
    for client in &mut clients {
        assert_eq!(next_text(client).await, "hi");
    }
}

#[tokio::test]
async fn test_broadcast_skips_excluded_session() {
    // Arrange
    let server = TestServer::start();
    let mut clients = server.clients(10).await;

    // Act
    clients[0].send_text("except:3:skip").await.unwrap();
    clients[0].send_text("all:marker").await.unwrap();

    // Assert: connection #3 sees only the marker
    for (i, client) in clients.iter_mut().enumerate() {
        if i + 1 != 3 {
            assert_eq!(next_text(client).await, "skip", "client #{}", i + 1);
        }
        assert_eq!(next_text(client).await, "marker", "client #{}", i + 1);
    }
}

#[tokio::test]
async fn test_broadcast_to_explicit_receivers() {
    // Arrange
    let server = TestServer::start();
    let mut clients = server.clients(10).await;

    // Act: 42 does not exist and is ignored
    clients[0].send_text("only:5,9,42:direct").await.unwrap();
    clients[0].send_text("all:marker").await.unwrap();

    // Assert
    for (i, client) in clients.iter_mut().enumerate() {
        let id = i + 1;
        if id == 5 || id == 9 {
            assert_eq!(next_text(client).await, "direct", "client #{id}");
        }
        assert_eq!(next_text(client).await, "marker", "client #{id}");
    }
}

#[tokio::test]
async fn test_ping_is_answered_with_pong() {
    let server = TestServer::start();
    let mut client = server.client("/").await;

    client.ping(b"beat").await.unwrap();

    match tokio::time::timeout(WAIT, client.receive()).await {
        Ok(Ok(ClientMessage::Pong(payload))) => assert_eq!(payload, b"beat"),
        other => panic!("expected pong, got {other:?}"),
    }
}

// ── Closing ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_client_close_releases_session() {
    // Arrange
    let server = TestServer::start();
    let mut client = server.client("/").await;

    // Act
    client.close(CloseCode::Normal).await.unwrap();

    // Assert
    assert!(!client.is_open());
    assert!(server.wait_closed(ConnectionId::new(1)));
}

#[test]
fn test_close_frame_is_echoed_with_same_code() {
    // Arrange
    let server = TestServer::start();
    let (mut stream, mut buffer) = raw_upgrade(server.addr);
    let close = Frame::close(CloseCode::GoingAway, "leaving").with_mask([1, 2, 3, 4]);

    // Act
    stream.write_all(&close.encode()).unwrap();
    let reply = read_frame(&mut stream, &mut buffer);

    // Assert
    assert_close_code(&reply, CloseCode::GoingAway);
    assert!(!reply.is_masked());
    assert!(server.wait_closed(ConnectionId::new(1)));
}

#[test]
fn test_unmasked_client_frame_is_protocol_error() {
    // Arrange
    let server = TestServer::start();
    let (mut stream, mut buffer) = raw_upgrade(server.addr);

    // Act
    stream.write_all(&encode_frame(b"plain text", Opcode::Text, false)).unwrap();
    let reply = read_frame(&mut stream, &mut buffer);

    // Assert
    assert_close_code(&reply, CloseCode::ProtocolError);
}

#[test]
fn test_short_read_on_open_session_drops_connection() {
    // Arrange
    let server = TestServer::start();
    let (mut stream, _) = raw_upgrade(server.addr);

    // Act: fewer bytes than the smallest masked frame
    stream.write_all(&[0x81, 0x80]).unwrap();

    // Assert: dropped without a close frame
    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest);
    assert!(rest.is_empty());
    assert!(server.wait_closed(ConnectionId::new(1)));
}

#[tokio::test]
async fn test_shutdown_sends_going_away() {
    // Arrange
    let server = TestServer::start();
    let mut client = server.client("/").await;

    // Act
    server.handle.shutdown();

    // Assert
    match tokio::time::timeout(WAIT, client.receive()).await {
        Ok(Ok(ClientMessage::Close(Some(CloseFrame { code, .. })))) => {
            assert_eq!(code, CloseCode::GoingAway)
        }
        other => panic!("expected CLOSE 1001, got {other:?}"),
    }
}

// ── Admission and handshake failures ──────────────────────────────────────────

#[tokio::test]
async fn test_connection_over_limit_is_dropped() {
    // Arrange
    let server = TestServer::start_with(|config| config.max_connections = 1);
    let mut first = server.client("/").await;

    // Act
    let mut second = WebSocketClient::new(&server.url("/"), ClientConfig::default()).unwrap();
    let result = second.connect().await;

    // Assert
    assert!(
        matches!(result, Err(ClientError::Closed | ClientError::Io(_))),
        "got {result:?}"
    );
    first.send_text("still here").await.unwrap();
    assert_eq!(next_text(&mut first).await, "still here");
}

#[test]
fn test_missing_key_gets_400() {
    // Arrange
    let server = TestServer::start();
    let mut stream = TcpStream::connect(server.addr).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    let request = "GET / HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\
                   Connection: Upgrade\r\nSec-WebSocket-Version: 13\r\n\r\n";

    // Act
    stream.write_all(request.as_bytes()).unwrap();
    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response);

    // Assert
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 400"), "got {response:?}");
}

#[tokio::test]
async fn test_any_path_with_query_upgrades() {
    let server = TestServer::start();
    let mut client = server.client("/rooms/7?x=1").await;

    client.send_text("ping").await.unwrap();

    assert_eq!(next_text(&mut client).await, "ping");
}
