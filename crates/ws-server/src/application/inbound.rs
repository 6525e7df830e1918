//! Processing of bytes read from a connection.
//!
//! The event loop reads raw chunks and hands each one to [`handle_input`].
//! What happens next depends on the session state:
//!
//! ```text
//! CONNECTED / HANDSHAKING ─► buffer, negotiate ─► 101 + on_open   (or reject, no on_close)
//! OPEN                    ─► frame buffer ─► control frames answered here
//!                                          ─► data frames ─► assembler ─► on_message
//! CLOSING / CLOSED        ─► ignored
//! ```
//!
//! Every protocol violation retires the connection with the matching close
//! code and reports a [`ServerError::Protocol`] through `on_error`.

use tracing::{debug, info, trace, warn};
use ws_core::protocol::close::parse_close_payload;
use ws_core::protocol::frame::{encode_frame, FrameError, Opcode};
use ws_core::protocol::handshake::{negotiate, HandshakeError, HandshakeResponse, Negotiation};
use ws_core::protocol::CloseCode;

use crate::application::hooks::{HandshakeDecision, ServerHooks};
use crate::application::registry::ConnectionRegistry;
use crate::application::router::MessageRouter;
use crate::domain::{ConnectionId, ServerConfig, SessionState, MIN_VIABLE_FRAME};
use crate::error::ServerError;

/// Feeds one chunk read from `id` through the handshake or frame pipeline.
pub fn handle_input<H: ServerHooks + ?Sized>(
    registry: &mut ConnectionRegistry,
    hooks: &mut H,
    config: &ServerConfig,
    id: ConnectionId,
    bytes: &[u8],
) {
    let Some(conn) = registry.get(id) else {
        return;
    };
    match conn.session().state() {
        SessionState::Connected | SessionState::Handshaking => {
            handshake_step(registry, hooks, config, id, bytes)
        }
        SessionState::Open => {
            // A short read that cannot hold a masked frame header, arriving
            // with nothing buffered, is how a vanished peer shows up.
            if bytes.len() < MIN_VIABLE_FRAME && conn.session().at_unit_boundary() {
                debug!(conn = %id, bytes = bytes.len(), "short read on idle session, closing");
                registry.retire(id);
                return;
            }
            frame_step(registry, hooks, id, bytes)
        }
        SessionState::Closing | SessionState::Closed => {
            trace!(conn = %id, bytes = bytes.len(), "ignoring input on closing session")
        }
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

fn handshake_step<H: ServerHooks + ?Sized>(
    registry: &mut ConnectionRegistry,
    hooks: &mut H,
    config: &ServerConfig,
    id: ConnectionId,
    bytes: &[u8],
) {
    let Some(conn) = registry.get_mut(id) else {
        return;
    };
    if conn.session().state() == SessionState::Connected {
        // Connected -> Handshaking is always allowed.
        let _ = conn.session_mut().begin_handshake();
    }
    conn.session_mut().handshake_buffer_mut().extend_from_slice(bytes);

    let negotiation = match negotiate(conn.session().handshake_buffer(), config.max_handshake_bytes) {
        Ok(negotiation) => negotiation,
        Err(HandshakeError::Incomplete) => {
            trace!(conn = %id, buffered = conn.session().handshake_buffer().len(), "handshake incomplete");
            return;
        }
        Err(e) => {
            warn!(conn = %id, peer = %conn.session().peer(), "handshake failed: {e}");
            let written = match e.rejection() {
                Some(response) => conn.send(&response.to_bytes()),
                None => Ok(()),
            };
            registry.retire_silently(id);
            hooks.on_error(&ServerError::Protocol {
                id,
                reason: e.to_string(),
            });
            report_rejection_write(hooks, id, written);
            return;
        }
    };

    let Negotiation {
        request,
        mut response,
        consumed,
    } = negotiation;
    let leftover = conn.session().handshake_buffer()[consumed..].to_vec();

    let decision = hooks.on_handshake(&request, &mut response);
    if decision == HandshakeDecision::Reject || !response.is_switching_protocols() {
        if response.is_switching_protocols() {
            response = HandshakeResponse::reject(403, "upgrade refused");
        }
        info!(conn = %id, status = response.status(), "handshake rejected");
        let written = conn.send(&response.to_bytes());
        registry.retire_silently(id);
        report_rejection_write(hooks, id, written);
        return;
    }

    if let Err(source) = conn.send(&response.to_bytes()) {
        warn!(conn = %id, "failed to write handshake response: {source}");
        registry.retire(id);
        hooks.on_error(&ServerError::Connection { id, source });
        return;
    }
    if let Err(e) = conn.session_mut().open(request.path()) {
        warn!(conn = %id, "{e}");
        registry.retire(id);
        return;
    }
    info!(conn = %id, peer = %conn.session().peer(), path = request.path(), "session open");

    hooks.on_open(&mut MessageRouter::new(registry), id, &request);

    if !leftover.is_empty() && registry.is_open(id) {
        frame_step(registry, hooks, id, &leftover);
    }
}

fn report_rejection_write<H: ServerHooks + ?Sized>(
    hooks: &mut H,
    id: ConnectionId,
    written: std::io::Result<()>,
) {
    if let Err(source) = written {
        warn!(conn = %id, "failed to write handshake rejection: {source}");
        hooks.on_error(&ServerError::Connection { id, source });
    }
}

// ── Frames ────────────────────────────────────────────────────────────────────

fn frame_step<H: ServerHooks + ?Sized>(
    registry: &mut ConnectionRegistry,
    hooks: &mut H,
    id: ConnectionId,
    bytes: &[u8],
) {
    match registry.get_mut(id) {
        Some(conn) => conn.session_mut().recv_buffer_mut().extend(bytes),
        None => return,
    }

    loop {
        // Hooks may close this connection; re-check before every frame.
        let Some(conn) = registry.get_mut(id) else {
            return;
        };
        if !conn.session().is_open() {
            return;
        }

        let frame = match conn.session_mut().recv_buffer_mut().next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                let code = match e {
                    FrameError::PayloadTooLarge { .. } => CloseCode::MessageTooBig,
                    _ => CloseCode::ProtocolError,
                };
                fail(registry, hooks, id, code, e.to_string());
                return;
            }
        };

        if !frame.is_masked() {
            fail(registry, hooks, id, CloseCode::ProtocolError, "client frame is not masked".to_string());
            return;
        }

        match frame.opcode() {
            Opcode::Ping => {
                trace!(conn = %id, bytes = frame.payload().len(), "ping");
                if let Err(source) = conn.send(&encode_frame(frame.payload(), Opcode::Pong, false)) {
                    registry.retire(id);
                    hooks.on_error(&ServerError::Connection { id, source });
                    return;
                }
            }
            Opcode::Pong => trace!(conn = %id, "pong"),
            Opcode::Close => {
                let (code, reason) = match parse_close_payload(frame.payload()) {
                    Ok(Some(close)) => (close.code, close.reason),
                    Ok(None) => (CloseCode::Normal, String::new()),
                    Err(e) => {
                        fail(registry, hooks, id, CloseCode::ProtocolError, e.to_string());
                        return;
                    }
                };
                debug!(conn = %id, %code, reason = %reason, "peer closed");
                MessageRouter::new(registry).close(id, code);
                return;
            }
            Opcode::Text | Opcode::Binary | Opcode::Continuation => {
                match conn.session_mut().assembler_mut().push(frame) {
                    Ok(Some(message)) => {
                        trace!(conn = %id, bytes = message.payload().len(), "message");
                        hooks.on_message(&mut MessageRouter::new(registry), id, &message);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        fail(registry, hooks, id, e.close_code(), e.to_string());
                        return;
                    }
                }
            }
        }
    }
}

fn fail<H: ServerHooks + ?Sized>(
    registry: &mut ConnectionRegistry,
    hooks: &mut H,
    id: ConnectionId,
    code: CloseCode,
    reason: String,
) {
    warn!(conn = %id, %code, "protocol violation: {reason}");
    MessageRouter::new(registry).close(id, code);
    hooks.on_error(&ServerError::Protocol { id, reason });
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::socket::{MemorySocket, Socket};
    use crate::domain::Session;
    use ws_core::protocol::close::encode_close_payload;
    use ws_core::protocol::frame::{encode_frame_with_key, Frame};
    use ws_core::protocol::handshake::{compute_accept_key, HandshakeRequest};
    use ws_core::protocol::message::Message;

    const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const MASK: [u8; 4] = [1, 2, 3, 4];

    /// Records every hook invocation as a short string.
    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
        reject: bool,
        reply: bool,
    }

    impl ServerHooks for Recorder {
        fn on_handshake(
            &mut self,
            request: &HandshakeRequest,
            response: &mut HandshakeResponse,
        ) -> HandshakeDecision {
            self.events.push(format!("handshake {}", request.path()));
            response.headers_mut().set("X-Test", "1");
            if self.reject {
                HandshakeDecision::Reject
            } else {
                HandshakeDecision::Accept
            }
        }

        fn on_open(&mut self, _: &mut MessageRouter<'_>, id: ConnectionId, _: &HandshakeRequest) {
            self.events.push(format!("open {}", id.get()));
        }

        fn on_message(&mut self, router: &mut MessageRouter<'_>, id: ConnectionId, message: &Message) {
            self.events.push(format!("message {} {}", id.get(), message.as_text().unwrap_or("<bin>")));
            if self.reply {
                router.send_to(id, message.payload()).unwrap();
            }
        }

        fn on_close(&mut self, _: &mut MessageRouter<'_>, session: &Session) {
            self.events.push(format!("close {}", session.id().get()));
        }

        fn on_error(&mut self, error: &ServerError) {
            self.events.push(format!("error {}", error.connection().map_or(0, |id| id.get())));
        }
    }

    struct Harness {
        registry: ConnectionRegistry,
        hooks: Recorder,
        config: ServerConfig,
        id: ConnectionId,
        socket: MemorySocket,
    }

    impl Harness {
        fn new() -> Self {
            let config = ServerConfig {
                max_message_bytes: 64,
                ..ServerConfig::default()
            };
            let mut registry = ConnectionRegistry::new(config.max_message_bytes);
            let socket = MemorySocket::new("127.0.0.1:40000");
            let id = registry.insert(Box::new(socket.clone()), socket.peer_addr().unwrap());
            Self {
                registry,
                hooks: Recorder::default(),
                config,
                id,
                socket,
            }
        }

        fn opened() -> Self {
            let mut h = Self::new();
            h.feed(&upgrade_request("/"));
            assert!(h.socket.written().starts_with(b"HTTP/1.1 101"));
            h.socket.clear_written();
            h.hooks.events.clear();
            h
        }

        fn feed(&mut self, bytes: &[u8]) {
            handle_input(&mut self.registry, &mut self.hooks, &self.config, self.id, bytes);
        }

        /// Runs the release step the event loop performs after each read.
        fn release(&mut self) {
            while let Some((id, source)) = self.registry.pop_failure() {
                self.hooks.on_error(&ServerError::Connection { id, source });
            }
            while let Some(mut conn) = self.registry.pop_retired() {
                conn.session_mut().mark_closed();
                if conn.notifies_close() {
                    self.hooks.on_close(&mut MessageRouter::new(&mut self.registry), conn.session());
                }
            }
        }
    }

    fn upgrade_request(path: &str) -> Vec<u8> {
        HandshakeRequest::client("localhost", path, KEY).to_bytes()
    }

    fn masked(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
        encode_frame_with_key(payload, opcode, Some(MASK))
    }

    fn response_text(socket: &MemorySocket) -> String {
        String::from_utf8_lossy(&socket.written()).into_owned()
    }

    #[test]
    fn test_valid_upgrade_opens_session() {
        // Arrange
        let mut h = Harness::new();

        // Act
        h.feed(&upgrade_request("/chat"));

        // Assert
        let response = response_text(&h.socket);
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains(&compute_accept_key(KEY)));
        assert!(response.contains("X-Test: 1"));
        assert!(h.registry.is_open(h.id));
        assert_eq!(h.registry.session(h.id).unwrap().path(), "/chat");
        assert_eq!(h.hooks.events, vec!["handshake /chat", "open 1"]);
    }

    #[test]
    fn test_upgrade_split_across_reads() {
        let mut h = Harness::new();
        let request = upgrade_request("/");
        let (head, tail) = request.split_at(20);

        h.feed(head);
        assert_eq!(
            h.registry.session(h.id).unwrap().state(),
            SessionState::Handshaking
        );
        assert!(h.socket.written().is_empty());

        h.feed(tail);
        assert!(h.registry.is_open(h.id));
    }

    #[test]
    fn test_frames_after_request_in_same_read_are_processed() {
        // Arrange
        let mut h = Harness::new();
        let mut bytes = upgrade_request("/");
        bytes.extend(masked(Opcode::Text, b"early"));

        // Act
        h.feed(&bytes);

        // Assert
        assert_eq!(h.hooks.events, vec!["handshake /", "open 1", "message 1 early"]);
    }

    #[test]
    fn test_missing_key_gets_400_without_close_notification() {
        // Arrange
        let mut h = Harness::new();
        let request = b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";

        // Act
        h.feed(request);
        h.release();

        // Assert
        assert!(response_text(&h.socket).starts_with("HTTP/1.1 400"));
        assert!(!h.registry.contains(h.id));
        assert_eq!(h.hooks.events, vec!["error 1"]);
    }

    #[test]
    fn test_oversized_headers_get_431() {
        let mut h = Harness::new();
        h.config.max_handshake_bytes = 128;
        h.feed(&[b'a'; 200]);
        h.release();
        assert!(response_text(&h.socket).starts_with("HTTP/1.1 431"));
        assert!(!h.registry.contains(h.id));
        assert_eq!(h.hooks.events, vec!["error 1"]);
    }

    #[test]
    fn test_hook_rejection_sends_403_without_close_notification() {
        let mut h = Harness::new();
        h.hooks.reject = true;

        h.feed(&upgrade_request("/"));
        h.release();

        assert!(response_text(&h.socket).starts_with("HTTP/1.1 403"));
        assert!(!h.registry.contains(h.id));
        assert_eq!(h.hooks.events, vec!["handshake /"]);
    }

    #[test]
    fn test_unwritable_rejection_reaches_on_error() {
        // Arrange
        let mut h = Harness::new();
        h.hooks.reject = true;
        h.socket.fail_writes();

        // Act
        h.feed(&upgrade_request("/"));
        h.release();

        // Assert
        assert!(!h.registry.contains(h.id));
        assert_eq!(h.hooks.events, vec!["handshake /", "error 1"]);
    }

    #[test]
    fn test_unwritable_400_reports_both_failures() {
        let mut h = Harness::new();
        h.socket.fail_writes();

        h.feed(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        h.release();

        assert_eq!(h.hooks.events, vec!["error 1", "error 1"]);
    }

    #[test]
    fn test_hang_up_before_handshake_still_notifies_close() {
        let mut h = Harness::new();
        h.feed(b"GET / HT");

        h.registry.retire(h.id);
        h.release();

        assert_eq!(h.hooks.events, vec!["close 1"]);
    }

    #[test]
    fn test_unwritable_close_echo_reaches_on_error() {
        // Arrange
        let mut h = Harness::opened();
        h.socket.fail_writes();

        // Act
        h.feed(&masked(Opcode::Close, &encode_close_payload(CloseCode::Normal, "")));
        h.release();

        // Assert
        assert!(!h.registry.contains(h.id));
        assert_eq!(h.hooks.events, vec!["error 1", "close 1"]);
    }

    #[test]
    fn test_text_message_reaches_hook() {
        let mut h = Harness::opened();
        h.feed(&masked(Opcode::Text, b"hello"));
        assert_eq!(h.hooks.events, vec!["message 1 hello"]);
    }

    #[test]
    fn test_hook_reply_is_unmasked_text() {
        let mut h = Harness::opened();
        h.hooks.reply = true;

        h.feed(&masked(Opcode::Text, b"echo me"));

        let frames = h.socket.take_frames();
        assert_eq!(frames.len(), 1);
        assert!(!frames[0].is_masked());
        assert_eq!(frames[0].payload(), b"echo me");
    }

    #[test]
    fn test_frame_split_across_reads_is_assembled() {
        let mut h = Harness::opened();
        let wire = masked(Opcode::Text, b"split frame");
        h.feed(&wire[..8]);
        assert!(h.hooks.events.is_empty());
        h.feed(&wire[8..]);
        assert_eq!(h.hooks.events, vec!["message 1 split frame"]);
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let mut h = Harness::opened();
        let mut bytes = masked(Opcode::Text, b"one");
        bytes.extend(masked(Opcode::Text, b"two"));
        h.feed(&bytes);
        assert_eq!(h.hooks.events, vec!["message 1 one", "message 1 two"]);
    }

    #[test]
    fn test_fragmented_message_with_interleaved_ping() {
        // Arrange
        let mut h = Harness::opened();
        let mut bytes = Frame::text("frag").with_final(false).with_mask(MASK).encode();
        bytes.extend(masked(Opcode::Ping, b"p"));
        bytes.extend(Frame::new(Opcode::Continuation, b"mented".to_vec()).with_mask(MASK).encode());

        // Act
        h.feed(&bytes);

        // Assert
        assert_eq!(h.hooks.events, vec!["message 1 fragmented"]);
        let frames = h.socket.take_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode(), Opcode::Pong);
        assert_eq!(frames[0].payload(), b"p");
    }

    #[test]
    fn test_ping_is_answered_with_pong() {
        let mut h = Harness::opened();
        h.feed(&masked(Opcode::Ping, b"are you there"));
        let frames = h.socket.take_frames();
        assert_eq!(frames[0].opcode(), Opcode::Pong);
        assert_eq!(frames[0].payload(), b"are you there");
        assert!(h.hooks.events.is_empty());
    }

    #[test]
    fn test_close_is_echoed_and_session_released() {
        // Arrange
        let mut h = Harness::opened();
        let payload = encode_close_payload(CloseCode::GoingAway, "bye");

        // Act
        h.feed(&masked(Opcode::Close, &payload));
        h.release();

        // Assert
        let frames = h.socket.take_frames();
        assert_eq!(frames[0].opcode(), Opcode::Close);
        let echoed = parse_close_payload(frames[0].payload()).unwrap().unwrap();
        assert_eq!(echoed.code, CloseCode::GoingAway);
        assert!(!h.registry.contains(h.id));
        assert_eq!(h.hooks.events, vec!["close 1"]);
    }

    #[test]
    fn test_empty_close_is_answered_with_normal() {
        let mut h = Harness::opened();
        // Masked CLOSE with no payload is exactly the minimal six bytes.
        h.feed(&masked(Opcode::Close, b""));
        let frames = h.socket.take_frames();
        let echoed = parse_close_payload(frames[0].payload()).unwrap().unwrap();
        assert_eq!(echoed.code, CloseCode::Normal);
    }

    #[test]
    fn test_unmasked_client_frame_is_protocol_error() {
        // Arrange
        let mut h = Harness::opened();

        // Act
        h.feed(&encode_frame(b"plain text", Opcode::Text, false));
        h.release();

        // Assert
        let frames = h.socket.take_frames();
        let close = parse_close_payload(frames[0].payload()).unwrap().unwrap();
        assert_eq!(close.code, CloseCode::ProtocolError);
        assert_eq!(h.hooks.events, vec!["error 1", "close 1"]);
    }

    #[test]
    fn test_reserved_bits_close_with_protocol_error() {
        let mut h = Harness::opened();
        let mut wire = masked(Opcode::Text, b"rsv");
        wire[0] |= 0x40;
        h.feed(&wire);
        let frames = h.socket.take_frames();
        let close = parse_close_payload(frames[0].payload()).unwrap().unwrap();
        assert_eq!(close.code, CloseCode::ProtocolError);
    }

    #[test]
    fn test_oversized_frame_closes_with_1009() {
        let mut h = Harness::opened();
        h.feed(&masked(Opcode::Binary, &[0u8; 100]));
        let frames = h.socket.take_frames();
        let close = parse_close_payload(frames[0].payload()).unwrap().unwrap();
        assert_eq!(close.code, CloseCode::MessageTooBig);
        assert!(!h.registry.contains(h.id));
    }

    #[test]
    fn test_invalid_utf8_closes_with_1007() {
        let mut h = Harness::opened();
        h.feed(&masked(Opcode::Text, &[0xFF, 0xFE, 0xFD]));
        let frames = h.socket.take_frames();
        let close = parse_close_payload(frames[0].payload()).unwrap().unwrap();
        assert_eq!(close.code, CloseCode::InvalidPayload);
    }

    #[test]
    fn test_short_read_on_idle_session_closes_without_frame() {
        // Arrange
        let mut h = Harness::opened();

        // Act
        h.feed(&[0x81, 0x80, 0x00]);
        h.release();

        // Assert
        assert!(h.socket.written().is_empty());
        assert_eq!(h.hooks.events, vec!["close 1"]);
    }

    #[test]
    fn test_short_read_completing_a_frame_is_kept() {
        let mut h = Harness::opened();
        let wire = masked(Opcode::Text, b"abc");
        let (head, tail) = wire.split_at(wire.len() - 3);
        h.feed(head);
        h.feed(tail);
        assert_eq!(h.hooks.events, vec!["message 1 abc"]);
    }

    #[test]
    fn test_input_for_unknown_connection_is_ignored() {
        let mut h = Harness::opened();
        handle_input(
            &mut h.registry,
            &mut h.hooks,
            &h.config,
            ConnectionId::new(42),
            &masked(Opcode::Text, b"x"),
        );
        assert!(h.hooks.events.is_empty());
    }
}
