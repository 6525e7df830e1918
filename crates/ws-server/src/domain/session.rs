//! Per-connection session state.
//!
//! # Lifecycle
//!
//! ```text
//!   accept           first bytes          101 written
//! ─────────► CONNECTED ────────► HANDSHAKING ────────► OPEN
//!                │                    │                 │
//!                └────────────────────┴─────────────────┴──► CLOSING ──► CLOSED
//! ```
//!
//! Any live state may go straight to `CLOSED` when the socket is released
//! (peer hang-up, read error).  `CLOSED` is terminal.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use thiserror::Error;
use ws_core::protocol::frame::FrameBuffer;
use ws_core::protocol::message::MessageAssembler;

/// Opaque connection identifier, assigned by the registry at accept time.
///
/// Ids are allocated monotonically starting at 1 and are never reused while
/// the server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for ConnectionId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connected,
    Handshaking,
    Open,
    Closing,
    Closed,
}

impl SessionState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_become(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connected, Handshaking)
                | (Handshaking, Open)
                | (Connected | Handshaking | Open, Closing)
                | (Connected | Handshaking | Open | Closing, Closed)
        )
    }
}

/// A lifecycle transition that is not allowed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("invalid session transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// Server-side state for one accepted connection.
#[derive(Debug)]
pub struct Session {
    id: ConnectionId,
    peer: SocketAddr,
    state: SessionState,
    path: String,
    connected_at: Instant,
    handshake_buffer: Vec<u8>,
    recv_buffer: FrameBuffer,
    assembler: MessageAssembler,
}

impl Session {
    /// A freshly accepted session in `CONNECTED`.
    ///
    /// `max_message_bytes` bounds both single frames and reassembled
    /// messages.
    pub fn new(id: ConnectionId, peer: SocketAddr, max_message_bytes: usize) -> Self {
        Self {
            id,
            peer,
            state: SessionState::Connected,
            path: "/".to_string(),
            connected_at: Instant::now(),
            handshake_buffer: Vec::new(),
            recv_buffer: FrameBuffer::with_max_payload(max_message_bytes as u64),
            assembler: MessageAssembler::new(max_message_bytes),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    /// Path from the handshake request line; `/` until the session opens.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    fn transition(&mut self, next: SessionState) -> Result<(), InvalidTransition> {
        if !self.state.can_become(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn begin_handshake(&mut self) -> Result<(), InvalidTransition> {
        self.transition(SessionState::Handshaking)
    }

    /// Marks the handshake complete and records the negotiated path.
    pub fn open(&mut self, path: &str) -> Result<(), InvalidTransition> {
        self.transition(SessionState::Open)?;
        self.path = if path.is_empty() { "/".to_string() } else { path.to_string() };
        self.handshake_buffer = Vec::new();
        Ok(())
    }

    pub fn begin_closing(&mut self) -> Result<(), InvalidTransition> {
        self.transition(SessionState::Closing)
    }

    /// Releases the session.  Idempotent.
    pub fn mark_closed(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Whether the handshake has been pending for longer than `timeout`.
    pub fn handshake_expired(&self, now: Instant, timeout: Duration) -> bool {
        matches!(self.state, SessionState::Connected | SessionState::Handshaking)
            && now.saturating_duration_since(self.connected_at) >= timeout
    }

    pub fn handshake_buffer(&self) -> &[u8] {
        &self.handshake_buffer
    }

    pub fn handshake_buffer_mut(&mut self) -> &mut Vec<u8> {
        &mut self.handshake_buffer
    }

    pub fn recv_buffer(&self) -> &FrameBuffer {
        &self.recv_buffer
    }

    pub fn recv_buffer_mut(&mut self) -> &mut FrameBuffer {
        &mut self.recv_buffer
    }

    pub fn assembler_mut(&mut self) -> &mut MessageAssembler {
        &mut self.assembler
    }

    /// Whether no partial frame or fragmented message is buffered.
    pub fn at_unit_boundary(&self) -> bool {
        self.recv_buffer.is_empty() && !self.assembler.is_assembling()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
