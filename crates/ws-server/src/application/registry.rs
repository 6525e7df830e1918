//! Connection registry: owns every live socket and its session.
//!
//! Connections leave the registry in one of two ways:
//!
//! - [`ConnectionRegistry::remove`] drops a connection silently.  Only used
//!   before the application has been told about it.
//! - [`ConnectionRegistry::retire`] moves it to a release queue.  The event
//!   loop drains that queue after each step, flushing, deregistering and
//!   shutting down each socket before calling `on_close`.
//! - [`ConnectionRegistry::retire_silently`] queues it the same way but the
//!   loop skips `on_close`.  Used for refused handshakes.
//!
//! Write failures noticed where no hooks are at hand (a CLOSE frame sent
//! by the router, for one) are queued with [`ConnectionRegistry::report_failure`]
//! and handed to `on_error` by the event loop.
//!
//! Retiring is immediate from the caller's point of view: the id is gone
//! from every lookup, so broadcasts that run later in the same tick never
//! see it.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::application::socket::Socket;
use crate::domain::{ConnectionId, Session, SessionState};

/// One live socket, its session and the bytes still waiting to be written.
pub struct Connection {
    socket: Box<dyn Socket>,
    session: Session,
    outbox: Vec<u8>,
    write_interest: bool,
    notify_close: bool,
}

impl Connection {
    pub fn new(socket: Box<dyn Socket>, session: Session) -> Self {
        Self {
            socket,
            session,
            outbox: Vec::new(),
            write_interest: false,
            notify_close: true,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.session.id()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn socket(&self) -> &dyn Socket {
        self.socket.as_ref()
    }

    pub fn socket_mut(&mut self) -> &mut dyn Socket {
        self.socket.as_mut()
    }

    pub fn has_pending_output(&self) -> bool {
        !self.outbox.is_empty()
    }

    pub fn pending_output(&self) -> usize {
        self.outbox.len()
    }

    /// Whether the socket is currently registered for WRITABLE readiness.
    pub fn write_interest(&self) -> bool {
        self.write_interest
    }

    pub fn set_write_interest(&mut self, enabled: bool) {
        self.write_interest = enabled;
    }

    /// Whether `on_close` should run when this connection is released.
    pub fn notifies_close(&self) -> bool {
        self.notify_close
    }

    /// Queues `bytes` and writes as much as the socket accepts right now.
    ///
    /// Bytes the socket cannot take yet stay queued; the event loop asks for
    /// WRITABLE readiness and finishes the write later.
    pub fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.outbox.extend_from_slice(bytes);
        self.flush()
    }

    /// Writes queued bytes until the queue is empty or the socket would block.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.outbox.is_empty() {
            match self.socket.write(&self.outbox) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted no bytes",
                    ))
                }
                Ok(n) => {
                    self.outbox.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    trace!(conn = %self.id(), queued = self.outbox.len(), "write would block");
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("session", &self.session)
            .field("outbox", &self.outbox.len())
            .field("write_interest", &self.write_interest)
            .field("notify_close", &self.notify_close)
            .finish_non_exhaustive()
    }
}

/// Every accepted connection, keyed by [`ConnectionId`].
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    retired: VecDeque<Connection>,
    failures: VecDeque<(ConnectionId, io::Error)>,
    next_id: u64,
    max_message_bytes: usize,
}

impl ConnectionRegistry {
    /// An empty registry whose sessions accept messages up to
    /// `max_message_bytes`.
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            connections: HashMap::new(),
            retired: VecDeque::new(),
            failures: VecDeque::new(),
            next_id: 1,
            max_message_bytes,
        }
    }

    /// Adds a freshly accepted socket in `CONNECTED` and returns its new id.
    pub fn insert(&mut self, socket: Box<dyn Socket>, peer: SocketAddr) -> ConnectionId {
        let id = ConnectionId::new(self.next_id);
        self.next_id += 1;
        let session = Session::new(id, peer, self.max_message_bytes);
        self.connections.insert(id, Connection::new(socket, session));
        id
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn session(&self, id: ConnectionId) -> Option<&Session> {
        self.connections.get(&id).map(Connection::session)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn is_open(&self, id: ConnectionId) -> bool {
        self.session(id).is_some_and(Session::is_open)
    }

    /// Live connections, open or not.  Retired connections are not counted.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn open_count(&self) -> usize {
        self.connections.values().filter(|c| c.session().is_open()).count()
    }

    /// Connections that have not finished their handshake.
    pub fn pending_handshakes(&self) -> usize {
        self.connections
            .values()
            .filter(|c| {
                matches!(
                    c.session().state(),
                    SessionState::Connected | SessionState::Handshaking
                )
            })
            .count()
    }

    /// All live ids in ascending order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Ids of `OPEN` sessions in ascending order.
    pub fn open_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .connections
            .values()
            .filter(|c| c.session().is_open())
            .map(Connection::id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    /// Drops a connection without queueing it for release.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    /// Removes a connection from every lookup and queues it for release.
    ///
    /// Returns `false` if `id` is not live.
    pub fn retire(&mut self, id: ConnectionId) -> bool {
        self.queue_release(id, true)
    }

    /// Like [`retire`](Self::retire), but the application never hears
    /// `on_close` for this connection.
    pub fn retire_silently(&mut self, id: ConnectionId) -> bool {
        self.queue_release(id, false)
    }

    fn queue_release(&mut self, id: ConnectionId, notify_close: bool) -> bool {
        let Some(mut conn) = self.connections.remove(&id) else {
            return false;
        };
        if conn.session().state() != SessionState::Closing {
            // Fails only for an already-closed session, which is fine here.
            let _ = conn.session_mut().begin_closing();
        }
        conn.notify_close = notify_close;
        trace!(conn = %id, notify_close, "connection retired");
        self.retired.push_back(conn);
        true
    }

    pub fn has_retired(&self) -> bool {
        !self.retired.is_empty()
    }

    /// Takes the oldest retired connection, if any.
    pub fn pop_retired(&mut self) -> Option<Connection> {
        self.retired.pop_front()
    }

    /// Queues a write failure for the event loop to report.
    pub fn report_failure(&mut self, id: ConnectionId, source: io::Error) {
        self.failures.push_back((id, source));
    }

    /// Takes the oldest queued write failure, if any.
    pub fn pop_failure(&mut self) -> Option<(ConnectionId, io::Error)> {
        self.failures.pop_front()
    }

    /// Connections whose handshake has been pending for at least `timeout`.
    pub fn expired_handshakes(&self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .connections
            .values()
            .filter(|c| c.session().handshake_expired(now, timeout))
            .map(Connection::id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
