//! Single-threaded readiness loop built on `mio`.
//!
//! One thread owns the listener, every connection and the application hooks.
//! Each turn waits for readiness, then:
//!
//! 1. accepts every pending connection (edge-triggered: until `WouldBlock`);
//! 2. flushes connections that became writable;
//! 3. reads every readable connection until `WouldBlock`, feeding each chunk
//!    through [`handle_input`];
//! 4. releases retired connections (flush, deregister, shut down, `on_close`);
//! 5. expires handshakes older than `read_timeout`;
//! 6. toggles WRITABLE interest on connections with queued output.
//!
//! # Tokens
//!
//! | Token | Source                                |
//! |-------|---------------------------------------|
//! | 0     | listener                              |
//! | 1     | [`ShutdownHandle`] waker              |
//! | n + 1 | connection with [`ConnectionId`] `n`  |
//!
//! # Shutdown
//!
//! [`ShutdownHandle::shutdown`] may be called from any thread.  The loop
//! finishes its current turn, sends `1001 Going Away` to every open session,
//! releases all connections and returns from [`EventLoop::run`].

use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, info, trace, warn};
use ws_core::protocol::CloseCode;

use crate::application::{handle_input, ConnectionRegistry, MessageRouter, ServerHooks};
use crate::domain::{ConnectionId, ServerConfig};
use crate::error::ServerError;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const EVENTS_CAPACITY: usize = 1024;

/// Connection `n` polls as token `n + 1`.  Fails once ids outgrow `usize`,
/// which only a 32-bit target can reach.
fn token_for(id: ConnectionId) -> io::Result<Token> {
    usize::try_from(id.get())
        .ok()
        .and_then(|raw| raw.checked_add(1))
        .map(Token)
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, format!("no poll token for connection {id}")))
}

fn connection_for(token: Token) -> ConnectionId {
    ConnectionId::new((token.0 - 1) as u64)
}

/// Thread-safe handle that stops a running [`EventLoop`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Requests a graceful stop and wakes the loop.  Idempotent.
    pub fn shutdown(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.waker.wake() {
                warn!("failed to wake event loop: {e}");
            }
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// The server: listener, connections and hooks driven by one `mio::Poll`.
pub struct EventLoop<H: ServerHooks> {
    config: ServerConfig,
    poll: Poll,
    events: Events,
    listener: TcpListener,
    registry: ConnectionRegistry,
    hooks: H,
    shutdown: ShutdownHandle,
    read_buf: Vec<u8>,
}

impl<H: ServerHooks> EventLoop<H> {
    /// Validates `config`, binds the listener and prepares the poller.
    ///
    /// # Errors
    ///
    /// [`ServerError::Configuration`] for invalid settings,
    /// [`ServerError::Bind`] when the address is unavailable, and
    /// [`ServerError::Transport`] if the poller cannot be created.
    pub fn bind(config: ServerConfig, hooks: H) -> Result<Self, ServerError> {
        config.validate()?;
        let addr = config.bind_addr()?;

        let poll = Poll::new()?;
        let mut listener =
            TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        info!(addr = %listener.local_addr()?, "listening");
        Ok(Self {
            registry: ConnectionRegistry::new(config.max_message_bytes),
            read_buf: vec![0; config.max_frame_bytes],
            config,
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener,
            hooks,
            shutdown: ShutdownHandle {
                requested: Arc::new(AtomicBool::new(false)),
                waker,
            },
        })
    }

    /// The bound address; useful when the configured port was `0`.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    /// Serves connections until [`ShutdownHandle::shutdown`] is called.
    pub fn run(&mut self) -> Result<(), ServerError> {
        info!(
            addr = %self.local_addr()?,
            max_connections = self.config.max_connections,
            "event loop running"
        );
        while !self.shutdown.is_requested() {
            let timeout = self.poll_timeout();
            self.turn(timeout);
        }
        self.close_all(CloseCode::GoingAway, "server shutting down");
        info!("event loop stopped");
        Ok(())
    }

    /// Runs one readiness wait of at most `timeout` and handles every event
    /// it returns.  `None` waits until something is ready.
    pub fn turn(&mut self, timeout: Option<Duration>) {
        let mut events = std::mem::replace(&mut self.events, Events::with_capacity(0));
        match self.poll.poll(&mut events, timeout) {
            Ok(()) => {
                for event in events.iter() {
                    self.dispatch(event);
                    self.finish_retired();
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("readiness wait failed, retrying: {e}");
                self.hooks.on_error(&ServerError::Transport(e));
            }
        }
        self.events = events;

        self.expire_handshakes();
        self.finish_retired();
        self.sync_write_interest();
    }

    /// Blocks indefinitely unless a handshake is waiting to expire.
    fn poll_timeout(&self) -> Option<Duration> {
        (self.registry.pending_handshakes() > 0).then_some(self.config.tick_interval)
    }

    fn dispatch(&mut self, event: &Event) {
        match event.token() {
            LISTENER => self.accept_pending(),
            WAKER => trace!("event loop woken"),
            token => {
                let id = connection_for(token);
                if event.is_writable() {
                    self.flush_connection(id);
                }
                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    self.read_connection(id);
                }
            }
        }
    }

    // ── Accept ────────────────────────────────────────────────────────────────

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {e}");
                    self.hooks.on_error(&ServerError::Transport(e));
                    return;
                }
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        let limit = self.config.max_connections;
        if self.registry.len() >= limit {
            warn!(%peer, limit, "connection limit reached, refusing");
            // Dropping the stream closes it.
            drop(stream);
            self.hooks.on_error(&ServerError::ConnectionLimit { peer, limit });
            return;
        }

        let id = self.registry.insert(Box::new(stream), peer);
        let registered = match self.registry.get_mut(id) {
            Some(conn) => token_for(id).and_then(|token| {
                self.poll
                    .registry()
                    .register(conn.socket_mut(), token, Interest::READABLE)
            }),
            None => return,
        };
        if let Err(source) = registered {
            warn!(conn = %id, "failed to register socket: {source}");
            self.registry.remove(id);
            self.hooks.on_error(&ServerError::Connection { id, source });
            return;
        }

        debug!(conn = %id, %peer, "accepted");
        self.hooks.on_connect(&mut MessageRouter::new(&mut self.registry), id);
    }

    // ── Read / write ──────────────────────────────────────────────────────────

    fn read_connection(&mut self, id: ConnectionId) {
        loop {
            let Some(conn) = self.registry.get_mut(id) else {
                return;
            };
            match conn.socket_mut().read(&mut self.read_buf) {
                Ok(0) => {
                    debug!(conn = %id, "peer hung up");
                    self.registry.retire(id);
                    return;
                }
                Ok(n) => {
                    trace!(conn = %id, bytes = n, "read");
                    handle_input(
                        &mut self.registry,
                        &mut self.hooks,
                        &self.config,
                        id,
                        &self.read_buf[..n],
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    debug!(conn = %id, "read failed: {source}");
                    self.registry.retire(id);
                    self.hooks.on_error(&ServerError::Connection { id, source });
                    return;
                }
            }
        }
    }

    fn flush_connection(&mut self, id: ConnectionId) {
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        if let Err(source) = conn.flush() {
            debug!(conn = %id, "write failed: {source}");
            self.registry.retire(id);
            self.hooks.on_error(&ServerError::Connection { id, source });
        }
    }

    fn sync_write_interest(&mut self) {
        let mut failed = Vec::new();
        for conn in self.registry.iter_mut() {
            let wanted = conn.has_pending_output();
            if wanted == conn.write_interest() {
                continue;
            }
            let interest = if wanted {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            let id = conn.id();
            let registry = self.poll.registry();
            match token_for(id).and_then(|token| registry.reregister(conn.socket_mut(), token, interest)) {
                Ok(()) => conn.set_write_interest(wanted),
                Err(source) => failed.push((id, source)),
            }
        }

        if failed.is_empty() {
            return;
        }
        for (id, source) in failed {
            warn!(conn = %id, "failed to update interest: {source}");
            self.registry.retire(id);
            self.hooks.on_error(&ServerError::Connection { id, source });
        }
        self.finish_retired();
    }

    // ── Release ───────────────────────────────────────────────────────────────

    fn expire_handshakes(&mut self) {
        let timeout = self.config.read_timeout;
        for id in self.registry.expired_handshakes(Instant::now(), timeout) {
            warn!(conn = %id, ?timeout, "handshake timed out");
            self.registry.retire(id);
            self.hooks.on_error(&ServerError::Protocol {
                id,
                reason: format!("handshake not completed within {timeout:?}"),
            });
        }
    }

    /// Reports queued write failures, then releases every retired
    /// connection.  `on_close` may retire more connections; those are
    /// released in the same call.  Refused handshakes get no `on_close`.
    fn finish_retired(&mut self) {
        while let Some((id, source)) = self.registry.pop_failure() {
            self.hooks.on_error(&ServerError::Connection { id, source });
        }
        while let Some(mut conn) = self.registry.pop_retired() {
            let id = conn.id();
            if let Err(e) = conn.flush() {
                trace!(conn = %id, "final flush failed: {e}");
            }
            if let Err(e) = self.poll.registry().deregister(conn.socket_mut()) {
                trace!(conn = %id, "deregister failed: {e}");
            }
            if let Err(e) = conn.socket().shutdown() {
                trace!(conn = %id, "shutdown failed: {e}");
            }
            conn.session_mut().mark_closed();
            info!(conn = %id, peer = %conn.session().peer(), "connection closed");
            if conn.notifies_close() {
                self.hooks
                    .on_close(&mut MessageRouter::new(&mut self.registry), conn.session());
            }
            while let Some((id, source)) = self.registry.pop_failure() {
                self.hooks.on_error(&ServerError::Connection { id, source });
            }
        }
    }

    fn close_all(&mut self, code: CloseCode, reason: &str) {
        let ids = self.registry.ids();
        info!(connections = ids.len(), "closing all connections");
        let mut router = MessageRouter::new(&mut self.registry);
        for id in ids {
            router.close_with_reason(id, code, reason);
        }
        self.finish_retired();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
