//! Error taxonomy for ws-server.
//!
//! Only [`ServerError::Configuration`], [`ServerError::Bind`] and
//! [`ServerError::Transport`] raised from [`crate::EventLoop::bind`] are
//! fatal.  Everything else is scoped to one connection: the loop closes that
//! connection, reports the error through
//! [`crate::application::ServerHooks::on_error`] and keeps serving the rest.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::domain::{ConfigError, ConnectionId};

#[derive(Debug, Error)]
pub enum ServerError {
    /// A peer broke the handshake or framing rules.
    #[error("protocol error on connection {id}: {reason}")]
    Protocol { id: ConnectionId, reason: String },

    /// Reading from or writing to one connection failed.
    #[error("transport error on connection {id}: {source}")]
    Connection {
        id: ConnectionId,
        #[source]
        source: io::Error,
    },

    /// The connection limit was reached; the new socket was dropped.
    #[error("connection from {peer} refused: limit of {limit} connections reached")]
    ConnectionLimit { peer: SocketAddr, limit: usize },

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Listener, poller or waker failure.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
}

impl ServerError {
    /// The connection this error is scoped to, if any.
    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            ServerError::Protocol { id, .. } | ServerError::Connection { id, .. } => Some(*id),
            _ => None,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
