//! Error type for the WebSocket client.

use std::io;
use std::time::Duration;

use thiserror::Error;
use ws_core::protocol::{AssemblyError, FrameError, HandshakeError};

#[derive(Debug, Error)]
pub enum ClientError {
    /// TCP connection to the server failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// An I/O error on the established connection.
    #[error("connection I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("invalid frame from server: {0}")]
    Frame(#[from] FrameError),

    #[error("invalid message from server: {0}")]
    Assembly(#[from] AssemblyError),

    /// The server broke a framing rule that is not a decoding error,
    /// e.g. it masked a frame.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("invalid WebSocket URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// An operation needed an open connection and none was established.
    #[error("not connected")]
    NotConnected,

    /// The connection was closed, by either side.
    #[error("connection closed")]
    Closed,
}

impl ClientError {
    pub(crate) fn invalid_url(url: &str, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_names_address() {
        let err = ClientError::Connect {
            addr: "127.0.0.1:1".to_string(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(err.to_string().starts_with("failed to connect to 127.0.0.1:1"));
    }

    #[test]
    fn test_timeout_message_includes_duration() {
        let err = ClientError::Timeout {
            operation: "handshake",
            after: Duration::from_secs(3),
        };
        assert_eq!(err.to_string(), "handshake timed out after 3s");
    }

    #[test]
    fn test_handshake_error_converts() {
        let err: ClientError = HandshakeError::MissingAccept.into();
        assert!(matches!(err, ClientError::Handshake(HandshakeError::MissingAccept)));
    }
}
