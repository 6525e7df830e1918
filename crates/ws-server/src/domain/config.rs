//! Server configuration types.
//!
//! [`ServerConfig`] is the single source of truth for all runtime settings
//! the event loop consumes.  It is a plain struct: the infrastructure layer
//! populates it from a TOML file, CLI flags or environment variables, and the
//! domain never reads any of those itself.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use thiserror::Error;

/// Smallest frame a client can legally send: 2 header bytes + 4 mask bytes.
pub const MIN_VIABLE_FRAME: usize = 6;

/// Smallest handshake header budget that can hold a minimal Upgrade request.
pub const MIN_HANDSHAKE_BYTES: usize = 128;

/// Invalid configuration values.  Fatal at startup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid bind address '{host}:{port}'")]
    InvalidBindAddress { host: String, port: u16 },

    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
}

/// All runtime configuration for the WebSocket server.
///
/// # Example
///
/// ```rust
/// use ws_server::domain::ServerConfig;
///
/// let cfg = ServerConfig::default();
/// assert_eq!(cfg.bind_addr().unwrap().port(), 8080);
/// assert_eq!(cfg.max_connections, 25);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Interface to bind.  `0.0.0.0` accepts connections on every interface.
    pub host: String,

    /// TCP port to listen on.  `0` lets the OS choose (useful in tests).
    pub port: u16,

    /// Live sessions allowed at once; further connections are refused.
    pub max_connections: usize,

    /// Upper bound on a single socket read.  Frames larger than this are
    /// assembled across several reads.
    pub max_frame_bytes: usize,

    /// Readiness wait timeout used while handshakes are pending.  With no
    /// pending handshakes the loop blocks until a socket becomes ready.
    pub tick_interval: Duration,

    /// How long a connection may take to complete its handshake.
    pub read_timeout: Duration,

    /// Largest reassembled message accepted from a client.
    pub max_message_bytes: usize,

    /// Largest handshake header block accepted from a client.
    pub max_handshake_bytes: usize,
}

impl Default for ServerConfig {
    /// | Field               | Default       |
    /// |---------------------|---------------|
    /// | host                | `0.0.0.0`     |
    /// | port                | `8080`        |
    /// | max_connections     | 25            |
    /// | max_frame_bytes     | 1024          |
    /// | tick_interval       | 500 000 µs    |
    /// | read_timeout        | 3 seconds     |
    /// | max_message_bytes   | 16 MiB        |
    /// | max_handshake_bytes | 8 KiB         |
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 25,
            max_frame_bytes: 1024,
            tick_interval: Duration::from_micros(500_000),
            read_timeout: Duration::from_secs(3),
            max_message_bytes: 16 * 1024 * 1024,
            max_handshake_bytes: 8 * 1024,
        }
    }
}

impl ServerConfig {
    /// Resolves `host:port` to the address the listener binds.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidBindAddress`] when `host` is neither an IP
    /// literal nor a resolvable name.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ConfigError::InvalidBindAddress {
                host: self.host.clone(),
                port: self.port,
            })
    }

    /// Checks every limit for a usable value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(invalid("max_connections", "must be at least 1"));
        }
        if self.max_frame_bytes < MIN_VIABLE_FRAME {
            return Err(invalid(
                "max_frame_bytes",
                &format!("must be at least {MIN_VIABLE_FRAME}"),
            ));
        }
        if self.max_message_bytes == 0 {
            return Err(invalid("max_message_bytes", "must be at least 1"));
        }
        if self.max_handshake_bytes < MIN_HANDSHAKE_BYTES {
            return Err(invalid(
                "max_handshake_bytes",
                &format!("must be at least {MIN_HANDSHAKE_BYTES}"),
            ));
        }
        if self.tick_interval.is_zero() {
            return Err(invalid("tick_interval", "must be positive"));
        }
        if self.read_timeout.is_zero() {
            return Err(invalid("read_timeout", "must be positive"));
        }
        Ok(())
    }
}

fn invalid(name: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name,
        reason: reason.to_string(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
