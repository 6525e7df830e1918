//! TOML configuration file for the `ws-server` binary.
//!
//! Every field is optional; missing fields take the same defaults as
//! [`ServerConfig::default`].  Example:
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8080
//! max_connections = 25
//! max_frame_bytes = 1024
//! tick_interval_micros = 500000
//! read_timeout_secs = 3
//!
//! [logging]
//! level = "info"
//!
//! [process]
//! background = false
//! ```
//!
//! Command-line flags and `WS_*` environment variables override whatever the
//! file says; see `main.rs`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::ServerConfig;

#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("I/O error reading config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

// ── Schema ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub process: ProcessSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Upper bound on a single socket read, in bytes.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_tick_interval_micros")]
    pub tick_interval_micros: u64,
    /// Handshake deadline in seconds.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_max_handshake_bytes")]
    pub max_handshake_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSection {
    /// `tracing` filter directive: `"error"` … `"trace"`, or a full
    /// `EnvFilter` expression such as `"ws_server=debug"`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProcessSection {
    /// Detach from the controlling terminal.
    #[serde(default)]
    pub background: bool,
    /// Switch to this user after binding.  Requires `gid` as well.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_host() -> String {
    ServerConfig::default().host
}
fn default_port() -> u16 {
    ServerConfig::default().port
}
fn default_max_connections() -> usize {
    ServerConfig::default().max_connections
}
fn default_max_frame_bytes() -> usize {
    ServerConfig::default().max_frame_bytes
}
fn default_tick_interval_micros() -> u64 {
    ServerConfig::default().tick_interval.as_micros() as u64
}
fn default_read_timeout_secs() -> u64 {
    ServerConfig::default().read_timeout.as_secs()
}
fn default_max_message_bytes() -> usize {
    ServerConfig::default().max_message_bytes
}
fn default_max_handshake_bytes() -> usize {
    ServerConfig::default().max_handshake_bytes
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            max_frame_bytes: default_max_frame_bytes(),
            tick_interval_micros: default_tick_interval_micros(),
            read_timeout_secs: default_read_timeout_secs(),
            max_message_bytes: default_max_message_bytes(),
            max_handshake_bytes: default_max_handshake_bytes(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServerSection {
    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            max_connections: self.max_connections,
            max_frame_bytes: self.max_frame_bytes,
            tick_interval: Duration::from_micros(self.tick_interval_micros),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            max_message_bytes: self.max_message_bytes,
            max_handshake_bytes: self.max_handshake_bytes,
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Reads and parses the file at `path`.
///
/// # Errors
///
/// [`ConfigFileError::Io`] if the file cannot be read (including "not
/// found": an explicitly named file must exist), and
/// [`ConfigFileError::Parse`] for malformed TOML.
pub fn load_config(path: &Path) -> Result<FileConfig, ConfigFileError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&content)?)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
