//! ws-server: a single-threaded WebSocket server.
//!
//! Runs the `mio` event loop with a small demonstration application:
//!
//! - Sessions opened on `/chat` relay every text message to all other open
//!   `/chat` sessions.
//! - Sessions on any other path get each message echoed back.
//!
//! # Usage
//!
//! ```text
//! ws-server [OPTIONS]
//!
//! Options:
//!   --config <FILE>                TOML configuration file
//!   --host <HOST>                  Interface to bind [default: 0.0.0.0]
//!   --port <PORT>                  TCP port [default: 8080]
//!   --max-connections <N>          Live session limit [default: 25]
//!   --max-frame-bytes <N>          Socket read size [default: 1024]
//!   --tick-interval-micros <N>     Poll timeout during handshakes [default: 500000]
//!   --read-timeout <SECS>          Handshake deadline [default: 3]
//!   --log-level <FILTER>           tracing filter [default: info]
//!   --background                   Detach from the terminal
//!   --uid <UID> --gid <GID>        Identity to switch to after binding
//! ```
//!
//! # Precedence
//!
//! Flag > `WS_*` environment variable > config file > built-in default.
//! `RUST_LOG`, when set, overrides the log level entirely.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use ws_core::protocol::handshake::HandshakeRequest;
use ws_core::protocol::message::Message;
use ws_server::application::{MessageRouter, Recipients, ServerHooks};
use ws_server::domain::{ConnectionId, ServerConfig, Session};
use ws_server::infrastructure::{
    apply_process_options, load_config, EventLoop, FileConfig, ForegroundProcess, ProcessOptions,
};
use ws_server::ServerError;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Single-threaded WebSocket server.
#[derive(Debug, Parser)]
#[command(name = "ws-server", about = "Single-threaded RFC 6455 WebSocket server", version)]
struct Cli {
    /// TOML configuration file.  Values given here as flags win over it.
    #[arg(long, env = "WS_CONFIG")]
    config: Option<PathBuf>,

    /// Interface to bind.  `0.0.0.0` accepts connections on every interface.
    #[arg(long, env = "WS_HOST")]
    host: Option<String>,

    #[arg(long, env = "WS_PORT")]
    port: Option<u16>,

    /// Live sessions allowed at once.
    #[arg(long, env = "WS_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// Upper bound on a single socket read, in bytes.
    #[arg(long, env = "WS_MAX_FRAME_BYTES")]
    max_frame_bytes: Option<usize>,

    /// Readiness wait timeout while handshakes are pending, in microseconds.
    #[arg(long, env = "WS_TICK_INTERVAL_MICROS")]
    tick_interval_micros: Option<u64>,

    /// Handshake deadline in seconds.
    #[arg(long, env = "WS_READ_TIMEOUT")]
    read_timeout: Option<u64>,

    /// Largest reassembled message accepted from a client, in bytes.
    #[arg(long, env = "WS_MAX_MESSAGE_BYTES")]
    max_message_bytes: Option<usize>,

    /// `tracing` filter, e.g. `info` or `ws_server=debug`.
    #[arg(long, env = "WS_LOG_LEVEL")]
    log_level: Option<String>,

    /// Detach from the controlling terminal.
    #[arg(long, env = "WS_BACKGROUND")]
    background: bool,

    /// User id to switch to after binding.
    #[arg(long, env = "WS_UID", requires = "gid")]
    uid: Option<u32>,

    /// Group id to switch to after binding.
    #[arg(long, env = "WS_GID", requires = "uid")]
    gid: Option<u32>,
}

/// Fully resolved startup settings.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Settings {
    server: ServerConfig,
    log_level: String,
    process: ProcessOptions,
}

impl Cli {
    /// Layers the flags over `file`.
    fn resolve(self, file: FileConfig) -> Settings {
        let mut server = file.server.to_server_config();
        if let Some(host) = self.host {
            server.host = host;
        }
        if let Some(port) = self.port {
            server.port = port;
        }
        if let Some(n) = self.max_connections {
            server.max_connections = n;
        }
        if let Some(n) = self.max_frame_bytes {
            server.max_frame_bytes = n;
        }
        if let Some(micros) = self.tick_interval_micros {
            server.tick_interval = Duration::from_micros(micros);
        }
        if let Some(secs) = self.read_timeout {
            server.read_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = self.max_message_bytes {
            server.max_message_bytes = n;
        }

        let identity = match (self.uid, self.gid) {
            (Some(uid), Some(gid)) => Some((uid, gid)),
            _ => file.process.uid.zip(file.process.gid),
        };
        Settings {
            server,
            log_level: self.log_level.unwrap_or(file.logging.level),
            process: ProcessOptions {
                background: self.background || file.process.background,
                identity,
            },
        }
    }
}

// ── Demonstration hooks ───────────────────────────────────────────────────────

const CHAT_PATH: &str = "/chat";

/// Echo on every path except `/chat`, which relays to the other chat members.
#[derive(Debug, Default)]
struct DemoHooks;

impl DemoHooks {
    fn chat_members(router: &MessageRouter<'_>) -> Vec<ConnectionId> {
        router
            .open_ids()
            .into_iter()
            .filter(|id| router.registry().session(*id).is_some_and(|s| s.path() == CHAT_PATH))
            .collect()
    }
}

impl ServerHooks for DemoHooks {
    fn on_open(
        &mut self,
        _router: &mut MessageRouter<'_>,
        id: ConnectionId,
        request: &HandshakeRequest,
    ) {
        info!(conn = %id, path = request.path(), "client joined");
    }

    fn on_message(&mut self, router: &mut MessageRouter<'_>, id: ConnectionId, message: &Message) {
        let in_chat = router
            .registry()
            .session(id)
            .is_some_and(|s| s.path() == CHAT_PATH);

        if !in_chat {
            if let Err(e) = router.send_to(id, message.payload()) {
                debug!(conn = %id, "echo failed: {e}");
            }
            return;
        }

        let others: Vec<_> = Self::chat_members(router)
            .into_iter()
            .filter(|member| *member != id)
            .collect();
        router.broadcast(message.payload(), &Recipients::only(others), Some(id));
    }

    fn on_close(&mut self, _router: &mut MessageRouter<'_>, session: &Session) {
        info!(conn = %session.id(), path = session.path(), "client left");
    }

    fn on_error(&mut self, error: &ServerError) {
        warn!("{error}");
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Program entry point.
///
/// The event loop is blocking, so it runs on Tokio's blocking pool while the
/// async side only waits for Ctrl+C.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let file = match &cli.config {
        Some(path) => load_config(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => FileConfig::default(),
    };
    let settings = cli.resolve(file);

    // ── Logging setup ─────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.log_level)),
        )
        .init();

    info!(
        "ws-server starting: bind={}:{}, max_connections={}",
        settings.server.host, settings.server.port, settings.server.max_connections
    );

    let mut event_loop = EventLoop::bind(settings.server.clone(), DemoHooks)
        .context("failed to start WebSocket server")?;

    let process = Arc::new(ForegroundProcess::new(event_loop.shutdown_handle()));
    apply_process_options(process.as_ref(), &settings.process)
        .context("failed to apply process options")?;

    // ── Graceful shutdown ─────────────────────────────────────────────────────
    let signal_process = Arc::clone(&process);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, initiating graceful shutdown");
                signal_process.request_termination();
            }
            Err(e) => {
                error!("failed to listen for Ctrl+C signal: {e}");
            }
        }
    });

    tokio::task::spawn_blocking(move || event_loop.run())
        .await
        .context("event loop thread panicked")??;

    info!("ws-server stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
