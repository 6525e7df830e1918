//! Domain layer for ws-server.
//!
//! Pure types with no I/O: configuration, connection identity and the
//! session state machine.
//!
//! # What does NOT belong here?
//!
//! - Sockets, `mio` registrations or anything that can block
//! - Reading files or environment variables
//! - Hook invocation and routing (that is the application layer)

pub mod config;
pub mod session;

pub use config::{ConfigError, ServerConfig, MIN_VIABLE_FRAME};
pub use session::{ConnectionId, InvalidTransition, Session, SessionState};
