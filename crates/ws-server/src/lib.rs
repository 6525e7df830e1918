//! ws-server library entry point.
//!
//! A single-threaded WebSocket (RFC 6455) server: one `mio` readiness loop
//! accepts TCP connections, negotiates the HTTP Upgrade, decodes client
//! frames and hands complete messages to application hooks, which reply or
//! broadcast through a [`application::MessageRouter`].
//!
//! # Layers
//!
//! - **`domain`** – configuration, connection ids, the session state
//!   machine.  No I/O.
//! - **`application`** – registry, routing, hooks and inbound processing,
//!   written against a socket trait.
//! - **`infrastructure`** – the event loop, TCP sockets, config file and
//!   process controls.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.

pub mod application;
pub mod domain;
pub mod error;
pub mod infrastructure;

pub use application::{MessageRouter, Recipients, ServerHooks};
pub use domain::{ConnectionId, ServerConfig};
pub use error::ServerError;
pub use infrastructure::{EventLoop, ShutdownHandle};
