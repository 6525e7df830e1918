//! Application layer for ws-server.
//!
//! Everything between "bytes arrived on connection N" and "bytes must be
//! written to connections A, B, C".  No readiness polling happens here: the
//! code works against the [`socket::Socket`] trait, so every rule can be
//! exercised with in-memory sockets.
//!
//! # Sub-modules
//!
//! - **`socket`**   – The transport trait the registry stores.
//! - **`registry`** – Owns every connection, allocates ids, queues retired
//!   connections for release.
//! - **`router`**   – Unicast, filtered broadcast and server-initiated close.
//! - **`hooks`**    – The callback trait applications implement.
//! - **`inbound`**  – Handshake negotiation and frame handling for bytes read
//!   from a connection.

pub mod hooks;
pub mod inbound;
pub mod registry;
pub mod router;
pub mod socket;

pub use hooks::{HandshakeDecision, NoopHooks, ServerHooks};
pub use inbound::handle_input;
pub use registry::{Connection, ConnectionRegistry};
pub use router::{BroadcastReport, MessageRouter, Recipients, RouteError, Target};
pub use socket::Socket;
