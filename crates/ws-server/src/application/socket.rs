//! The transport seam between the application layer and real sockets.
//!
//! The registry, router and inbound processing only ever see a
//! `Box<dyn Socket>`.  The event loop supplies `mio::net::TcpStream`s; unit
//! tests supply the in-memory [`MemorySocket`].

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use mio::event::Source;

/// A non-blocking, pollable byte stream.
///
/// `read` and `write` follow non-blocking semantics: `WouldBlock` means
/// "try again once the poller reports readiness".
pub trait Socket: Read + Write + Source + Send {
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Shuts down both halves of the stream.
    fn shutdown(&self) -> io::Result<()>;
}

#[cfg(test)]
pub(crate) use memory::MemorySocket;
