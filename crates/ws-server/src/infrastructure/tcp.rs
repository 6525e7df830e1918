//! [`Socket`] for `mio` TCP streams.

use std::io;
use std::net::{Shutdown, SocketAddr};

use mio::net::TcpStream;

use crate::application::Socket;

impl Socket for TcpStream {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        match TcpStream::shutdown(self, Shutdown::Both) {
            // The peer may already be gone.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}
