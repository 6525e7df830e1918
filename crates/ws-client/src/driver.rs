//! Transport drivers for the WebSocket client.
//!
//! [`ClientDriver`] is the capability interface the client is written
//! against: connect, send, receive, close and is_connected.  It moves raw
//! bytes only; framing and the handshake live in
//! [`WebSocketClient`](crate::WebSocketClient).  [`TcpDriver`] is the
//! production implementation.  A TLS-wrapped transport would be another
//! implementation of the same trait.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::debug;

use crate::error::ClientError;

/// Byte transport underneath a WebSocket client.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClientDriver: Send {
    /// Opens the transport to `host:port`, giving up after `timeout`.
    async fn connect(&mut self, host: &str, port: u16, timeout: Duration)
        -> Result<(), ClientError>;

    /// Writes all of `bytes`.
    async fn send(&mut self, bytes: &[u8]) -> Result<(), ClientError>;

    /// Reads into `buf`, returning the number of bytes read.  `Ok(0)` means
    /// the peer closed the stream.
    async fn receive(&mut self, buf: &mut [u8]) -> Result<usize, ClientError>;

    /// Shuts the transport down.  Closing an unconnected driver is a no-op.
    async fn close(&mut self) -> Result<(), ClientError>;

    fn is_connected(&self) -> bool;
}

/// Plain TCP driver on tokio.
#[derive(Debug, Default)]
pub struct TcpDriver {
    stream: Option<TcpStream>,
}

impl TcpDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream(&mut self) -> Result<&mut TcpStream, ClientError> {
        self.stream.as_mut().ok_or(ClientError::NotConnected)
    }
}

#[async_trait]
impl ClientDriver for TcpDriver {
    async fn connect(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let addr = format!("{host}:{port}");
        let stream = match time::timeout(timeout, TcpStream::connect((host, port))).await {
            Err(_) => {
                return Err(ClientError::Timeout {
                    operation: "connect",
                    after: timeout,
                })
            }
            Ok(Err(source)) => return Err(ClientError::Connect { addr, source }),
            Ok(Ok(stream)) => stream,
        };
        stream.set_nodelay(true)?;
        debug!(%addr, "TCP connection established");
        self.stream = Some(stream);
        Ok(())
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.stream()?.write_all(bytes).await?;
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8]) -> Result<usize, ClientError> {
        Ok(self.stream()?.read(buf).await?)
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        match stream.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_send_and_receive_over_loopback() {
        // Arrange
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });
        let mut driver = TcpDriver::new();

        // Act
        driver
            .connect("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap();
        driver.send(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let n = driver.receive(&mut buf).await.unwrap();

        // Assert
        assert!(driver.is_connected());
        assert_eq!(&buf[..n], b"hello");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_reports_address() {
        // Arrange: grab a free port, then release it
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let mut driver = TcpDriver::new();

        // Act
        let result = driver.connect("127.0.0.1", port, Duration::from_secs(1)).await;

        // Assert
        match result {
            Err(ClientError::Connect { addr, .. }) => assert_eq!(addr, format!("127.0.0.1:{port}")),
            other => panic!("expected Connect error, got {other:?}"),
        }
        assert!(!driver.is_connected());
    }

    #[tokio::test]
    async fn test_unconnected_driver() {
        let mut driver = TcpDriver::new();
        assert!(matches!(driver.send(b"x").await, Err(ClientError::NotConnected)));
        assert!(matches!(
            driver.receive(&mut [0u8; 4]).await,
            Err(ClientError::NotConnected)
        ));
        assert!(driver.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_releases_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut driver = TcpDriver::new();
        driver
            .connect("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap();
        let _accepted = listener.accept().await.unwrap();

        driver.close().await.unwrap();

        assert!(!driver.is_connected());
    }
}
