//! # ws-client
//!
//! WebSocket client built on the `ws-core` protocol engine.
//!
//! - **`driver`** – the [`ClientDriver`] capability interface
//!   (connect, send, receive, close, is_connected) and [`TcpDriver`], the
//!   tokio implementation.  Other transports plug in behind the same trait.
//! - **`url`** – `ws://host:port/path` parsing.
//! - **`client`** – [`WebSocketClient`]: the opening handshake, masked
//!   writes, and a receive path that answers pings and reassembles
//!   fragmented messages.
//!
//! ```rust,no_run
//! use ws_client::{ClientConfig, ClientMessage, WebSocketClient};
//!
//! # async fn demo() -> Result<(), ws_client::ClientError> {
//! let mut client = WebSocketClient::new("ws://127.0.0.1:8080/chat", ClientConfig::default())?;
//! client.connect().await?;
//! client.send_text("hello").await?;
//! if let ClientMessage::Text(reply) = client.receive().await? {
//!     println!("{reply}");
//! }
//! client.close(ws_core::CloseCode::Normal).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod url;

pub use client::{ClientMessage, WebSocketClient};
pub use config::ClientConfig;
pub use driver::{ClientDriver, TcpDriver};
pub use error::ClientError;
pub use url::WsUrl;
