//! The WebSocket client.
//!
//! [`WebSocketClient`] drives one connection over any [`ClientDriver`]:
//!
//! 1. `connect` opens the transport, sends the Upgrade request with a fresh
//!    `Sec-WebSocket-Key` and checks `Sec-WebSocket-Accept` in the reply.
//!    Bytes that arrive behind the 101 response are kept as frame data.
//! 2. `send_text`, `send_binary` and `ping` write single masked frames.
//! 3. `receive` returns the next message.  PINGs are answered on the way,
//!    fragments are reassembled, and a CLOSE from the server is echoed.
//! 4. `close` sends CLOSE and waits (bounded by the configured timeout) for
//!    the server's echo before shutting the transport down.
//!
//! The server must not mask its frames.  A masked frame, a framing error or
//! a bad fragment sequence fails the connection with the matching close
//! code.

use tokio::time;
use tracing::{debug, info, trace, warn};
use ws_core::protocol::close::{encode_close_payload, parse_close_payload, CloseCode, CloseFrame};
use ws_core::protocol::frame::{encode_frame, FrameBuffer, FrameError, Opcode, MAX_CONTROL_PAYLOAD};
use ws_core::protocol::handshake::{
    ClientHandshake, HandshakeError, HandshakeResponse, DEFAULT_MAX_HEADER_BYTES,
};
use ws_core::protocol::message::{AssemblyError, Message, MessageAssembler, MessageKind};

use crate::config::ClientConfig;
use crate::driver::{ClientDriver, TcpDriver};
use crate::error::ClientError;
use crate::url::WsUrl;

/// What [`WebSocketClient::receive`] hands back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Text(String),
    Binary(Vec<u8>),
    /// Answer to one of our pings.
    Pong(Vec<u8>),
    /// The server closed the connection.  `None` when it sent no status.
    Close(Option<CloseFrame>),
}

impl ClientMessage {
    fn from_message(message: Message) -> Result<Self, AssemblyError> {
        match message.kind() {
            MessageKind::Text => String::from_utf8(message.into_payload())
                .map(Self::Text)
                .map_err(|_| AssemblyError::InvalidUtf8),
            MessageKind::Binary => Ok(Self::Binary(message.into_payload())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Idle,
    Open,
    /// We sent CLOSE and wait for the echo.
    Closing,
    Closed,
}

/// A WebSocket connection to one server URL.
#[derive(Debug)]
pub struct WebSocketClient<D = TcpDriver> {
    driver: D,
    config: ClientConfig,
    url: WsUrl,
    state: ClientState,
    frames: FrameBuffer,
    assembler: MessageAssembler,
    read_buf: Vec<u8>,
}

impl WebSocketClient<TcpDriver> {
    /// A client for `url` over plain TCP.  Nothing is opened until
    /// [`connect`](Self::connect).
    ///
    /// # Errors
    ///
    /// [`ClientError::InvalidUrl`] when `url` is not a `ws://` URL.
    pub fn new(url: &str, config: ClientConfig) -> Result<Self, ClientError> {
        Ok(Self::with_driver(WsUrl::parse(url)?, config, TcpDriver::new()))
    }
}

impl<D: ClientDriver> WebSocketClient<D> {
    pub fn with_driver(url: WsUrl, config: ClientConfig, driver: D) -> Self {
        Self {
            frames: FrameBuffer::with_max_payload(config.max_message_bytes as u64),
            assembler: MessageAssembler::new(config.max_message_bytes),
            read_buf: vec![0; config.max_frame_bytes.max(1)],
            driver,
            config,
            url,
            state: ClientState::Idle,
        }
    }

    pub fn url(&self) -> &WsUrl {
        &self.url
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Whether the handshake completed and no CLOSE has been seen or sent.
    pub fn is_open(&self) -> bool {
        self.state == ClientState::Open && self.driver.is_connected()
    }

    // ── Opening handshake ─────────────────────────────────────────────────────

    /// Connects and performs the opening handshake.
    ///
    /// Returns the server's `101` response.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Connect`] / [`ClientError::Timeout`] from the driver.
    /// - [`ClientError::Timeout`] when the full response does not arrive
    ///   within the configured timeout.
    /// - [`ClientError::Handshake`] for a non-101 status or a wrong
    ///   `Sec-WebSocket-Accept`.
    pub async fn connect(&mut self) -> Result<HandshakeResponse, ClientError> {
        let handshake = self.build_handshake();
        let timeout = self.config.timeout;

        self.driver
            .connect(self.url.host(), self.url.port(), timeout)
            .await?;

        let reply = exchange(&mut self.driver, &handshake, &mut self.read_buf);
        let outcome = match time::timeout(timeout, reply).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ClientError::Timeout {
                operation: "handshake",
                after: timeout,
            }),
        };

        match outcome {
            Ok((response, leftover)) => {
                self.frames.clear();
                self.frames.extend(&leftover);
                self.assembler = MessageAssembler::new(self.config.max_message_bytes);
                self.state = ClientState::Open;
                info!(url = %self.url, "WebSocket connection open");
                Ok(response)
            }
            Err(e) => {
                warn!(url = %self.url, "handshake failed: {e}");
                self.state = ClientState::Closed;
                self.shutdown_transport().await;
                Err(e)
            }
        }
    }

    fn build_handshake(&self) -> ClientHandshake {
        let mut handshake = ClientHandshake::new(&self.url.host_header(), self.url.path());
        let headers = handshake.headers_mut();
        headers.set("User-Agent", self.config.user_agent.as_str());
        if let Some(origin) = &self.config.origin {
            headers.set("Origin", origin.as_str());
        }
        if let Some(authorization) = self.url.authorization() {
            headers.set("Authorization", authorization);
        }
        for (name, value) in &self.config.headers {
            headers.append(name, value.as_str());
        }
        handshake
    }

    // ── Sending ───────────────────────────────────────────────────────────────

    pub async fn send_text(&mut self, text: &str) -> Result<(), ClientError> {
        self.send_frame(Opcode::Text, text.as_bytes()).await
    }

    pub async fn send_binary(&mut self, data: &[u8]) -> Result<(), ClientError> {
        self.send_frame(Opcode::Binary, data).await
    }

    /// Sends a PING.  The answer arrives through [`receive`](Self::receive)
    /// as [`ClientMessage::Pong`].
    pub async fn ping(&mut self, payload: &[u8]) -> Result<(), ClientError> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(FrameError::ControlFrameTooLarge(payload.len() as u64).into());
        }
        self.send_frame(Opcode::Ping, payload).await
    }

    async fn send_frame(&mut self, opcode: Opcode, payload: &[u8]) -> Result<(), ClientError> {
        self.ensure_open()?;
        let bytes = encode_frame(payload, opcode, true);
        trace!(?opcode, bytes = bytes.len(), "sending frame");
        self.driver.send(&bytes).await
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        match self.state {
            ClientState::Open => Ok(()),
            ClientState::Idle => Err(ClientError::NotConnected),
            ClientState::Closing | ClientState::Closed => Err(ClientError::Closed),
        }
    }

    // ── Receiving ─────────────────────────────────────────────────────────────

    /// Waits for the next message from the server.
    ///
    /// # Errors
    ///
    /// [`ClientError::Closed`] once the connection is gone, including when
    /// the server drops the stream without a CLOSE frame.  Framing and
    /// fragmentation errors fail the connection and are returned as well.
    pub async fn receive(&mut self) -> Result<ClientMessage, ClientError> {
        if self.state == ClientState::Idle {
            return Err(ClientError::NotConnected);
        }
        loop {
            if let Some(message) = self.drain_frames().await? {
                return Ok(message);
            }
            if self.state == ClientState::Closed {
                return Err(ClientError::Closed);
            }

            let n = self.driver.receive(&mut self.read_buf).await?;
            if n == 0 {
                debug!(url = %self.url, "server closed the stream");
                self.state = ClientState::Closed;
                self.shutdown_transport().await;
                return Err(ClientError::Closed);
            }
            self.frames.extend(&self.read_buf[..n]);
        }
    }

    /// Processes buffered frames until one produces a message.
    async fn drain_frames(&mut self) -> Result<Option<ClientMessage>, ClientError> {
        loop {
            let frame = match self.frames.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(None),
                Err(e) => {
                    let code = match e {
                        FrameError::PayloadTooLarge { .. } => CloseCode::MessageTooBig,
                        _ => CloseCode::ProtocolError,
                    };
                    self.fail(code).await;
                    return Err(e.into());
                }
            };

            if frame.is_masked() {
                self.fail(CloseCode::ProtocolError).await;
                return Err(ClientError::Protocol("server sent a masked frame".to_string()));
            }

            match frame.opcode() {
                Opcode::Ping => {
                    if self.state == ClientState::Open {
                        let pong = encode_frame(frame.payload(), Opcode::Pong, true);
                        self.driver.send(&pong).await?;
                    }
                }
                Opcode::Pong => return Ok(Some(ClientMessage::Pong(frame.into_payload()))),
                Opcode::Close => return self.on_close_frame(frame.payload()).await.map(Some),
                _ if self.state != ClientState::Open => {
                    trace!("discarding data frame while closing");
                }
                _ => match self.assembler.push(frame) {
                    Ok(Some(message)) => match ClientMessage::from_message(message) {
                        Ok(message) => return Ok(Some(message)),
                        Err(e) => {
                            self.fail(e.close_code()).await;
                            return Err(e.into());
                        }
                    },
                    Ok(None) => {}
                    Err(e) => {
                        self.fail(e.close_code()).await;
                        return Err(e.into());
                    }
                },
            }
        }
    }

    async fn on_close_frame(&mut self, payload: &[u8]) -> Result<ClientMessage, ClientError> {
        let close = match parse_close_payload(payload) {
            Ok(close) => close,
            Err(e) => {
                self.fail(CloseCode::ProtocolError).await;
                return Err(e.into());
            }
        };

        if self.state == ClientState::Open {
            let code = close.as_ref().map_or(CloseCode::Normal, |c| c.code);
            self.write_close(code, "").await;
        }
        info!(
            url = %self.url,
            code = close.as_ref().map(|c| c.code.as_u16()),
            "connection closed by server"
        );
        self.state = ClientState::Closed;
        self.shutdown_transport().await;
        Ok(ClientMessage::Close(close))
    }

    // ── Closing ───────────────────────────────────────────────────────────────

    pub async fn close(&mut self, code: CloseCode) -> Result<(), ClientError> {
        self.close_with_reason(code, "").await
    }

    /// Starts the closing handshake.
    ///
    /// Waits up to the configured timeout for the server's CLOSE, discarding
    /// any data that arrives first, then shuts the transport down.  Closing
    /// an unopened or closed client only releases the transport.
    pub async fn close_with_reason(&mut self, code: CloseCode, reason: &str) -> Result<(), ClientError> {
        if self.state != ClientState::Open {
            self.state = ClientState::Closed;
            return self.driver.close().await;
        }

        let bytes = encode_frame(&encode_close_payload(code, reason), Opcode::Close, true);
        if let Err(e) = self.driver.send(&bytes).await {
            self.state = ClientState::Closed;
            self.shutdown_transport().await;
            return Err(e);
        }
        self.state = ClientState::Closing;

        let timeout = self.config.timeout;
        match time::timeout(timeout, self.await_close_echo()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(url = %self.url, "closing handshake ended early: {e}"),
            Err(_) => debug!(url = %self.url, "server did not answer CLOSE within {timeout:?}"),
        }

        self.state = ClientState::Closed;
        self.driver.close().await
    }

    async fn await_close_echo(&mut self) -> Result<(), ClientError> {
        loop {
            if let ClientMessage::Close(_) = self.receive().await? {
                return Ok(());
            }
        }
    }

    // ── Failure paths ─────────────────────────────────────────────────────────

    async fn fail(&mut self, code: CloseCode) {
        warn!(url = %self.url, %code, "failing connection");
        if self.state == ClientState::Open {
            self.write_close(code, "").await;
        }
        self.state = ClientState::Closed;
        self.shutdown_transport().await;
    }

    async fn write_close(&mut self, code: CloseCode, reason: &str) {
        let bytes = encode_frame(&encode_close_payload(code, reason), Opcode::Close, true);
        if let Err(e) = self.driver.send(&bytes).await {
            debug!(url = %self.url, "failed to send CLOSE: {e}");
        }
    }

    async fn shutdown_transport(&mut self) {
        if let Err(e) = self.driver.close().await {
            debug!(url = %self.url, "transport shutdown failed: {e}");
        }
    }
}

/// Sends the Upgrade request and reads until the response header block is
/// complete.  Returns the response and whatever followed it.
async fn exchange<D: ClientDriver>(
    driver: &mut D,
    handshake: &ClientHandshake,
    chunk: &mut [u8],
) -> Result<(HandshakeResponse, Vec<u8>), ClientError> {
    driver.send(&handshake.request_bytes()).await?;

    let mut buffer = Vec::new();
    loop {
        match handshake.verify(&buffer) {
            Ok((response, consumed)) => {
                buffer.drain(..consumed);
                return Ok((response, buffer));
            }
            Err(HandshakeError::Incomplete) => {}
            Err(e) => return Err(e.into()),
        }
        if buffer.len() > DEFAULT_MAX_HEADER_BYTES {
            return Err(HandshakeError::HeaderTooLarge {
                limit: DEFAULT_MAX_HEADER_BYTES,
            }
            .into());
        }

        let n = driver.receive(chunk).await?;
        if n == 0 {
            return Err(ClientError::Closed);
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
