//! HTTP Upgrade handshake (RFC 6455 §4).
//!
//! # How the opening handshake works (for beginners)
//!
//! A WebSocket connection starts life as a plain HTTP/1.1 request.  The
//! client sends a `GET` with a random 16-byte nonce, base64-encoded, in the
//! `Sec-WebSocket-Key` header:
//!
//! ```text
//! GET /chat HTTP/1.1
//! Host: server.example.com
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Sec-WebSocket-Version: 13
//! ```
//!
//! The server proves it understood the request by appending the fixed GUID
//! `258EAFA5-E914-47DA-95CA-C5AB0DC85B11` to the key, hashing with SHA-1 and
//! base64-encoding the digest:
//!
//! ```text
//! HTTP/1.1 101 Switching Protocols
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=
//! ```
//!
//! After the blank line both sides speak WebSocket frames.  Anything else
//! the server sends (400, 403, ...) ends the exchange and the connection.
//!
//! This module holds both halves: [`negotiate`] for servers and
//! [`ClientHandshake`] for clients.  Neither touches a socket.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::protocol::mask::fill_random;

/// GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this crate speaks.
pub const WEBSOCKET_VERSION: &str = "13";

/// Blank line ending the HTTP header block.
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Default bound on the size of a handshake header block.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 8 * 1024;

const CLIENT_NONCE_LEN: usize = 16;

/// Errors raised while negotiating the opening handshake.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The header terminator has not arrived yet.  Recoverable.
    #[error("incomplete handshake: header terminator not yet received")]
    Incomplete,

    /// The request line or a header line could not be parsed.
    #[error("malformed handshake request: {0}")]
    MalformedRequest(String),

    /// The server's status line or a header line could not be parsed.
    #[error("malformed handshake response: {0}")]
    MalformedResponse(String),

    /// The request carries no `Sec-WebSocket-Key` header.
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,

    /// The header block grew past the configured limit.
    #[error("handshake headers exceed {limit} bytes")]
    HeaderTooLarge { limit: usize },

    /// The server answered with something other than 101.
    #[error("unexpected handshake status {0}")]
    UnexpectedStatus(u16),

    /// The server's accept token does not match the key that was sent.
    #[error("Sec-WebSocket-Accept mismatch: expected {expected}, got {actual}")]
    AcceptMismatch { expected: String, actual: String },

    /// The 101 response carries no `Sec-WebSocket-Accept` header.
    #[error("missing Sec-WebSocket-Accept header")]
    MissingAccept,
}

impl HandshakeError {
    /// The HTTP response a server should send before closing, if any.
    pub fn rejection(&self) -> Option<HandshakeResponse> {
        match self {
            HandshakeError::MissingKey | HandshakeError::MalformedRequest(_) => {
                Some(HandshakeResponse::reject(400, &self.to_string()))
            }
            HandshakeError::HeaderTooLarge { .. } => {
                Some(HandshakeResponse::reject(431, &self.to_string()))
            }
            _ => None,
        }
    }
}

// ── Accept token ──────────────────────────────────────────────────────────────

/// Computes `base64(SHA1(key + GUID))`.
///
/// # Examples
///
/// ```rust
/// use ws_core::protocol::handshake::compute_accept_key;
///
/// assert_eq!(
///     compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Generates a `Sec-WebSocket-Key`: 16 random bytes, base64-encoded.
pub fn generate_client_key() -> String {
    let mut nonce = [0u8; CLIENT_NONCE_LEN];
    fill_random(&mut nonce);
    STANDARD.encode(nonce)
}

/// Returns the length of the header block including its terminator.
pub fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

// ── Headers ───────────────────────────────────────────────────────────────────

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value of `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces every `name` entry with a single one.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.entries.push((name.to_string(), value.into()));
    }

    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.entries.push((name.to_string(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Whether the comma-separated value of `name` contains `token`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.entries {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }

    fn parse_lines<'a>(
        lines: impl Iterator<Item = &'a str>,
        malformed: fn(String) -> HandshakeError,
    ) -> Result<Self, HandshakeError> {
        let mut headers = Headers::new();
        for line in lines.take_while(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| malformed(format!("header line without ':': {line:?}")))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(malformed("empty header name".to_string()));
            }
            headers.append(name, value.trim());
        }
        Ok(headers)
    }
}

fn header_block(raw: &[u8], malformed: fn(String) -> HandshakeError) -> Result<(&str, usize), HandshakeError> {
    let end = find_header_end(raw).ok_or(HandshakeError::Incomplete)?;
    let text = std::str::from_utf8(&raw[..end])
        .map_err(|_| malformed("header block is not valid UTF-8".to_string()))?;
    Ok((text, end))
}

// ── Request ───────────────────────────────────────────────────────────────────

/// An HTTP Upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    method: String,
    path: String,
    version: String,
    headers: Headers,
}

impl HandshakeRequest {
    /// Parses a request from the start of `raw`.
    ///
    /// Returns the request and the number of bytes its header block used.
    ///
    /// # Errors
    ///
    /// [`HandshakeError::Incomplete`] until the blank line arrives;
    /// [`HandshakeError::MalformedRequest`] for unparsable lines.
    pub fn parse(raw: &[u8]) -> Result<(Self, usize), HandshakeError> {
        let (text, consumed) = header_block(raw, HandshakeError::MalformedRequest)?;
        let mut lines = text.split("\r\n");

        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(v), None) => (m, t, v),
            _ => {
                return Err(HandshakeError::MalformedRequest(format!(
                    "bad request line: {request_line:?}"
                )))
            }
        };
        if !version.starts_with("HTTP/") {
            return Err(HandshakeError::MalformedRequest(format!(
                "unsupported protocol: {version:?}"
            )));
        }

        let headers = Headers::parse_lines(lines, HandshakeError::MalformedRequest)?;
        Ok((
            Self {
                method: method.to_string(),
                path: target.to_string(),
                version: version.to_string(),
                headers,
            },
            consumed,
        ))
    }

    /// A client request for `path` on `host`, carrying `key`.
    pub fn client(host: &str, path: &str, key: &str) -> Self {
        let mut headers = Headers::new();
        headers.set("Host", host);
        headers.set("Upgrade", "websocket");
        headers.set("Connection", "Upgrade");
        headers.set("Sec-WebSocket-Key", key);
        headers.set("Sec-WebSocket-Version", WEBSOCKET_VERSION);
        Self {
            method: "GET".to_string(),
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            version: "HTTP/1.1".to_string(),
            headers,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The request target, `/` when the client sent none.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// The non-empty `Sec-WebSocket-Key` value.
    pub fn websocket_key(&self) -> Result<&str, HandshakeError> {
        match self.headers.get("Sec-WebSocket-Key") {
            Some(key) if !key.is_empty() => Ok(key),
            _ => Err(HandshakeError::MissingKey),
        }
    }

    /// Whether `Upgrade: websocket` and `Connection: Upgrade` are present.
    pub fn is_upgrade(&self) -> bool {
        self.headers.has_token("Upgrade", "websocket") && self.headers.has_token("Connection", "upgrade")
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(format!("{} {} {}\r\n", self.method, self.path, self.version).as_bytes());
        self.headers.write_to(&mut out);
        out.extend_from_slice(b"\r\n");
        out
    }
}

// ── Response ──────────────────────────────────────────────────────────────────

/// An HTTP response to an Upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    status: u16,
    reason: String,
    headers: Headers,
    body: Vec<u8>,
}

impl HandshakeResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: reason_phrase(status).to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// `101 Switching Protocols` with the given accept token.
    pub fn switching_protocols(accept_key: &str) -> Self {
        let mut response = Self::new(101);
        response.headers.set("Upgrade", "websocket");
        response.headers.set("Connection", "Upgrade");
        response.headers.set("Sec-WebSocket-Accept", accept_key);
        response
    }

    /// A rejection with a short plain-text body.
    pub fn reject(status: u16, body: &str) -> Self {
        let mut response = Self::new(status);
        response.headers.set("Connection", "close");
        response.set_body("text/plain; charset=utf-8", body.as_bytes().to_vec());
        response
    }

    pub fn bad_request(body: &str) -> Self {
        Self::reject(400, body)
    }

    /// Parses a response from the start of `raw`.
    ///
    /// The body, if any, is not read; the returned length covers the header
    /// block only.
    pub fn parse(raw: &[u8]) -> Result<(Self, usize), HandshakeError> {
        let (text, consumed) = header_block(raw, HandshakeError::MalformedResponse)?;
        let mut lines = text.split("\r\n");

        let status_line = lines.next().unwrap_or_default();
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            return Err(HandshakeError::MalformedResponse(format!(
                "bad status line: {status_line:?}"
            )));
        }
        let status = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| HandshakeError::MalformedResponse(format!("bad status line: {status_line:?}")))?;
        let reason = parts.next().unwrap_or_default().to_string();

        let headers = Headers::parse_lines(lines, HandshakeError::MalformedResponse)?;
        Ok((
            Self {
                status,
                reason,
                headers,
                body: Vec::new(),
            },
            consumed,
        ))
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Changes the status code and resets the reason phrase to match.
    pub fn set_status(&mut self, status: u16) {
        self.status = status;
        self.reason = reason_phrase(status).to_string();
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn is_switching_protocols(&self) -> bool {
        self.status == 101
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Replaces the body and its `Content-Type` / `Content-Length` headers.
    pub fn set_body(&mut self, content_type: &str, body: Vec<u8>) {
        self.headers.set("Content-Type", content_type);
        self.headers.set("Content-Length", body.len().to_string());
        self.body = body;
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).as_bytes());
        self.headers.write_to(&mut out);
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

impl fmt::Display for HandshakeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status, self.reason)
    }
}

/// Standard reason phrase for the statuses a handshake can produce.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        301 => "Moved Permanently",
        302 => "Found",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

// ── Server side ───────────────────────────────────────────────────────────────

/// A parsed request and the draft response the server intends to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    pub request: HandshakeRequest,
    pub response: HandshakeResponse,
    /// Bytes of `buffer` occupied by the request headers.
    pub consumed: usize,
}

/// Reads an Upgrade request from `buffer` and drafts the 101 response.
///
/// # Errors
///
/// - [`HandshakeError::Incomplete`] while the header block is still arriving.
/// - [`HandshakeError::HeaderTooLarge`] once more than `max_header_bytes`
///   have been buffered without a terminator.
/// - [`HandshakeError::MalformedRequest`] / [`HandshakeError::MissingKey`]
///   for requests that can never succeed.  [`HandshakeError::rejection`]
///   gives the response to send for these.
pub fn negotiate(buffer: &[u8], max_header_bytes: usize) -> Result<Negotiation, HandshakeError> {
    match find_header_end(buffer) {
        Some(end) if end > max_header_bytes => {
            return Err(HandshakeError::HeaderTooLarge { limit: max_header_bytes })
        }
        None if buffer.len() > max_header_bytes => {
            return Err(HandshakeError::HeaderTooLarge { limit: max_header_bytes })
        }
        None => return Err(HandshakeError::Incomplete),
        Some(_) => {}
    }

    let (request, consumed) = HandshakeRequest::parse(buffer)?;
    let accept = compute_accept_key(request.websocket_key()?);
    Ok(Negotiation {
        request,
        response: HandshakeResponse::switching_protocols(&accept),
        consumed,
    })
}

// ── Client side ───────────────────────────────────────────────────────────────

/// Client half of the opening handshake.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    key: String,
    request: HandshakeRequest,
}

impl ClientHandshake {
    /// Builds a request for `path` on `host` with a freshly generated key.
    pub fn new(host: &str, path: &str) -> Self {
        Self::with_key(host, path, generate_client_key())
    }

    pub fn with_key(host: &str, path: &str, key: String) -> Self {
        let request = HandshakeRequest::client(host, path, &key);
        Self { key, request }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn request(&self) -> &HandshakeRequest {
        &self.request
    }

    /// Access to the request headers, e.g. to add `Origin`.
    pub fn headers_mut(&mut self) -> &mut Headers {
        self.request.headers_mut()
    }

    pub fn request_bytes(&self) -> Vec<u8> {
        self.request.to_bytes()
    }

    /// Validates the server's answer.
    ///
    /// Returns the response and the number of bytes it used; anything after
    /// that belongs to the frame stream.
    ///
    /// # Errors
    ///
    /// [`HandshakeError::Incomplete`] until the header block is complete;
    /// otherwise a terminal error.
    pub fn verify(&self, buffer: &[u8]) -> Result<(HandshakeResponse, usize), HandshakeError> {
        let (response, consumed) = HandshakeResponse::parse(buffer)?;
        if !response.is_switching_protocols() {
            return Err(HandshakeError::UnexpectedStatus(response.status()));
        }
        let actual = response
            .header("Sec-WebSocket-Accept")
            .ok_or(HandshakeError::MissingAccept)?;
        let expected = compute_accept_key(&self.key);
        if actual != expected {
            return Err(HandshakeError::AcceptMismatch {
                expected,
                actual: actual.to_string(),
            });
        }
        Ok((response, consumed))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
