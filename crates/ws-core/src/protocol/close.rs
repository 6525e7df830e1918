//! Close status codes (RFC 6455 §7.4) and CLOSE frame payloads.
//!
//! A CLOSE payload is either empty, or a 16-bit big-endian status code
//! followed by an optional UTF-8 reason.

use std::fmt;

use crate::protocol::frame::{FrameError, MAX_CONTROL_PAYLOAD};

/// Status code carried by a CLOSE frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000: the purpose of the connection has been fulfilled.
    Normal,
    /// 1001: server shutting down or client navigating away.
    GoingAway,
    /// 1002: the peer violated the framing protocol.
    ProtocolError,
    /// 1003: a data type the endpoint cannot accept.
    UnsupportedData,
    /// 1005: no status code was present.  Never sent on the wire.
    NoStatus,
    /// 1006: connection dropped without a CLOSE frame.  Never sent on the wire.
    Abnormal,
    /// 1007: message data inconsistent with its type (e.g. invalid UTF-8).
    InvalidPayload,
    /// 1008: a policy was violated.
    PolicyViolation,
    /// 1009: a message was too big to process.
    MessageTooBig,
    /// 1011: the server hit an unexpected condition.
    UnexpectedCondition,
    /// Any other code (registered or application-defined).
    Other(u16),
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::UnsupportedData => 1003,
            CloseCode::NoStatus => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::InvalidPayload => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooBig => 1009,
            CloseCode::UnexpectedCondition => 1011,
            CloseCode::Other(code) => code,
        }
    }

    /// Whether this code may appear in a CLOSE frame on the wire.
    pub fn is_sendable(self) -> bool {
        match self.as_u16() {
            1005 | 1006 | 1015 => false,
            1000..=1003 | 1007..=1014 => true,
            3000..=4999 => true,
            _ => false,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::UnsupportedData,
            1005 => CloseCode::NoStatus,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::InvalidPayload,
            1008 => CloseCode::PolicyViolation,
            1009 => CloseCode::MessageTooBig,
            1011 => CloseCode::UnexpectedCondition,
            other => CloseCode::Other(other),
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// A parsed CLOSE payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: CloseCode,
    pub reason: String,
}

/// Builds a CLOSE payload.
///
/// The reason is truncated on a character boundary so the payload fits the
/// 125-byte control frame limit.  Codes that must not be sent produce an
/// empty payload.
pub fn encode_close_payload(code: CloseCode, reason: &str) -> Vec<u8> {
    if !code.is_sendable() {
        return Vec::new();
    }
    let mut reason_len = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
    while !reason.is_char_boundary(reason_len) {
        reason_len -= 1;
    }
    let mut payload = Vec::with_capacity(2 + reason_len);
    payload.extend_from_slice(&code.as_u16().to_be_bytes());
    payload.extend_from_slice(&reason.as_bytes()[..reason_len]);
    payload
}

/// Parses a CLOSE payload.
///
/// Returns `Ok(None)` for an empty payload.
///
/// # Errors
///
/// [`FrameError::InvalidClosePayload`] for a 1-byte payload, a code that
/// must not appear on the wire, or a reason that is not valid UTF-8.
pub fn parse_close_payload(payload: &[u8]) -> Result<Option<CloseFrame>, FrameError> {
    match payload.len() {
        0 => Ok(None),
        1 => Err(FrameError::InvalidClosePayload(
            "status code truncated to one byte".to_string(),
        )),
        _ => {
            let code = CloseCode::from(u16::from_be_bytes([payload[0], payload[1]]));
            if !code.is_sendable() {
                return Err(FrameError::InvalidClosePayload(format!(
                    "status code {code} is not allowed on the wire"
                )));
            }
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|e| FrameError::InvalidClosePayload(format!("reason is not UTF-8: {e}")))?;
            Ok(Some(CloseFrame {
                code,
                reason: reason.to_string(),
            }))
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
