//! WebSocket frame codec (RFC 6455 §5.2).
//!
//! Wire format:
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |            (16/64)            |
//! |N|V|V|V|       |S|             |  (if payload len == 126/127)  |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |  Extended payload length continued, if payload len == 127     |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               | Masking-key, if MASK set to 1 |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```
//! All multi-byte integers are big-endian.
//!
//! # Length tiers
//!
//! | Payload length      | 7-bit field | Extended field      |
//! |---------------------|-------------|---------------------|
//! | 0 ..= 125           | the length  | none                |
//! | 126 ..= 65 535      | 126         | 16-bit length       |
//! | 65 536 ..= 2^63 - 1 | 127         | 64-bit length       |
//!
//! A length written in a wider tier than necessary is rejected as
//! [`FrameError::InconsistentLength`].
//!
//! # Incremental decoding
//!
//! Bytes arrive from the network in arbitrary chunks.  [`FrameView`] reads
//! header fields lazily out of whatever has been buffered so far: each
//! accessor returns [`FrameError::NeedMoreData`] when the bytes it depends
//! on are not there yet, and never reads out of bounds.  [`FrameBuffer`]
//! builds on this to accumulate chunks and hand out complete frames, caching
//! the parsed header so it is computed once per frame.

use thiserror::Error;

use crate::protocol::mask::{apply_mask, generate_mask_key, MaskKey, MASK_KEY_LEN};

/// Size of the fixed part of every frame header.
pub const BASE_HEADER_LEN: usize = 2;

/// Largest possible header: base + 64-bit length + mask key.
pub const MAX_HEADER_LEN: usize = BASE_HEADER_LEN + 8 + MASK_KEY_LEN;

/// Control frames (CLOSE, PING, PONG) may carry at most this many bytes.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

const FIN_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const OPCODE_BITS: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LENGTH_BITS: u8 = 0x7F;
const LENGTH_16: u8 = 126;
const LENGTH_64: u8 = 127;

/// Errors that can occur while encoding or decoding frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Not enough bytes are buffered to answer the question asked.
    ///
    /// This is the only recoverable variant: wait for more bytes and retry.
    #[error("need more data: at least {needed} bytes required, {available} buffered")]
    NeedMoreData { needed: usize, available: usize },

    /// The opcode nibble is one of the reserved values 0x3–0x7 or 0xB–0xF.
    #[error("invalid opcode: 0x{0:X}")]
    InvalidOpcode(u8),

    /// RSV1–RSV3 are non-zero but no extension has been negotiated.
    #[error("reserved bits set without a negotiated extension: 0b{0:03b}")]
    ReservedBitsSet(u8),

    /// The extended length field holds a value that belongs in a narrower
    /// tier, or has its most significant bit set.
    #[error("inconsistent payload length {length} in {width}-bit extended field")]
    InconsistentLength { length: u64, width: u8 },

    /// A control frame declared a payload above 125 bytes.
    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlFrameTooLarge(u64),

    /// A control frame arrived without the FIN bit.
    #[error("control frame {0:?} must not be fragmented")]
    FragmentedControlFrame(Opcode),

    /// The declared payload exceeds the configured or addressable limit.
    #[error("payload of {length} bytes exceeds limit of {limit}")]
    PayloadTooLarge { length: u64, limit: u64 },

    /// The mask key was requested from a frame whose MASK bit is clear.
    #[error("frame is not masked")]
    MaskUnavailable,

    /// A CLOSE frame payload is one byte long, carries a code that must not
    /// appear on the wire, or has a reason that is not UTF-8.
    #[error("invalid close payload: {0}")]
    InvalidClosePayload(String),
}

impl FrameError {
    /// Returns `true` for [`FrameError::NeedMoreData`].
    pub fn is_need_more_data(&self) -> bool {
        matches!(self, FrameError::NeedMoreData { .. })
    }
}

// ── Opcode ────────────────────────────────────────────────────────────────────

/// Frame opcode (RFC 6455 §5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Decodes the low nibble of the first header byte.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidOpcode`] for reserved values.
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(FrameError::InvalidOpcode(other)),
        }
    }

    /// Returns the wire value of this opcode.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// CLOSE, PING and PONG.
    pub fn is_control(self) -> bool {
        self.as_u8() & 0x08 != 0
    }

    /// CONTINUATION, TEXT and BINARY.
    pub fn is_data(self) -> bool {
        !self.is_control()
    }
}

impl TryFrom<u8> for Opcode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Opcode::from_u8(value)
    }
}

// ── Frame ─────────────────────────────────────────────────────────────────────

/// One decoded (or to-be-encoded) WebSocket frame.
///
/// The payload is always held unmasked.  The mask key, when present, is
/// applied on encode and was already removed on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    final_fragment: bool,
    reserved: u8,
    opcode: Opcode,
    mask_key: Option<MaskKey>,
    payload: Vec<u8>,
}

impl Frame {
    /// A final, unmasked frame.
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            final_fragment: true,
            reserved: 0,
            opcode,
            mask_key: None,
            payload: payload.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Opcode::Text, text.into().into_bytes())
    }

    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Binary, data)
    }

    pub fn ping(data: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Ping, data)
    }

    pub fn pong(data: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Pong, data)
    }

    /// A CLOSE frame carrying `code` and a UTF-8 `reason`.
    pub fn close(code: crate::protocol::close::CloseCode, reason: &str) -> Self {
        Self::new(
            Opcode::Close,
            crate::protocol::close::encode_close_payload(code, reason),
        )
    }

    /// Sets the FIN bit.
    pub fn with_final(mut self, final_fragment: bool) -> Self {
        self.final_fragment = final_fragment;
        self
    }

    /// Masks the frame with `key` when encoded.
    pub fn with_mask(mut self, key: MaskKey) -> Self {
        self.mask_key = Some(key);
        self
    }

    pub fn is_final(&self) -> bool {
        self.final_fragment
    }

    /// RSV1–RSV3 as a 3-bit value.  Always zero for decoded frames.
    pub fn reserved(&self) -> u8 {
        self.reserved
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn is_masked(&self) -> bool {
        self.mask_key.is_some()
    }

    pub fn mask_key(&self) -> Option<MaskKey> {
        self.mask_key
    }

    /// Logical payload length; always equal to `payload().len()`.
    pub fn length(&self) -> u64 {
        self.payload.len() as u64
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Serializes the frame to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        write_frame(
            self.final_fragment,
            self.reserved,
            self.opcode,
            self.mask_key,
            &self.payload,
        )
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes `payload` as a single final frame.
///
/// When `masked` is true a fresh key is drawn from
/// [`generate_mask_key`](crate::protocol::mask::generate_mask_key).
///
/// # Examples
///
/// ```rust
/// use ws_core::protocol::frame::{decode_frame, encode_frame, Opcode};
///
/// let bytes = encode_frame(b"Hello", Opcode::Text, false);
/// assert_eq!(bytes, [0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);
///
/// let (frame, consumed) = decode_frame(&bytes).unwrap();
/// assert_eq!(frame.payload(), b"Hello");
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_frame(payload: &[u8], opcode: Opcode, masked: bool) -> Vec<u8> {
    let key = masked.then(generate_mask_key);
    encode_frame_with_key(payload, opcode, key)
}

/// Encodes `payload` with a caller-supplied mask key (or none).
pub fn encode_frame_with_key(payload: &[u8], opcode: Opcode, key: Option<MaskKey>) -> Vec<u8> {
    write_frame(true, 0, opcode, key, payload)
}

/// Number of header bytes needed for a payload of `payload_len` bytes.
pub fn header_len(payload_len: usize, masked: bool) -> usize {
    let extended = if payload_len <= MAX_CONTROL_PAYLOAD {
        0
    } else if payload_len <= usize::from(u16::MAX) {
        2
    } else {
        8
    };
    BASE_HEADER_LEN + extended + if masked { MASK_KEY_LEN } else { 0 }
}

/// Decodes one frame from the beginning of `bytes`.
///
/// Returns the frame and the number of bytes it occupied.
///
/// # Errors
///
/// Returns [`FrameError::NeedMoreData`] if `bytes` holds only part of a
/// frame, and a protocol variant if the header is malformed.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameError> {
    let header = FrameView::new(bytes).header()?;
    if bytes.len() < header.frame_len {
        return Err(FrameError::NeedMoreData {
            needed: header.frame_len,
            available: bytes.len(),
        });
    }
    let frame = header.to_frame(&bytes[header.payload_offset..header.frame_len]);
    Ok((frame, header.frame_len))
}

// ── Lazy header view ──────────────────────────────────────────────────────────

/// Read-only lazy view over the start of a possibly incomplete frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    bytes: &'a [u8],
}

impl<'a> FrameView<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn require(&self, needed: usize) -> Result<(), FrameError> {
        if self.bytes.len() < needed {
            Err(FrameError::NeedMoreData {
                needed,
                available: self.bytes.len(),
            })
        } else {
            Ok(())
        }
    }

    pub fn is_final(&self) -> Result<bool, FrameError> {
        self.require(1)?;
        Ok(self.bytes[0] & FIN_BIT != 0)
    }

    pub fn reserved_bits(&self) -> Result<u8, FrameError> {
        self.require(1)?;
        Ok((self.bytes[0] & RSV_BITS) >> 4)
    }

    pub fn opcode(&self) -> Result<Opcode, FrameError> {
        self.require(1)?;
        Opcode::from_u8(self.bytes[0] & OPCODE_BITS)
    }

    pub fn is_masked(&self) -> Result<bool, FrameError> {
        self.require(BASE_HEADER_LEN)?;
        Ok(self.bytes[1] & MASK_BIT != 0)
    }

    /// The raw 7-bit length field.
    pub fn initial_length(&self) -> Result<u8, FrameError> {
        self.require(BASE_HEADER_LEN)?;
        Ok(self.bytes[1] & LENGTH_BITS)
    }

    /// Size of the extended length field: 0, 2 or 8 bytes.
    pub fn length_size(&self) -> Result<usize, FrameError> {
        Ok(match self.initial_length()? {
            LENGTH_16 => 2,
            LENGTH_64 => 8,
            _ => 0,
        })
    }

    /// Offset of the mask key (or of the payload, when unmasked).
    pub fn mask_offset(&self) -> Result<usize, FrameError> {
        Ok(BASE_HEADER_LEN + self.length_size()?)
    }

    /// The declared payload length.
    ///
    /// # Errors
    ///
    /// [`FrameError::NeedMoreData`] until the extended field is buffered;
    /// [`FrameError::InconsistentLength`] for non-minimal encodings.
    pub fn payload_length(&self) -> Result<u64, FrameError> {
        match self.initial_length()? {
            LENGTH_16 => {
                self.require(BASE_HEADER_LEN + 2)?;
                let length = u64::from(u16::from_be_bytes([self.bytes[2], self.bytes[3]]));
                if length <= MAX_CONTROL_PAYLOAD as u64 {
                    return Err(FrameError::InconsistentLength { length, width: 16 });
                }
                Ok(length)
            }
            LENGTH_64 => {
                self.require(BASE_HEADER_LEN + 8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&self.bytes[BASE_HEADER_LEN..BASE_HEADER_LEN + 8]);
                let length = u64::from_be_bytes(raw);
                if length <= u64::from(u16::MAX) || length >> 63 != 0 {
                    return Err(FrameError::InconsistentLength { length, width: 64 });
                }
                Ok(length)
            }
            literal => Ok(u64::from(literal)),
        }
    }

    /// The 4-byte mask key.
    ///
    /// # Errors
    ///
    /// [`FrameError::MaskUnavailable`] for unmasked frames, otherwise
    /// [`FrameError::NeedMoreData`] until the key is buffered.
    pub fn mask_key(&self) -> Result<MaskKey, FrameError> {
        if !self.is_masked()? {
            return Err(FrameError::MaskUnavailable);
        }
        let offset = self.mask_offset()?;
        self.require(offset + MASK_KEY_LEN)?;
        let mut key = [0u8; MASK_KEY_LEN];
        key.copy_from_slice(&self.bytes[offset..offset + MASK_KEY_LEN]);
        Ok(key)
    }

    /// Offset of the first payload byte.
    pub fn payload_offset(&self) -> Result<usize, FrameError> {
        let mask_len = if self.is_masked()? { MASK_KEY_LEN } else { 0 };
        Ok(self.mask_offset()? + mask_len)
    }

    /// Total number of bytes the frame occupies on the wire.
    pub fn frame_length(&self) -> Result<usize, FrameError> {
        let payload_len = addressable(self.payload_length()?)?;
        self.payload_offset()?
            .checked_add(payload_len)
            .ok_or(FrameError::PayloadTooLarge {
                length: payload_len as u64,
                limit: usize::MAX as u64,
            })
    }

    /// Parses and validates the complete header.
    ///
    /// Checks are ordered so that a malformed first byte is reported as soon
    /// as it arrives rather than after the rest of the header.
    pub fn header(&self) -> Result<FrameHeader, FrameError> {
        let reserved = self.reserved_bits()?;
        if reserved != 0 {
            return Err(FrameError::ReservedBitsSet(reserved));
        }
        let opcode = self.opcode()?;
        let final_fragment = self.is_final()?;
        if opcode.is_control() && !final_fragment {
            return Err(FrameError::FragmentedControlFrame(opcode));
        }

        let payload_len = self.payload_length()?;
        if opcode.is_control() && payload_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(FrameError::ControlFrameTooLarge(payload_len));
        }

        let mask_key = if self.is_masked()? {
            Some(self.mask_key()?)
        } else {
            None
        };

        Ok(FrameHeader {
            final_fragment,
            opcode,
            mask_key,
            payload_len,
            payload_offset: self.payload_offset()?,
            frame_len: self.frame_length()?,
        })
    }
}

/// A fully parsed and validated frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub final_fragment: bool,
    pub opcode: Opcode,
    pub mask_key: Option<MaskKey>,
    pub payload_len: u64,
    pub payload_offset: usize,
    pub frame_len: usize,
}

impl FrameHeader {
    fn to_frame(&self, raw_payload: &[u8]) -> Frame {
        let mut payload = raw_payload.to_vec();
        if let Some(key) = self.mask_key {
            apply_mask(&mut payload, key);
        }
        Frame {
            final_fragment: self.final_fragment,
            reserved: 0,
            opcode: self.opcode,
            mask_key: self.mask_key,
            payload,
        }
    }
}

// ── Streaming buffer ──────────────────────────────────────────────────────────

/// Accumulates received bytes and yields complete frames in arrival order.
///
/// # Examples
///
/// ```rust
/// use ws_core::protocol::frame::{encode_frame, FrameBuffer, Opcode};
///
/// let bytes = encode_frame(b"hi", Opcode::Text, true);
/// let mut buffer = FrameBuffer::new();
///
/// buffer.extend(&bytes[..3]);
/// assert!(buffer.next_frame().unwrap().is_none());
///
/// buffer.extend(&bytes[3..]);
/// let frame = buffer.next_frame().unwrap().unwrap();
/// assert_eq!(frame.payload(), b"hi");
/// ```
#[derive(Debug, Default)]
pub struct FrameBuffer {
    bytes: Vec<u8>,
    header: Option<FrameHeader>,
    max_payload: Option<u64>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A buffer that rejects frames declaring more than `limit` payload bytes
    /// as soon as their length is known.
    pub fn with_max_payload(limit: u64) -> Self {
        Self {
            max_payload: Some(limit),
            ..Self::default()
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    /// Number of buffered bytes not yet consumed as frames.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Lazy view over the frame currently being assembled.
    pub fn view(&self) -> FrameView<'_> {
        FrameView::new(&self.bytes)
    }

    /// Wire length of the frame being assembled, once its header is known.
    pub fn pending_frame_len(&self) -> Option<usize> {
        self.header.map(|h| h.frame_len)
    }

    /// Removes and returns all buffered bytes.
    pub fn take_remaining(&mut self) -> Vec<u8> {
        self.header = None;
        std::mem::take(&mut self.bytes)
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
        self.header = None;
    }

    /// Returns the next complete frame, or `Ok(None)` if more bytes are
    /// needed.
    ///
    /// # Errors
    ///
    /// Any [`FrameError`] other than `NeedMoreData`.  The buffer contents are
    /// unspecified afterwards; the connection should be closed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let header = match self.header {
            Some(header) => header,
            None => match self.view().header() {
                Ok(header) => {
                    if let Some(limit) = self.max_payload {
                        if header.payload_len > limit {
                            return Err(FrameError::PayloadTooLarge {
                                length: header.payload_len,
                                limit,
                            });
                        }
                    }
                    self.header = Some(header);
                    header
                }
                Err(e) if e.is_need_more_data() => return Ok(None),
                Err(e) => return Err(e),
            },
        };

        if self.bytes.len() < header.frame_len {
            return Ok(None);
        }

        let frame = header.to_frame(&self.bytes[header.payload_offset..header.frame_len]);
        self.bytes.drain(..header.frame_len);
        self.header = None;
        Ok(Some(frame))
    }
}

// ── Utility helpers ───────────────────────────────────────────────────────────

fn addressable(length: u64) -> Result<usize, FrameError> {
    usize::try_from(length).map_err(|_| FrameError::PayloadTooLarge {
        length,
        limit: usize::MAX as u64,
    })
}

fn write_frame(
    final_fragment: bool,
    reserved: u8,
    opcode: Opcode,
    key: Option<MaskKey>,
    payload: &[u8],
) -> Vec<u8> {
    let len = payload.len();
    let mut buf = Vec::with_capacity(header_len(len, key.is_some()) + len);

    let fin = if final_fragment { FIN_BIT } else { 0 };
    buf.push(fin | ((reserved << 4) & RSV_BITS) | opcode.as_u8());

    let mask = if key.is_some() { MASK_BIT } else { 0 };
    if len <= MAX_CONTROL_PAYLOAD {
        buf.push(mask | len as u8);
    } else if len <= usize::from(u16::MAX) {
        buf.push(mask | LENGTH_16);
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        buf.push(mask | LENGTH_64);
        buf.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match key {
        Some(key) => {
            buf.extend_from_slice(&key);
            let start = buf.len();
            buf.extend_from_slice(payload);
            apply_mask(&mut buf[start..], key);
        }
        None => buf.extend_from_slice(payload),
    }
    buf
}

// ── Tests ─────────────────────────────────────────────────────────────────────
