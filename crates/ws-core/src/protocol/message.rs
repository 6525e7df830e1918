//! Reassembly of data frames into messages (RFC 6455 §5.4).
//!
//! A message is a TEXT or BINARY frame, optionally followed by CONTINUATION
//! frames, ending at the first frame with FIN set.  Control frames may be
//! interleaved with the fragments; they are handled by the caller and never
//! reach the assembler.

use thiserror::Error;

use crate::protocol::close::CloseCode;
use crate::protocol::frame::{Frame, Opcode};

/// Whether a message carries UTF-8 text or arbitrary bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    Binary,
}

impl MessageKind {
    pub fn opcode(self) -> Opcode {
        match self {
            MessageKind::Text => Opcode::Text,
            MessageKind::Binary => Opcode::Binary,
        }
    }
}

/// A complete application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageKind,
    payload: Vec<u8>,
}

impl Message {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            payload: text.into().into_bytes(),
        }
    }

    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: MessageKind::Binary,
            payload: data.into(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn is_text(&self) -> bool {
        self.kind == MessageKind::Text
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// The payload as text.  `None` for binary messages.
    pub fn as_text(&self) -> Option<&str> {
        match self.kind {
            MessageKind::Text => std::str::from_utf8(&self.payload).ok(),
            MessageKind::Binary => None,
        }
    }
}

/// Violations detected while reassembling fragments.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,

    #[error("new data frame while a fragmented message is in progress")]
    ExpectedContinuation,

    #[error("message of {size} bytes exceeds limit of {limit}")]
    MessageTooBig { size: usize, limit: usize },

    #[error("text message is not valid UTF-8")]
    InvalidUtf8,

    #[error("{0:?} is not a data frame")]
    NotDataFrame(Opcode),
}

impl AssemblyError {
    /// Close code to send when this error ends a connection.
    pub fn close_code(&self) -> CloseCode {
        match self {
            AssemblyError::MessageTooBig { .. } => CloseCode::MessageTooBig,
            AssemblyError::InvalidUtf8 => CloseCode::InvalidPayload,
            _ => CloseCode::ProtocolError,
        }
    }
}

/// Collects fragments of one message at a time.
#[derive(Debug)]
pub struct MessageAssembler {
    pending: Option<(MessageKind, Vec<u8>)>,
    limit: usize,
}

impl MessageAssembler {
    /// An assembler that rejects messages larger than `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self { pending: None, limit }
    }

    /// Whether a fragmented message is in progress.
    pub fn is_assembling(&self) -> bool {
        self.pending.is_some()
    }

    /// Feeds one data frame.
    ///
    /// Returns the finished message when `frame` carries FIN.  Any error
    /// discards the message in progress.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>, AssemblyError> {
        let final_fragment = frame.is_final();
        let (kind, mut buffer) = match (frame.opcode(), self.pending.take()) {
            (Opcode::Continuation, Some(pending)) => pending,
            (Opcode::Continuation, None) => return Err(AssemblyError::UnexpectedContinuation),
            (Opcode::Text | Opcode::Binary, Some(_)) => {
                return Err(AssemblyError::ExpectedContinuation)
            }
            (Opcode::Text, None) => (MessageKind::Text, Vec::new()),
            (Opcode::Binary, None) => (MessageKind::Binary, Vec::new()),
            (other, pending) => {
                self.pending = pending;
                return Err(AssemblyError::NotDataFrame(other));
            }
        };

        let size = buffer.len() + frame.payload().len();
        if size > self.limit {
            return Err(AssemblyError::MessageTooBig {
                size,
                limit: self.limit,
            });
        }
        if buffer.is_empty() {
            buffer = frame.into_payload();
        } else {
            buffer.extend_from_slice(frame.payload());
        }

        if !final_fragment {
            self.pending = Some((kind, buffer));
            return Ok(None);
        }

        if kind == MessageKind::Text && std::str::from_utf8(&buffer).is_err() {
            return Err(AssemblyError::InvalidUtf8);
        }
        Ok(Some(Message {
            kind,
            payload: buffer,
        }))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_frame_message() {
        let mut assembler = MessageAssembler::new(1024);
        let message = assembler.push(Frame::text("hello")).unwrap().unwrap();
        assert_eq!(message.as_text(), Some("hello"));
        assert!(!assembler.is_assembling());
    }

    #[test]
    fn test_fragments_are_joined() {
        // Arrange
        let mut assembler = MessageAssembler::new(1024);

        // Act
        let first = assembler.push(Frame::binary(vec![1, 2]).with_final(false)).unwrap();
        let middle = assembler
            .push(Frame::new(Opcode::Continuation, vec![3]).with_final(false))
            .unwrap();
        let last = assembler.push(Frame::new(Opcode::Continuation, vec![4])).unwrap();

        // Assert
        assert!(first.is_none());
        assert!(middle.is_none());
        assert_eq!(last, Some(Message::binary(vec![1, 2, 3, 4])));
    }

    #[test]
    fn test_continuation_without_start_is_error() {
        let mut assembler = MessageAssembler::new(1024);
        assert_eq!(
            assembler.push(Frame::new(Opcode::Continuation, vec![1])),
            Err(AssemblyError::UnexpectedContinuation)
        );
    }

    #[test]
    fn test_new_message_during_fragments_is_error() {
        let mut assembler = MessageAssembler::new(1024);
        assembler.push(Frame::text("a").with_final(false)).unwrap();
        assert_eq!(
            assembler.push(Frame::text("b")),
            Err(AssemblyError::ExpectedContinuation)
        );
    }

    #[test]
    fn test_limit_applies_across_fragments() {
        let mut assembler = MessageAssembler::new(4);
        assembler.push(Frame::binary(vec![0; 3]).with_final(false)).unwrap();
        let err = assembler
            .push(Frame::new(Opcode::Continuation, vec![0; 2]))
            .unwrap_err();
        assert_eq!(err, AssemblyError::MessageTooBig { size: 5, limit: 4 });
        assert_eq!(err.close_code(), CloseCode::MessageTooBig);
        assert!(!assembler.is_assembling());
    }

    #[test]
    fn test_invalid_utf8_text_is_rejected() {
        let mut assembler = MessageAssembler::new(1024);
        let err = assembler
            .push(Frame::new(Opcode::Text, vec![0xFF, 0xFE]))
            .unwrap_err();
        assert_eq!(err, AssemblyError::InvalidUtf8);
        assert_eq!(err.close_code(), CloseCode::InvalidPayload);
    }

    #[test]
    fn test_utf8_split_across_fragments_is_accepted() {
        let bytes = "é".as_bytes();
        let mut assembler = MessageAssembler::new(1024);
        assembler
            .push(Frame::new(Opcode::Text, vec![bytes[0]]).with_final(false))
            .unwrap();
        let message = assembler
            .push(Frame::new(Opcode::Continuation, vec![bytes[1]]))
            .unwrap()
            .unwrap();
        assert_eq!(message.as_text(), Some("é"));
    }

    #[test]
    fn test_control_frame_keeps_pending_message() {
        let mut assembler = MessageAssembler::new(1024);
        assembler.push(Frame::text("a").with_final(false)).unwrap();

        assert_eq!(
            assembler.push(Frame::ping(vec![])),
            Err(AssemblyError::NotDataFrame(Opcode::Ping))
        );
        assert!(assembler.is_assembling());
    }

    #[test]
    fn test_binary_message_has_no_text() {
        assert_eq!(Message::binary(b"abc".to_vec()).as_text(), None);
        assert_eq!(MessageKind::Binary.opcode(), Opcode::Binary);
    }
}
