//! Protocol module containing the frame codec, masking, close codes, message
//! reassembly and the upgrade handshake.

pub mod close;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod message;

pub use close::{CloseCode, CloseFrame};
pub use frame::{
    decode_frame, encode_frame, encode_frame_with_key, Frame, FrameBuffer, FrameError, FrameView,
    Opcode,
};
pub use handshake::{
    compute_accept_key, negotiate, ClientHandshake, HandshakeError, HandshakeRequest,
    HandshakeResponse, Negotiation,
};
pub use mask::{apply_mask, generate_mask_key, MaskKey};
pub use message::{AssemblyError, Message, MessageAssembler, MessageKind};
