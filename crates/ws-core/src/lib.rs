//! # ws-core
//!
//! Shared protocol engine for the WebSocket server and client: the RFC 6455
//! frame codec, payload masking, close codes and the HTTP upgrade handshake
//! primitives.
//!
//! This crate has no sockets, threads or event loops.  Everything here works
//! on byte slices, which keeps it usable from the `mio` reactor in
//! `ws-server` and from the async driver in `ws-client` alike.
//!
//! # Architecture overview
//!
//! - **`protocol::frame`** – Bit-exact encoding and incremental decoding of
//!   WebSocket frames.  Decoding never assumes a whole frame is present: any
//!   accessor that would read past the buffered bytes reports
//!   [`FrameError::NeedMoreData`] instead.
//!
//! - **`protocol::mask`** – The 4-byte XOR mask applied to client-to-server
//!   payloads, and mask-key generation from the OS random source.
//!
//! - **`protocol::close`** – Close status codes and close-frame payloads.
//!
//! - **`protocol::message`** – Reassembly of fragmented data frames into
//!   text and binary messages, shared by both endpoints.
//!
//! - **`protocol::handshake`** – Parsing and rendering of the HTTP Upgrade
//!   request/response pair and the `Sec-WebSocket-Accept` computation.

pub mod protocol;

pub use protocol::close::{CloseCode, CloseFrame};
pub use protocol::frame::{decode_frame, encode_frame, Frame, FrameBuffer, FrameError, Opcode};
pub use protocol::handshake::{
    compute_accept_key, ClientHandshake, HandshakeError, HandshakeRequest, HandshakeResponse,
};
pub use protocol::mask::{apply_mask, generate_mask_key, MaskKey};
pub use protocol::message::{AssemblyError, Message, MessageAssembler, MessageKind};
